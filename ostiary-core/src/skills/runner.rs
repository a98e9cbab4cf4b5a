//! Skill execution
//!
//! Steps run strictly in order. Tool steps go through the full governed
//! pipeline via [`ToolInvoker`]; assertions read the output bag. The first
//! failing step halts the run, after which rollback steps run in reverse
//! order, best-effort. One `skill_run` audit record covers the whole run.

use super::skill::{AssertPhase, AssertStep, SkillStep, ToolStep, render_template};
use crate::Result;
use crate::audit::{AuditChain, AuditEventKind, AuditOutcome, AuditPayload};
use crate::fingerprint::fingerprint;
use crate::tools::{
    ErrorCode, InvocationContext, RegisteredSkill, ToolError, ToolRegistry, ToolResult,
    ToolResultEnvelope,
};
use async_trait::async_trait;
use chrono::Utc;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Bag key holding the skill's own input
pub const INPUT_KEY: &str = "input";

/// Something that can run one governed tool invocation.
///
/// An `Err` is fatal to the whole run (audit persistence); denials and tool
/// failures come back as error envelopes.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke_tool(
        &self,
        ctx: &InvocationContext,
        tool: &str,
        version: Option<&Version>,
        input: Value,
    ) -> Result<ToolResultEnvelope>;
}

/// Skill run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running { step: usize },
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Tool,
    Assert,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Rollback step whose input referenced outputs that were never produced
    Skipped,
}

/// What happened to one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub kind: StepKind,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    /// Audit record of the tool invocation, for tool and rollback steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_index: Option<u64>,
}

impl StepOutcome {
    fn new(step_id: &str, kind: StepKind, status: StepStatus) -> Self {
        Self {
            step_id: step_id.to_string(),
            kind,
            status,
            error: None,
            audit_index: None,
        }
    }

    fn with_error(mut self, error: ToolError) -> Self {
        self.error = Some(error);
        self
    }

    fn with_audit_index(mut self, index: Option<u64>) -> Self {
        self.audit_index = index;
        self
    }

    fn digest(&self) -> Value {
        json!({
            "id": self.step_id,
            "kind": self.kind,
            "status": self.status,
            "code": self.error.as_ref().map(|e| e.code),
        })
    }
}

/// Result of a skill run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRunResult {
    pub skill: String,
    pub version: Version,
    pub trace_id: String,
    pub run_id: String,
    /// `Complete` or `Failed`
    pub state: RunState,
    pub steps: Vec<StepOutcome>,
    pub rollback: Vec<StepOutcome>,
    /// Output bag: step results by output key, plus the run input
    pub outputs: Map<String, Value>,
    /// Error that halted the run
    pub error: Option<ToolError>,
    /// Cost charged across all tool steps
    pub charged: u64,
    /// Index of the `skill_run` audit record
    pub audit_index: u64,
}

impl SkillRunResult {
    /// Whether every step succeeded
    pub fn is_complete(&self) -> bool {
        self.state == RunState::Complete
    }

    /// Output stored under `key`
    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    /// Rollback steps that failed
    pub fn rollback_failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.rollback
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
    }
}

/// In-flight run bookkeeping
struct Run {
    state: RunState,
    bag: Map<String, Value>,
    steps: Vec<StepOutcome>,
    rollback: Vec<StepOutcome>,
    error: Option<ToolError>,
    charged: u64,
}

impl Run {
    fn bag_value(&self) -> Value {
        Value::Object(self.bag.clone())
    }

    fn fail(&mut self, error: ToolError) {
        self.state = RunState::Failed;
        self.error = Some(error);
    }
}

/// Runs skills against a registry, recording each run in the audit chain
pub struct SkillRunner {
    registry: Arc<ToolRegistry>,
    audit: Arc<AuditChain>,
}

impl std::fmt::Debug for SkillRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillRunner")
            .field("skills", &self.registry.list_skills().len())
            .field("audit_len", &self.audit.len())
            .finish()
    }
}

impl SkillRunner {
    pub fn new(registry: Arc<ToolRegistry>, audit: Arc<AuditChain>) -> Self {
        Self { registry, audit }
    }

    /// Run a registered skill.
    ///
    /// Step failures are reported in the returned [`SkillRunResult`]; only
    /// audit persistence failures surface as `Err`.
    pub async fn run(
        &self,
        invoker: &dyn ToolInvoker,
        ctx: &InvocationContext,
        skill: &RegisteredSkill,
        input: Value,
    ) -> Result<SkillRunResult> {
        let definition = skill.definition();
        let started_at = Utc::now();
        let input_fingerprint = fingerprint(&input);

        let mut run = Run {
            state: RunState::Pending,
            bag: Map::new(),
            steps: Vec::new(),
            rollback: Vec::new(),
            error: None,
            charged: 0,
        };
        run.bag.insert(INPUT_KEY.to_string(), input);

        tracing::info!(
            skill = %definition.name,
            version = %definition.version,
            tenant = %ctx.tenant_id,
            trace_id = %ctx.trace_id,
            "Skill run started"
        );

        let missing: Vec<&str> = definition
            .required_tools
            .iter()
            .filter(|tool| !self.registry.contains(tool))
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            run.fail(
                ToolError::not_found("tool", &missing.join(", "))
                    .with_context(json!({ "skill": definition.name, "missing": missing })),
            );
        } else {
            for (index, step) in definition.steps.iter().enumerate() {
                run.state = RunState::Running { step: index };

                if ctx.is_cancelled() {
                    run.fail(
                        ToolError::new(ErrorCode::Cancelled, "Skill run cancelled")
                            .with_context(json!({ "step": step.id() })),
                    );
                    break;
                }

                let halted = match step {
                    SkillStep::Tool(step) => self.run_tool_step(invoker, ctx, step, &mut run).await?,
                    SkillStep::Assert(step) => Self::run_assert(step, &mut run),
                };
                if halted {
                    break;
                }
            }
        }

        if run.error.is_none() {
            run.state = RunState::Complete;
        } else if !definition.rollback.is_empty() && missing.is_empty() {
            self.roll_back(invoker, ctx, &definition.rollback, &mut run)
                .await?;
        }

        let mut payload = AuditPayload::new(
            AuditEventKind::SkillRun,
            ctx,
            definition.name.clone(),
            input_fingerprint,
            started_at,
        );
        payload.subject_version = Some(definition.version.to_string());
        payload.subject_digest = Some(skill.digest().to_string());
        payload.charged = run.charged;
        payload.detail = Some(json!({
            "steps": run.steps.iter().map(StepOutcome::digest).collect::<Vec<_>>(),
            "rollback": run.rollback.iter().map(StepOutcome::digest).collect::<Vec<_>>(),
        }));
        match &run.error {
            None => {
                payload.result_fingerprint = Some(fingerprint(&run.bag_value()));
            }
            Some(error) => {
                payload.outcome = if error.code == ErrorCode::Cancelled {
                    AuditOutcome::Cancelled
                } else {
                    AuditOutcome::Failed
                };
                payload.reason = Some(error.code);
            }
        }
        payload.finished_at = Utc::now();
        let record = self.audit.append(payload)?;

        match &run.error {
            None => tracing::info!(
                skill = %definition.name,
                steps = run.steps.len(),
                charged = run.charged,
                "Skill run complete"
            ),
            Some(error) => tracing::warn!(
                skill = %definition.name,
                code = %error.code,
                error = %error.message,
                rolled_back = run.rollback.len(),
                "Skill run failed"
            ),
        }

        Ok(SkillRunResult {
            skill: definition.name.clone(),
            version: definition.version.clone(),
            trace_id: ctx.trace_id.clone(),
            run_id: ctx.run_id.clone(),
            state: run.state,
            steps: run.steps,
            rollback: run.rollback,
            outputs: run.bag,
            error: run.error,
            charged: run.charged,
            audit_index: record.index,
        })
    }

    /// Returns `true` when the step halted the run
    async fn run_tool_step(
        &self,
        invoker: &dyn ToolInvoker,
        ctx: &InvocationContext,
        step: &ToolStep,
        run: &mut Run,
    ) -> Result<bool> {
        let input = match render_template(&step.input, &run.bag_value()) {
            Ok(input) => input,
            Err(message) => {
                let error = step_failed(step, ErrorCode::SkillStepFailed, &message);
                run.steps
                    .push(StepOutcome::new(&step.id, StepKind::Tool, StepStatus::Failed).with_error(error.clone()));
                run.fail(error);
                return Ok(true);
            }
        };

        let envelope = invoker
            .invoke_tool(ctx, &step.tool, step.version.as_ref(), input)
            .await?;
        run.charged += charged(&envelope);
        let audit_index = envelope.provenance.audit_index;

        match envelope.result {
            ToolResult::Success { value } => {
                tracing::debug!(step = %step.id, tool = %step.tool, "Skill step succeeded");
                run.bag.insert(step.output_key().to_string(), value);
                run.steps.push(
                    StepOutcome::new(&step.id, StepKind::Tool, StepStatus::Succeeded)
                        .with_audit_index(audit_index),
                );
                Ok(false)
            }
            ToolResult::Error { error } => {
                let code = if error.code == ErrorCode::Cancelled {
                    ErrorCode::Cancelled
                } else {
                    ErrorCode::SkillStepFailed
                };
                let halted = step_failed(step, code, &error.message).with_context(json!({
                    "step": step.id,
                    "tool": step.tool,
                    "cause": error.code,
                }));
                run.steps.push(
                    StepOutcome::new(&step.id, StepKind::Tool, StepStatus::Failed)
                        .with_error(error)
                        .with_audit_index(audit_index),
                );
                run.fail(halted);
                Ok(true)
            }
            ToolResult::Cancelled { reason } => {
                let error = step_failed(step, ErrorCode::Cancelled, &reason);
                run.steps.push(
                    StepOutcome::new(&step.id, StepKind::Tool, StepStatus::Failed)
                        .with_error(error.clone())
                        .with_audit_index(audit_index),
                );
                run.fail(error);
                Ok(true)
            }
        }
    }

    fn run_assert(step: &AssertStep, run: &mut Run) -> bool {
        if step.predicate.evaluate(&run.bag_value()) {
            run.steps
                .push(StepOutcome::new(&step.id, StepKind::Assert, StepStatus::Succeeded));
            return false;
        }

        let (code, phase) = match step.phase {
            AssertPhase::Pre => (ErrorCode::SkillPreconditionFailed, "precondition"),
            AssertPhase::Post => (ErrorCode::SkillPostconditionFailed, "postcondition"),
        };
        let message = step
            .message
            .clone()
            .unwrap_or_else(|| format!("{} '{}' does not hold", phase, step.id));
        let error = ToolError::new(code, message).with_context(json!({ "step": step.id }));
        run.steps.push(
            StepOutcome::new(&step.id, StepKind::Assert, StepStatus::Failed).with_error(error.clone()),
        );
        run.fail(error);
        true
    }

    /// Run compensating steps in reverse order; failures are recorded and do
    /// not stop the remaining steps or replace the halting error
    async fn roll_back(
        &self,
        invoker: &dyn ToolInvoker,
        ctx: &InvocationContext,
        steps: &[ToolStep],
        run: &mut Run,
    ) -> Result<()> {
        // Rollback must still run when the caller cancelled the forward path.
        let mut rollback_ctx = ctx.clone();
        rollback_ctx.cancellation = None;

        for step in steps.iter().rev() {
            let input = match render_template(&step.input, &run.bag_value()) {
                Ok(input) => input,
                Err(message) => {
                    tracing::debug!(step = %step.id, reason = %message, "Rollback step skipped");
                    run.rollback
                        .push(StepOutcome::new(&step.id, StepKind::Rollback, StepStatus::Skipped));
                    continue;
                }
            };

            let envelope = invoker
                .invoke_tool(&rollback_ctx, &step.tool, step.version.as_ref(), input)
                .await?;
            run.charged += charged(&envelope);
            let audit_index = envelope.provenance.audit_index;

            let outcome = match envelope.into_value() {
                Ok(_) => StepOutcome::new(&step.id, StepKind::Rollback, StepStatus::Succeeded),
                Err(error) => {
                    tracing::warn!(
                        step = %step.id,
                        tool = %step.tool,
                        code = %error.code,
                        "Rollback step failed"
                    );
                    let failure = step_failed(step, ErrorCode::SkillRollbackFailed, &error.message)
                        .with_context(json!({
                            "step": step.id,
                            "tool": step.tool,
                            "cause": error.code,
                        }));
                    StepOutcome::new(&step.id, StepKind::Rollback, StepStatus::Failed)
                        .with_error(failure)
                }
            };
            run.rollback.push(outcome.with_audit_index(audit_index));
        }
        Ok(())
    }
}

fn step_failed(step: &ToolStep, code: ErrorCode, message: &str) -> ToolError {
    ToolError::new(code, format!("step '{}' ({}): {}", step.id, step.tool, message))
}

fn charged(envelope: &ToolResultEnvelope) -> u64 {
    envelope
        .provenance
        .decision
        .as_ref()
        .and_then(|d| d.actual_cost)
        .unwrap_or(0)
}
