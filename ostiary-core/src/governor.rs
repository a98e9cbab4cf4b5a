//! Governed invocation surface
//!
//! The [`Governor`] owns one instance of every pipeline component and runs
//! each invocation through them in a fixed order:
//!
//! 1. registry lookup
//! 2. sandbox depth, then chain length
//! 3. input schema
//! 4. policy gate (capability, budget, tenant scope, anomaly)
//! 5. replay cache for pure tools
//! 6. circuit breaker for provider-backed tools
//! 7. handler, under timeout and cancellation
//! 8. output schema and size
//! 9. settlement, audit append, metering
//!
//! Every outcome, denials included, is appended to the audit chain before
//! the envelope is returned. Governed failures are values in the envelope;
//! the only `Err` is a failed audit append.
//!
//! # Example
//!
//! ```rust
//! use ostiary_core::governor::Governor;
//! use ostiary_core::policy::Role;
//! use ostiary_core::tools::{
//!     HandlerOutput, InvocationContext, SideEffect, ToolDefinition, handler_fn,
//! };
//! use semver::Version;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> ostiary_core::Result<()> {
//! let governor = Governor::builder().build()?;
//! governor.registry().register(
//!     ToolDefinition::new("echo", Version::new(1, 0, 0), SideEffect::Pure),
//!     handler_fn(|_ctx, input| async move { Ok(HandlerOutput::new(input)) }),
//! )?;
//!
//! let ctx = InvocationContext::new("acme", Role::Viewer);
//! let envelope = governor.invoke(&ctx, "echo", json!({"hello": "world"})).await?;
//! assert_eq!(envelope.value(), Some(&json!({"hello": "world"})));
//! assert!(governor.verify_audit().valid);
//! # Ok(())
//! # }
//! ```

use crate::audit::{
    AuditChain, AuditDecision, AuditEventKind, AuditOutcome, AuditPayload, AuditRecord,
    IntegrityReport,
};
use crate::budget::{BudgetLedger, BudgetSummary};
use crate::config::OstiaryConfig;
use crate::error::Result;
use crate::fingerprint::fingerprint;
use crate::llm::{BreakerRegistry, BreakerSummary, CircuitBreaker};
use crate::metering::{MeterEvent, MeterLog};
use crate::policy::{Admission, PolicyDecision, PolicyGate};
use crate::replay::{ReplayCache, replay_key};
use crate::sandbox::SandboxGuard;
use crate::skills::{SkillRunResult, SkillRunner, ToolInvoker};
use crate::store::SharedStore;
use crate::tools::{
    CacheStatus, ErrorCode, HandlerOutput, InvocationContext, RegisteredTool, SkillSummary,
    ToolError, ToolProvenance, ToolRegistry, ToolResultEnvelope, ToolSummary, ToolWarning,
};
use async_trait::async_trait;
use chrono::Utc;
use semver::Version;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`Governor`]
#[derive(Default)]
pub struct GovernorBuilder {
    config: OstiaryConfig,
    registry: Option<Arc<ToolRegistry>>,
    store: Option<SharedStore>,
}

impl GovernorBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set configuration
    pub fn config(mut self, config: OstiaryConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing registry
    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Persist budget, breaker and audit state in `store`, overriding the
    /// configured backend
    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the configuration, open durable state and assemble the
    /// pipeline.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, an unreadable store, or a stored
    /// audit chain that does not verify.
    pub fn build(self) -> Result<Governor> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => Some(store),
            None if config.store != Default::default() => Some(config.store.open()?),
            None => None,
        };

        let mut ledger = BudgetLedger::new(config.budget.clone());
        let mut breakers = BreakerRegistry::new(config.breaker.clone());
        let audit = match &store {
            Some(store) => {
                ledger = ledger.with_store(Arc::clone(store));
                breakers = breakers.with_store(Arc::clone(store));
                AuditChain::open(Arc::clone(store))?
            }
            None => AuditChain::new(),
        };

        let registry = self.registry.unwrap_or_default();
        let ledger = Arc::new(ledger);
        let audit = Arc::new(audit);

        tracing::info!(
            tools = registry.len(),
            audit_records = audit.len(),
            durable = store.is_some(),
            "Governor ready"
        );

        Ok(Governor {
            sandbox: SandboxGuard::new(config.sandbox.clone()),
            gate: PolicyGate::new(config.policy.clone(), Arc::clone(&ledger)),
            replay: ReplayCache::new(config.replay.clone()),
            skills: SkillRunner::new(Arc::clone(&registry), Arc::clone(&audit)),
            meter: MeterLog::new(),
            breakers,
            ledger,
            audit,
            registry,
            config,
        })
    }
}

/// How an invocation ended, before it is recorded
enum Completion {
    Succeeded(Value),
    Failed(ToolError),
    Cancelled(String),
}

/// Why an invocation never reached its handler
struct Rejection {
    error: ToolError,
    decision: PolicyDecision,
}

impl Rejection {
    /// A pre-gate refusal, recorded as a deny decision naming `rule`
    fn refused(error: ToolError, rule: &str, estimated_cost: u64) -> Self {
        let decision = PolicyDecision::deny(error.code, rule, error.message.clone(), estimated_cost);
        Self { error, decision }
    }
}

/// The governance pipeline
pub struct Governor {
    config: OstiaryConfig,
    registry: Arc<ToolRegistry>,
    sandbox: SandboxGuard,
    gate: PolicyGate,
    ledger: Arc<BudgetLedger>,
    breakers: BreakerRegistry,
    replay: ReplayCache,
    audit: Arc<AuditChain>,
    meter: MeterLog,
    skills: SkillRunner,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("tools", &self.registry.len())
            .field("audit_len", &self.audit.len())
            .field("replay_entries", &self.replay.len())
            .finish()
    }
}

impl Governor {
    /// Create a builder
    pub fn builder() -> GovernorBuilder {
        GovernorBuilder::new()
    }

    /// The configuration the governor was built with
    pub fn config(&self) -> &OstiaryConfig {
        &self.config
    }

    /// The tool and skill registry
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The audit chain
    pub fn audit(&self) -> &Arc<AuditChain> {
        &self.audit
    }

    /// The per-tenant budget ledger
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// Circuit breakers, one per provider
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// The replay cache for pure tools
    pub fn replay(&self) -> &ReplayCache {
        &self.replay
    }

    /// Usage events of charged invocations
    pub fn meter(&self) -> &MeterLog {
        &self.meter
    }

    /// The sandbox guard
    pub fn sandbox(&self) -> &SandboxGuard {
        &self.sandbox
    }

    /// Invoke the highest registered version of `tool`
    ///
    /// # Errors
    ///
    /// Only when the audit record cannot be persisted; the result is then
    /// withheld.
    pub async fn invoke(
        &self,
        ctx: &InvocationContext,
        tool: &str,
        input: Value,
    ) -> Result<ToolResultEnvelope> {
        self.invoke_version(ctx, tool, None, input).await
    }

    /// Invoke `tool`, pinned to `version` when given
    ///
    /// # Errors
    ///
    /// Only when the audit record cannot be persisted.
    pub async fn invoke_version(
        &self,
        ctx: &InvocationContext,
        tool: &str,
        version: Option<&Version>,
        input: Value,
    ) -> Result<ToolResultEnvelope> {
        let input_fingerprint = fingerprint(&input);
        let mut provenance = ToolProvenance::new(
            tool,
            input_fingerprint,
            &ctx.tenant_id,
            &ctx.trace_id,
            &ctx.run_id,
        )
        .with_depth(ctx.depth.saturating_add(1));

        if ctx.is_cancelled() {
            let reason = "Cancelled before execution".to_string();
            return self.complete(ctx, provenance, Completion::Cancelled(reason), 0, Vec::new());
        }

        let lookup = match version {
            Some(version) => self.registry.lookup_version(tool, version),
            None => self.registry.lookup(tool),
        };
        let registered = match lookup {
            Ok(registered) => registered,
            Err(e) => {
                tracing::warn!(tenant = %ctx.tenant_id, tool, "Unknown tool");
                let completion = Completion::Failed(e.into());
                return self.complete(ctx, provenance, completion, 0, Vec::new());
            }
        };
        let definition = registered.definition();
        provenance = provenance.with_tool(definition.version.to_string(), registered.digest());

        let (child, admission) = match self.admit(ctx, &registered, &input) {
            Ok(admitted) => admitted,
            Err(rejection) => {
                provenance = provenance.with_decision(rejection.decision);
                let completion = Completion::Failed(rejection.error);
                return self.complete(ctx, provenance, completion, 0, Vec::new());
            }
        };
        let Admission {
            decision,
            reservation,
        } = admission;

        match self.execute(ctx, &registered, child, input).await {
            Ok((output, cache)) => {
                provenance.cache = cache;
                let settlement = if cache.served_from_cache() {
                    reservation.release()
                } else {
                    let actual = output.cost.unwrap_or(definition.estimated_cost);
                    self.gate.record_cost(&ctx.tenant_id, actual);
                    reservation.settle(actual)
                };

                let mut warnings = Vec::new();
                if settlement.overrun {
                    tracing::warn!(
                        tenant = %ctx.tenant_id,
                        tool = %definition.name,
                        actual = output.cost,
                        "Actual cost exceeded remaining budget; excess not charged"
                    );
                    warnings.push(
                        ToolWarning::new(
                            "BUDGET_OVERRUN",
                            "Actual cost exceeded the remaining budget",
                        )
                        .with_context(json!({
                            "estimated": definition.estimated_cost,
                            "actual": output.cost,
                            "charged": settlement.charged,
                        })),
                    );
                }

                provenance = provenance.with_decision(decision.with_actual_cost(settlement.charged));
                let completion = Completion::Succeeded(output.value);
                self.complete(ctx, provenance, completion, settlement.charged, warnings)
            }
            Err(error) => {
                // Failed and cancelled executions are not charged
                reservation.release();
                provenance = provenance.with_decision(decision.with_actual_cost(0));
                let completion = if error.code == ErrorCode::Cancelled {
                    Completion::Cancelled(error.message)
                } else {
                    Completion::Failed(error)
                };
                self.complete(ctx, provenance, completion, 0, Vec::new())
            }
        }
    }

    /// Sandbox, schema and policy checks; on success returns the child
    /// context the handler runs with and the held reservation
    fn admit(
        &self,
        ctx: &InvocationContext,
        registered: &RegisteredTool,
        input: &Value,
    ) -> std::result::Result<(InvocationContext, Admission), Rejection> {
        let definition = registered.definition();
        let cost = definition.estimated_cost;

        let child = self
            .sandbox
            .check_depth(ctx)
            .map_err(|e| Rejection::refused(e, "sandbox:depth", cost))?;
        self.sandbox
            .check_chain_length(ctx)
            .map_err(|e| Rejection::refused(e, "sandbox:chain_length", cost))?;
        self.sandbox
            .check_path(ctx, definition, input)
            .map_err(|e| Rejection::refused(e, "sandbox:path", cost))?;

        if let Err(errors) = registered.input_schema().validate(input) {
            tracing::warn!(
                tenant = %ctx.tenant_id,
                tool = %definition.name,
                errors = errors.len(),
                "Input failed schema validation"
            );
            let error = ToolError::schema_violation(errors);
            return Err(Rejection::refused(error, "input_schema", cost));
        }

        let admission = self
            .gate
            .evaluate(ctx, definition, input)
            .map_err(|denial| Rejection {
                error: denial.error,
                decision: denial.decision,
            })?;
        Ok((child, admission))
    }

    /// Run the handler, through the replay cache when the tool is eligible,
    /// racing the caller's cancellation token
    async fn execute(
        &self,
        ctx: &InvocationContext,
        registered: &Arc<RegisteredTool>,
        child: InvocationContext,
        input: Value,
    ) -> std::result::Result<(HandlerOutput, CacheStatus), ToolError> {
        let definition = registered.definition();
        let timeout = definition
            .timeout
            .unwrap_or(self.config.runtime.default_timeout);
        let breaker = definition
            .provider
            .as_deref()
            .map(|provider| self.breakers.breaker(provider));

        let execution = async {
            if self.replay.is_eligible(definition) {
                let key = replay_key(&definition.name, &definition.version, &input);
                // A shared execution must not observe any one caller's cancellation.
                let mut shared = child;
                shared.cancellation = None;
                let tool = Arc::clone(registered);
                let replayed = self
                    .replay
                    .execute(&key, definition.max_output_bytes, move || {
                        run_handler(tool, shared, input, timeout, breaker)
                    })
                    .await?;
                Ok((replayed.output, replayed.status))
            } else {
                let output =
                    run_handler(Arc::clone(registered), child, input, timeout, breaker).await?;
                Ok((output, CacheStatus::Bypass))
            }
        };

        match &ctx.cancellation {
            Some(token) => tokio::select! {
                _ = token.cancelled() => {
                    Err(ToolError::new(ErrorCode::Cancelled, "Execution cancelled"))
                }
                result = execution => result,
            },
            None => execution.await,
        }
    }

    /// Append the audit record, meter the invocation and build the envelope
    fn complete(
        &self,
        ctx: &InvocationContext,
        mut provenance: ToolProvenance,
        completion: Completion,
        charged: u64,
        warnings: Vec<ToolWarning>,
    ) -> Result<ToolResultEnvelope> {
        provenance.duration = (Utc::now() - provenance.started_at)
            .to_std()
            .unwrap_or_default();

        let mut payload = AuditPayload::new(
            AuditEventKind::ToolInvocation,
            ctx,
            provenance.tool_name.clone(),
            provenance.input_fingerprint.clone(),
            provenance.started_at,
        );
        payload.depth = provenance.depth;
        payload.subject_version = provenance.tool_version.clone();
        payload.subject_digest = provenance.tool_digest.clone();
        payload.decision = provenance.decision.as_ref().map(AuditDecision::from);
        payload.cache = provenance.cache;
        payload.charged = charged;

        let error_code = match &completion {
            Completion::Succeeded(value) => {
                let result_fingerprint = fingerprint(value);
                payload.result_fingerprint = Some(result_fingerprint.clone());
                provenance.result_fingerprint = Some(result_fingerprint);
                None
            }
            Completion::Failed(error) => {
                payload.outcome = if error.code.is_denial() {
                    AuditOutcome::Denied
                } else {
                    AuditOutcome::Failed
                };
                Some(error.code)
            }
            Completion::Cancelled(_) => {
                payload.outcome = AuditOutcome::Cancelled;
                Some(ErrorCode::Cancelled)
            }
        };
        payload.reason = error_code;
        payload.finished_at = Utc::now();

        let record = self.audit.append(payload)?;
        provenance.audit_index = Some(record.index);

        let idempotency_key = MeterEvent::idempotency_key(
            &ctx.tenant_id,
            &ctx.trace_id,
            &provenance.tool_name,
            provenance.tool_version.as_deref().unwrap_or_default(),
            &provenance.input_fingerprint,
        );
        self.meter.record(
            MeterEvent::new(
                &ctx.tenant_id,
                &provenance.tool_name,
                idempotency_key,
                error_code,
                provenance.cache,
                charged,
            )
            .with_trace(&ctx.trace_id, &ctx.run_id),
        );

        tracing::debug!(
            tenant = %ctx.tenant_id,
            tool = %provenance.tool_name,
            audit_index = record.index,
            cache = ?provenance.cache,
            code = ?error_code,
            charged,
            "Invocation recorded"
        );

        let envelope = match completion {
            Completion::Succeeded(value) => ToolResultEnvelope::success(value, provenance),
            Completion::Failed(error) => ToolResultEnvelope::error(error, provenance),
            Completion::Cancelled(reason) => ToolResultEnvelope::cancelled(reason, provenance),
        };
        Ok(envelope.with_warnings(warnings))
    }

    /// Run the highest registered version of skill `name`
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` (as [`crate::OstiaryError::Governance`]) for an unknown
    /// skill, or a failed audit append.
    pub async fn run_skill(
        &self,
        ctx: &InvocationContext,
        name: &str,
        input: Value,
    ) -> Result<SkillRunResult> {
        let skill = self.registry.lookup_skill(name).map_err(ToolError::from)?;
        self.skills.run(self, ctx, &skill, input).await
    }

    /// Summaries of all registered tools
    pub fn list_tools(&self) -> Vec<ToolSummary> {
        self.registry.summaries()
    }

    /// Summaries of all registered skills
    pub fn list_skills(&self) -> Vec<SkillSummary> {
        self.registry
            .list_skills()
            .iter()
            .map(|s| s.summary())
            .collect()
    }

    /// Audit records sharing `trace_id`, in chain order
    pub fn audit_for_trace(&self, trace_id: &str) -> Vec<Arc<AuditRecord>> {
        self.audit.records_for_trace(trace_id)
    }

    /// Every audit record, in chain order
    pub fn audit_records(&self) -> Vec<Arc<AuditRecord>> {
        self.audit.records()
    }

    /// Recompute the hash chain
    pub fn verify_audit(&self) -> IntegrityReport {
        self.audit.verify()
    }

    /// State of every breaker created so far
    pub fn breaker_summaries(&self) -> Vec<BreakerSummary> {
        self.breakers.summaries()
    }

    /// Budgets of every tenant seen so far
    pub fn budget_summaries(&self) -> Vec<BudgetSummary> {
        self.ledger.summaries()
    }

    /// Budget of one tenant
    pub fn budget_summary(&self, tenant: &str) -> BudgetSummary {
        self.ledger.summary(tenant)
    }

    /// Recorded meter events
    pub fn meter_events(&self) -> Vec<MeterEvent> {
        self.meter.events()
    }
}

#[async_trait]
impl ToolInvoker for Governor {
    async fn invoke_tool(
        &self,
        ctx: &InvocationContext,
        tool: &str,
        version: Option<&Version>,
        input: Value,
    ) -> Result<ToolResultEnvelope> {
        self.invoke_version(ctx, tool, version, input).await
    }
}

/// Call the handler under `timeout` and check its output, reporting the
/// outcome to the provider's breaker
async fn run_handler(
    tool: Arc<RegisteredTool>,
    ctx: InvocationContext,
    input: Value,
    timeout: Duration,
    breaker: Option<Arc<CircuitBreaker>>,
) -> std::result::Result<HandlerOutput, ToolError> {
    let permit = breaker.as_ref().map(|b| b.try_acquire()).transpose()?;

    let result = match tokio::time::timeout(timeout, tool.handler().handle(&ctx, input)).await {
        Ok(Ok(output)) => check_output(&tool, output),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(ToolError::timeout(timeout)),
    };

    if let Some(permit) = permit {
        match &result {
            Err(e) if matches!(e.code, ErrorCode::ToolExecutionFailed | ErrorCode::ToolTimeout) => {
                permit.failure()
            }
            _ => permit.success(),
        }
    }
    result
}

fn check_output(
    tool: &RegisteredTool,
    output: HandlerOutput,
) -> std::result::Result<HandlerOutput, ToolError> {
    let definition = tool.definition();
    if let Err(errors) = tool.output_schema().validate(&output.value) {
        tracing::warn!(tool = %definition.name, errors = errors.len(), "Output failed schema validation");
        return Err(ToolError::output_invalid(errors));
    }

    let size = serde_json::to_vec(&output.value).map_or(usize::MAX, |bytes| bytes.len());
    if size > definition.max_output_bytes {
        tracing::warn!(
            tool = %definition.name,
            size,
            max = definition.max_output_bytes,
            "Output exceeds size limit"
        );
        return Err(ToolError::new(
            ErrorCode::ToolOutputInvalid,
            format!(
                "Output of {} bytes exceeds the {} byte limit",
                size, definition.max_output_bytes
            ),
        )
        .with_context(json!({ "size": size, "max_output_bytes": definition.max_output_bytes })));
    }
    Ok(output)
}
