use super::roles::{Role, RoleCapabilities, resolve_role};
use crate::budget::{AnomalyConfig, AnomalyDetector, AnomalyFlag, BudgetLedger, Reservation};
use crate::tools::{
    CapabilityDenial, CapabilityPolicy, ErrorCode, InvocationContext, ToolDefinition, ToolError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Policy configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Per-role capability overrides
    pub roles: BTreeMap<Role, RoleCapabilities>,

    /// Per-tenant restrictions
    pub tenants: BTreeMap<String, TenantPolicy>,

    /// Cost anomaly heuristics
    pub anomaly: AnomalyConfig,
}

/// Per-tenant restrictions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantPolicy {
    /// Tools the tenant may never invoke
    pub deny_tools: BTreeSet<String>,
}

/// Record of one policy evaluation.
///
/// Produced once per invocation attempt and consumed by the audit chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// Whether the invocation may proceed
    pub allowed: bool,

    /// Denial reason code
    pub reason: Option<ErrorCode>,

    /// Rule or capability that decided the outcome
    pub matched_rule: String,

    /// Human-readable detail
    pub message: Option<String>,

    /// Cost reserved (or requested, for budget denials)
    pub estimated_cost: u64,

    /// Cost actually charged, filled in after settlement
    pub actual_cost: Option<u64>,

    /// Advisory anomaly flags
    #[serde(default)]
    pub anomaly_flags: Vec<AnomalyFlag>,

    /// When the decision was made
    pub evaluated_at: DateTime<Utc>,
}

impl PolicyDecision {
    /// An allow decision
    pub fn allow(matched_rule: impl Into<String>, estimated_cost: u64) -> Self {
        Self {
            allowed: true,
            reason: None,
            matched_rule: matched_rule.into(),
            message: None,
            estimated_cost,
            actual_cost: None,
            anomaly_flags: Vec::new(),
            evaluated_at: Utc::now(),
        }
    }

    /// A deny decision
    pub fn deny(
        reason: ErrorCode,
        matched_rule: impl Into<String>,
        message: impl Into<String>,
        estimated_cost: u64,
    ) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            matched_rule: matched_rule.into(),
            message: Some(message.into()),
            estimated_cost,
            actual_cost: None,
            anomaly_flags: Vec::new(),
            evaluated_at: Utc::now(),
        }
    }

    /// Record the settled cost
    pub fn with_actual_cost(mut self, cost: u64) -> Self {
        self.actual_cost = Some(cost);
        self
    }

    /// Attach anomaly flags
    pub fn with_anomaly_flags(mut self, flags: Vec<AnomalyFlag>) -> Self {
        self.anomaly_flags = flags;
        self
    }
}

/// The invocation may proceed; the reservation must be settled or dropped
#[derive(Debug)]
pub struct Admission {
    /// The allow decision
    pub decision: PolicyDecision,
    /// Budget held for the invocation
    pub reservation: Reservation,
}

/// The invocation was denied
#[derive(Debug, Clone)]
pub struct Denial {
    /// The deny decision
    pub decision: PolicyDecision,
    /// Structured error returned to the caller
    pub error: ToolError,
}

impl Denial {
    fn new(decision: PolicyDecision, error: ToolError) -> Self {
        tracing::warn!(
            code = %error.code,
            rule = %decision.matched_rule,
            message = %error.message,
            "Policy denied invocation"
        );
        Self { decision, error }
    }
}

/// Composes capability, budget, tenant-scope and anomaly checks into one
/// allow/deny decision.
///
/// The gate never runs the tool. Its only side effects are the budget
/// reservation it takes and the anomaly history it reads.
#[derive(Debug)]
pub struct PolicyGate {
    config: PolicyConfig,
    ledger: Arc<BudgetLedger>,
    anomaly: Arc<AnomalyDetector>,
}

impl PolicyGate {
    /// Create a gate over `ledger`
    pub fn new(config: PolicyConfig, ledger: Arc<BudgetLedger>) -> Self {
        let anomaly = Arc::new(AnomalyDetector::new(config.anomaly.clone()));
        Self {
            config,
            ledger,
            anomaly,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// The budget ledger the gate reserves against
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// The anomaly detector
    pub fn anomaly(&self) -> &Arc<AnomalyDetector> {
        &self.anomaly
    }

    /// Capability policy for `role`
    pub fn resolve(&self, role: Role) -> CapabilityPolicy {
        resolve_role(role, &self.config.roles)
    }

    /// Feed a settled cost into the tenant's anomaly history
    pub fn record_cost(&self, tenant: &str, cost: u64) {
        self.anomaly.record(tenant, cost);
    }

    /// Evaluate an invocation: capability, then budget, then tenant scoping,
    /// then anomaly heuristics. The first failing check decides.
    ///
    /// Any denial after the reservation was taken releases it.
    pub fn evaluate(
        &self,
        ctx: &InvocationContext,
        definition: &ToolDefinition,
        input: &Value,
    ) -> Result<Admission, Denial> {
        let cost = definition.estimated_cost;
        let tenant = ctx.tenant_id.as_str();

        let policy = self.resolve(ctx.role);
        match policy.check_all(&definition.required_capabilities) {
            Ok(()) => {}
            Err(CapabilityDenial::Forbidden(caps)) => {
                let message = format!(
                    "Role '{}' is forbidden capabilities [{}] required by '{}'",
                    ctx.role,
                    caps.names(),
                    definition.name
                );
                return Err(Denial::new(
                    PolicyDecision::deny(
                        ErrorCode::Forbidden,
                        format!("capability_forbidden:{}", caps.names()),
                        &message,
                        cost,
                    ),
                    ToolError::new(ErrorCode::Forbidden, message).with_context(
                        serde_json::json!({ "role": ctx.role, "capabilities": caps }),
                    ),
                ));
            }
            Err(CapabilityDenial::Missing(caps)) => {
                let message = format!(
                    "Role '{}' lacks capabilities [{}] required by '{}'",
                    ctx.role,
                    caps.names(),
                    definition.name
                );
                return Err(Denial::new(
                    PolicyDecision::deny(
                        ErrorCode::CapabilityMissing,
                        format!("capability_missing:{}", caps.names()),
                        &message,
                        cost,
                    ),
                    ToolError::new(ErrorCode::CapabilityMissing, message).with_context(
                        serde_json::json!({ "role": ctx.role, "capabilities": caps }),
                    ),
                ));
            }
        }

        if let Some(tenant_policy) = self.config.tenants.get(tenant)
            && tenant_policy.deny_tools.contains(&definition.name)
        {
            let message = format!(
                "Tool '{}' is denied for tenant '{}'",
                definition.name, tenant
            );
            return Err(Denial::new(
                PolicyDecision::deny(
                    ErrorCode::Forbidden,
                    format!("tenant_deny_list:{}", definition.name),
                    &message,
                    cost,
                ),
                ToolError::new(ErrorCode::Forbidden, message),
            ));
        }

        let reservation = match self.ledger.check_and_reserve(tenant, cost) {
            Ok(reservation) => reservation,
            Err(error) => {
                return Err(Denial::new(
                    PolicyDecision::deny(ErrorCode::BudgetExceeded, "budget", &error.message, cost),
                    error,
                ));
            }
        };

        if let Err((pointer, owner)) = check_tenant_scope(tenant, &definition.tenant_scoped, input) {
            reservation.release();
            let message = format!(
                "Input '{}' references a resource owned by '{}', not tenant '{}'",
                pointer, owner, tenant
            );
            return Err(Denial::new(
                PolicyDecision::deny(
                    ErrorCode::TenantMismatch,
                    format!("tenant_scope:{}", pointer),
                    &message,
                    cost,
                ),
                ToolError::new(ErrorCode::TenantMismatch, message)
                    .with_context(serde_json::json!({ "pointer": pointer, "owner": owner })),
            ));
        }

        let flags = self.anomaly.assess(tenant, cost);
        if !flags.is_empty() && self.anomaly.config().block {
            reservation.release();
            let message = format!(
                "Cost {} for '{}' flagged as anomalous: {}",
                cost,
                definition.name,
                flags
                    .iter()
                    .map(|f| f.to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            );
            return Err(Denial::new(
                PolicyDecision::deny(ErrorCode::Forbidden, "anomaly_block", &message, cost)
                    .with_anomaly_flags(flags),
                ToolError::new(ErrorCode::Forbidden, message),
            ));
        }

        tracing::debug!(
            tenant,
            tool = %definition.name,
            role = %ctx.role,
            cost,
            flags = flags.len(),
            "Policy allowed invocation"
        );
        Ok(Admission {
            decision: PolicyDecision::allow(format!("role:{}", ctx.role), cost)
                .with_anomaly_flags(flags),
            reservation,
        })
    }
}

/// Check every tenant-scoped pointer in `input` against `tenant`.
///
/// A string value is owned by its first segment (`acme/docs/a.txt` and
/// `acme:doc-1` both belong to `acme`); an object names its owner in
/// `tenant_id`; arrays are checked element by element. Absent pointers are
/// fine. Anything else fails closed. Returns the offending pointer and the
/// owner that was found.
pub fn check_tenant_scope(
    tenant: &str,
    pointers: &[String],
    input: &Value,
) -> Result<(), (String, String)> {
    for pointer in pointers {
        let Some(value) = input.pointer(pointer) else {
            continue;
        };
        let values: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for value in values {
            match resource_owner(value) {
                Some(owner) if owner == tenant => {}
                Some(owner) => return Err((pointer.clone(), owner.to_string())),
                None => return Err((pointer.clone(), "<unknown>".to_string())),
            }
        }
    }
    Ok(())
}

fn resource_owner(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => s.split(['/', ':']).next(),
        Value::Object(map) => map.get("tenant_id").and_then(Value::as_str),
        _ => None,
    }
}
