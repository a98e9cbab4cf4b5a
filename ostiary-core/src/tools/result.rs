//! Structured result envelope and error taxonomy
//!
//! Every governed invocation produces a [`ToolResultEnvelope`]:
//! - Success/error/cancelled status
//! - Warnings that don't fail execution (advisory anomaly flags, cost overruns)
//! - Provenance metadata tying the result to its policy decision and audit record
//! - A closed error taxonomy ([`ErrorCode`]) mapped 1:1 to response and exit codes

use crate::policy::PolicyDecision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Current schema version for result envelopes
pub const RESULT_SCHEMA_VERSION: u32 = 1;

/// Structured result envelope for a governed invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultEnvelope {
    /// Schema version for forward compatibility
    pub schema_version: u32,

    /// Result status and payload
    pub result: ToolResult,

    /// Warnings that occurred but didn't fail execution
    pub warnings: Vec<ToolWarning>,

    /// Provenance metadata for tracing/audit
    pub provenance: ToolProvenance,
}

impl ToolResultEnvelope {
    /// Create a successful result envelope
    pub fn success(value: Value, provenance: ToolProvenance) -> Self {
        Self {
            schema_version: RESULT_SCHEMA_VERSION,
            result: ToolResult::Success { value },
            warnings: Vec::new(),
            provenance,
        }
    }

    /// Create an error result envelope
    pub fn error(error: ToolError, provenance: ToolProvenance) -> Self {
        Self {
            schema_version: RESULT_SCHEMA_VERSION,
            result: ToolResult::Error { error },
            warnings: Vec::new(),
            provenance,
        }
    }

    /// Create a cancelled result envelope
    pub fn cancelled(reason: String, provenance: ToolProvenance) -> Self {
        Self {
            schema_version: RESULT_SCHEMA_VERSION,
            result: ToolResult::Cancelled { reason },
            warnings: Vec::new(),
            provenance,
        }
    }

    /// Add a warning to the envelope
    pub fn with_warning(mut self, warning: ToolWarning) -> Self {
        self.warnings.push(warning);
        self
    }

    /// Add multiple warnings
    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = ToolWarning>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// Check if this result represents success
    pub fn is_success(&self) -> bool {
        matches!(self.result, ToolResult::Success { .. })
    }

    /// Check if this result represents an error
    pub fn is_error(&self) -> bool {
        matches!(self.result, ToolResult::Error { .. })
    }

    /// Check if this result represents cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self.result, ToolResult::Cancelled { .. })
    }

    /// Get the value if successful
    pub fn value(&self) -> Option<&Value> {
        match &self.result {
            ToolResult::Success { value } => Some(value),
            _ => None,
        }
    }

    /// Get the error if failed
    pub fn get_error(&self) -> Option<&ToolError> {
        match &self.result {
            ToolResult::Error { error } => Some(error),
            _ => None,
        }
    }

    /// Error code of a failed or cancelled invocation
    pub fn error_code(&self) -> Option<ErrorCode> {
        match &self.result {
            ToolResult::Success { .. } => None,
            ToolResult::Error { error } => Some(error.code),
            ToolResult::Cancelled { .. } => Some(ErrorCode::Cancelled),
        }
    }

    /// Convert into the plain value, surfacing failures as [`ToolError`]
    pub fn into_value(self) -> Result<Value, ToolError> {
        match self.result {
            ToolResult::Success { value } => Ok(value),
            ToolResult::Error { error } => Err(error),
            ToolResult::Cancelled { reason } => Err(ToolError::new(ErrorCode::Cancelled, reason)),
        }
    }
}

/// Tool execution result (success, error, or cancelled)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    /// Tool executed successfully
    Success {
        /// The result value
        value: Value,
    },

    /// Invocation denied or failed
    Error {
        /// Structured error information
        error: ToolError,
    },

    /// Invocation was abandoned by the caller
    Cancelled {
        /// Reason for cancellation
        reason: String,
    },
}

/// Error taxonomy for governed invocations.
///
/// Serialized in SCREAMING_SNAKE_CASE (`BUDGET_EXCEEDED`, `CIRCUIT_OPEN`, ...)
/// so the wire form matches the codes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Tool or skill is not registered
    NotFound,
    /// Name and version already registered
    AlreadyRegistered,
    /// Role lacks a capability the tool requires
    CapabilityMissing,
    /// Capability or tool explicitly denied for the caller
    Forbidden,
    /// Input references a resource owned by another tenant
    TenantMismatch,
    /// Reservation would exceed the tenant's budget
    BudgetExceeded,
    /// Provider circuit is open; call rejected without touching the provider
    CircuitOpen,
    /// Recursion depth above the configured maximum
    RecursionLimit,
    /// Too many tool calls within one top-level request
    ChainLimit,
    /// Path resolves outside the sandbox root
    SandboxEscapeAttempt,
    /// Target file exceeds the sandbox size limit
    SandboxFileTooLarge,
    /// Input does not satisfy the tool's input schema
    ToolSchemaViolation,
    /// Output does not satisfy the tool's output schema or size limit
    ToolOutputInvalid,
    /// Handler returned a failure
    ToolExecutionFailed,
    /// Handler did not finish within its timeout
    ToolTimeout,
    /// A declared-pure tool produced a different result for the same key
    ReplayHashMismatch,
    /// A skill tool step failed
    SkillStepFailed,
    /// A skill precondition assertion failed
    SkillPreconditionFailed,
    /// A skill postcondition assertion failed
    SkillPostconditionFailed,
    /// A skill rollback step failed
    SkillRollbackFailed,
    /// Caller abandoned the invocation
    Cancelled,
    /// Internal failure
    Internal,
}

/// Coarse grouping of [`ErrorCode`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Registry misuse
    Registry,
    /// Policy gate denial
    PolicyDenial,
    /// Budget ledger denial
    LedgerDenial,
    /// Circuit breaker fail-fast
    BreakerDenial,
    /// Recursion or chain-length guard
    SandboxDenial,
    /// Path containment or size violation
    SandboxViolation,
    /// Input/output contract violation
    ContractViolation,
    /// Non-deterministic pure tool
    DeterminismViolation,
    /// Skill workflow failure
    WorkflowFailure,
    /// Handler execution failure, timeout or cancellation
    Execution,
    /// Internal failure
    Internal,
}

impl ErrorCode {
    /// All codes, in exit-code order
    pub fn all() -> &'static [ErrorCode] {
        &[
            ErrorCode::NotFound,
            ErrorCode::AlreadyRegistered,
            ErrorCode::CapabilityMissing,
            ErrorCode::Forbidden,
            ErrorCode::TenantMismatch,
            ErrorCode::BudgetExceeded,
            ErrorCode::CircuitOpen,
            ErrorCode::RecursionLimit,
            ErrorCode::ChainLimit,
            ErrorCode::SandboxEscapeAttempt,
            ErrorCode::SandboxFileTooLarge,
            ErrorCode::ToolSchemaViolation,
            ErrorCode::ToolOutputInvalid,
            ErrorCode::ToolExecutionFailed,
            ErrorCode::ToolTimeout,
            ErrorCode::ReplayHashMismatch,
            ErrorCode::SkillStepFailed,
            ErrorCode::SkillPreconditionFailed,
            ErrorCode::SkillPostconditionFailed,
            ErrorCode::SkillRollbackFailed,
            ErrorCode::Cancelled,
            ErrorCode::Internal,
        ]
    }

    /// Wire name of this code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyRegistered => "ALREADY_REGISTERED",
            ErrorCode::CapabilityMissing => "CAPABILITY_MISSING",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::TenantMismatch => "TENANT_MISMATCH",
            ErrorCode::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::RecursionLimit => "RECURSION_LIMIT",
            ErrorCode::ChainLimit => "CHAIN_LIMIT",
            ErrorCode::SandboxEscapeAttempt => "SANDBOX_ESCAPE_ATTEMPT",
            ErrorCode::SandboxFileTooLarge => "SANDBOX_FILE_TOO_LARGE",
            ErrorCode::ToolSchemaViolation => "TOOL_SCHEMA_VIOLATION",
            ErrorCode::ToolOutputInvalid => "TOOL_OUTPUT_INVALID",
            ErrorCode::ToolExecutionFailed => "TOOL_EXECUTION_FAILED",
            ErrorCode::ToolTimeout => "TOOL_TIMEOUT",
            ErrorCode::ReplayHashMismatch => "REPLAY_HASH_MISMATCH",
            ErrorCode::SkillStepFailed => "SKILL_STEP_FAILED",
            ErrorCode::SkillPreconditionFailed => "SKILL_PRECONDITION_FAILED",
            ErrorCode::SkillPostconditionFailed => "SKILL_POSTCONDITION_FAILED",
            ErrorCode::SkillRollbackFailed => "SKILL_ROLLBACK_FAILED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Category this code belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::NotFound | ErrorCode::AlreadyRegistered => ErrorCategory::Registry,
            ErrorCode::CapabilityMissing | ErrorCode::Forbidden | ErrorCode::TenantMismatch => {
                ErrorCategory::PolicyDenial
            }
            ErrorCode::BudgetExceeded => ErrorCategory::LedgerDenial,
            ErrorCode::CircuitOpen => ErrorCategory::BreakerDenial,
            ErrorCode::RecursionLimit | ErrorCode::ChainLimit => ErrorCategory::SandboxDenial,
            ErrorCode::SandboxEscapeAttempt | ErrorCode::SandboxFileTooLarge => {
                ErrorCategory::SandboxViolation
            }
            ErrorCode::ToolSchemaViolation | ErrorCode::ToolOutputInvalid => {
                ErrorCategory::ContractViolation
            }
            ErrorCode::ReplayHashMismatch => ErrorCategory::DeterminismViolation,
            ErrorCode::SkillStepFailed
            | ErrorCode::SkillPreconditionFailed
            | ErrorCode::SkillPostconditionFailed
            | ErrorCode::SkillRollbackFailed => ErrorCategory::WorkflowFailure,
            ErrorCode::ToolExecutionFailed | ErrorCode::ToolTimeout | ErrorCode::Cancelled => {
                ErrorCategory::Execution
            }
            ErrorCode::Internal => ErrorCategory::Internal,
        }
    }

    /// Whether this code is a governance denial (the handler never ran)
    pub fn is_denial(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::PolicyDenial
                | ErrorCategory::LedgerDenial
                | ErrorCategory::BreakerDenial
                | ErrorCategory::SandboxDenial
                | ErrorCategory::SandboxViolation
        )
    }

    /// Whether the caller may reasonably retry later.
    ///
    /// Nothing inside the pipeline retries automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::BudgetExceeded
                | ErrorCode::CircuitOpen
                | ErrorCode::ToolTimeout
                | ErrorCode::ToolExecutionFailed
        )
    }

    /// Process exit / response code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorCode::NotFound => 10,
            ErrorCode::AlreadyRegistered => 11,
            ErrorCode::CapabilityMissing => 20,
            ErrorCode::Forbidden => 21,
            ErrorCode::TenantMismatch => 22,
            ErrorCode::BudgetExceeded => 30,
            ErrorCode::CircuitOpen => 40,
            ErrorCode::RecursionLimit => 50,
            ErrorCode::ChainLimit => 51,
            ErrorCode::SandboxEscapeAttempt => 52,
            ErrorCode::SandboxFileTooLarge => 53,
            ErrorCode::ToolSchemaViolation => 60,
            ErrorCode::ToolOutputInvalid => 61,
            ErrorCode::ToolExecutionFailed => 62,
            ErrorCode::ToolTimeout => 63,
            ErrorCode::ReplayHashMismatch => 70,
            ErrorCode::SkillStepFailed => 80,
            ErrorCode::SkillPreconditionFailed => 81,
            ErrorCode::SkillPostconditionFailed => 82,
            ErrorCode::SkillRollbackFailed => 83,
            ErrorCode::Cancelled => 90,
            ErrorCode::Internal => 99,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, typed failure of a governed invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    /// Taxonomy code
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Additional context (remaining budget, schema errors, first tampered index...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    /// Suggested retry delay (breaker cooldown remaining, budget window remaining)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "option_duration_millis"
    )]
    pub retry_after: Option<Duration>,
}

impl ToolError {
    /// Create a new tool error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            retry_after: None,
        }
    }

    /// Add context
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Add retry delay
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Create a schema violation error from field-level validation errors
    pub fn schema_violation(errors: Vec<ValidationError>) -> Self {
        Self::contract(ErrorCode::ToolSchemaViolation, "Input validation failed", errors)
    }

    /// Create an output contract error from field-level validation errors
    pub fn output_invalid(errors: Vec<ValidationError>) -> Self {
        Self::contract(ErrorCode::ToolOutputInvalid, "Output validation failed", errors)
    }

    fn contract(code: ErrorCode, prefix: &str, errors: Vec<ValidationError>) -> Self {
        Self {
            code,
            message: format!(
                "{}: {}",
                prefix,
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            ),
            context: serde_json::to_value(&errors).ok(),
            retry_after: None,
        }
    }

    /// Create a handler execution failure
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ToolExecutionFailed, message)
    }

    /// Create a timeout error
    pub fn timeout(duration: Duration) -> Self {
        Self::new(
            ErrorCode::ToolTimeout,
            format!("Tool execution timed out after {:?}", duration),
        )
    }

    /// Create a not-found error
    pub fn not_found(what: &str, name: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("{} '{}' not found", what, name))
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ToolError {}

/// Validation error for a specific location in a JSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    /// JSON pointer to the offending value (empty for the root)
    pub field: String,

    /// Error message
    pub message: String,
}

impl ValidationError {
    /// Create a new validation error
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.field.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Warning that occurred during execution but didn't cause failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolWarning {
    /// Warning code
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// Additional context
    pub context: Option<Value>,
}

impl ToolWarning {
    /// Create a new warning
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: None,
        }
    }

    /// Add context
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// How the replay cache participated in an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// Tool is not cacheable or the invocation never reached the cache
    #[default]
    Bypass,
    /// Result served from the cache; handler not invoked
    Hit,
    /// Handler executed and its result stored
    Miss,
    /// Joined another caller's in-flight execution
    Coalesced,
}

impl CacheStatus {
    /// Whether the handler was skipped for this invocation
    pub fn served_from_cache(&self) -> bool {
        matches!(self, CacheStatus::Hit | CacheStatus::Coalesced)
    }
}

/// Provenance metadata tying a result to its context, decision and audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProvenance {
    /// Tool name
    pub tool_name: String,

    /// Tool version (if resolved)
    pub tool_version: Option<String>,

    /// Definition digest (if resolved)
    pub tool_digest: Option<String>,

    /// Fingerprint of the canonicalized input
    pub input_fingerprint: String,

    /// Fingerprint of the canonicalized result (successful invocations)
    pub result_fingerprint: Option<String>,

    /// Tenant the invocation ran for
    pub tenant_id: String,

    /// Request/trace ID for correlation
    pub trace_id: String,

    /// Run ID within the trace
    pub run_id: String,

    /// Recursion depth the handler ran at
    pub depth: u32,

    /// Timestamp when the invocation started
    pub started_at: DateTime<Utc>,

    /// Invocation duration
    #[serde(with = "duration_millis")]
    pub duration: Duration,

    /// Replay cache participation
    pub cache: CacheStatus,

    /// Policy decision, if the gate was reached
    pub decision: Option<PolicyDecision>,

    /// Index of the audit record written for this invocation
    pub audit_index: Option<u64>,
}

impl ToolProvenance {
    /// Create new provenance
    pub fn new(
        tool_name: impl Into<String>,
        input_fingerprint: impl Into<String>,
        tenant_id: impl Into<String>,
        trace_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_version: None,
            tool_digest: None,
            input_fingerprint: input_fingerprint.into(),
            result_fingerprint: None,
            tenant_id: tenant_id.into(),
            trace_id: trace_id.into(),
            run_id: run_id.into(),
            depth: 0,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            cache: CacheStatus::Bypass,
            decision: None,
            audit_index: None,
        }
    }

    /// Set resolved tool version and digest
    pub fn with_tool(mut self, version: impl Into<String>, digest: impl Into<String>) -> Self {
        self.tool_version = Some(version.into());
        self.tool_digest = Some(digest.into());
        self
    }

    /// Set duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set depth
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Set the policy decision
    pub fn with_decision(mut self, decision: PolicyDecision) -> Self {
        self.decision = Some(decision);
        self
    }
}

// Serde helpers for Duration serialization as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<u64> = Option::deserialize(deserializer)?;
        Ok(opt.map(Duration::from_millis))
    }
}
