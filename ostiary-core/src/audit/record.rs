use crate::budget::AnomalyKind;
use crate::fingerprint::{canonical_json_of, sha256_hex};
use crate::policy::{PolicyDecision, Role};
use crate::tools::{CacheStatus, ErrorCode, InvocationContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Previous-hash value of the first record
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// One governed tool invocation (allowed or denied)
    ToolInvocation,
    /// One skill run, as a whole
    SkillRun,
}

/// How the governed operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Completed successfully
    Success,
    /// Denied by a sandbox or policy check before the handler ran
    Denied,
    /// Failed after admission
    Failed,
    /// Abandoned by the caller
    Cancelled,
}

/// Policy decision as recorded in the chain.
///
/// Anomaly flags are reduced to their kinds so the payload holds no floats
/// and hashes identically after a round trip through storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDecision {
    pub allowed: bool,
    pub reason: Option<ErrorCode>,
    pub matched_rule: String,
    pub estimated_cost: u64,
    pub actual_cost: Option<u64>,
    #[serde(default)]
    pub anomaly_flags: Vec<AnomalyKind>,
}

impl From<&PolicyDecision> for AuditDecision {
    fn from(decision: &PolicyDecision) -> Self {
        Self {
            allowed: decision.allowed,
            reason: decision.reason,
            matched_rule: decision.matched_rule.clone(),
            estimated_cost: decision.estimated_cost,
            actual_cost: decision.actual_cost,
            anomaly_flags: decision.anomaly_flags.iter().map(|f| f.kind).collect(),
        }
    }
}

/// The hashed content of an audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditPayload {
    pub kind: AuditEventKind,
    pub tenant_id: String,
    pub role: Role,
    pub trace_id: String,
    pub run_id: String,
    pub depth: u32,

    /// Tool or skill name
    pub subject: String,
    pub subject_version: Option<String>,
    pub subject_digest: Option<String>,

    pub input_fingerprint: String,
    pub result_fingerprint: Option<String>,

    pub outcome: AuditOutcome,
    /// Error code for anything but success
    pub reason: Option<ErrorCode>,
    /// Policy decision, when the gate was reached
    pub decision: Option<AuditDecision>,
    pub cache: CacheStatus,
    /// Cost charged to the tenant
    pub charged: u64,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub engine_version: String,

    /// Kind-specific detail (skill step outcomes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl AuditPayload {
    /// Start a payload for `subject` in `ctx`; the outcome defaults to success
    pub fn new(
        kind: AuditEventKind,
        ctx: &InvocationContext,
        subject: impl Into<String>,
        input_fingerprint: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            tenant_id: ctx.tenant_id.clone(),
            role: ctx.role,
            trace_id: ctx.trace_id.clone(),
            run_id: ctx.run_id.clone(),
            depth: ctx.depth,
            subject: subject.into(),
            subject_version: None,
            subject_digest: None,
            input_fingerprint: input_fingerprint.into(),
            result_fingerprint: None,
            outcome: AuditOutcome::Success,
            reason: None,
            decision: None,
            cache: CacheStatus::Bypass,
            charged: 0,
            started_at,
            finished_at: Utc::now(),
            engine_version: crate::VERSION.to_string(),
            detail: None,
        }
    }
}

/// One link of the audit chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the chain, starting at 0
    pub index: u64,
    /// Hash of the previous record, or [`GENESIS_HASH`]
    pub prev_hash: String,
    /// Hashed content
    pub payload: AuditPayload,
    /// `SHA-256(prev_hash ‖ canonical(payload))`
    pub hash: String,
}

impl AuditRecord {
    /// Build the record that follows `prev_hash`
    pub fn new(
        index: u64,
        prev_hash: impl Into<String>,
        payload: AuditPayload,
    ) -> Result<Self, serde_json::Error> {
        let prev_hash = prev_hash.into();
        let hash = compute_hash(&prev_hash, &payload)?;
        Ok(Self {
            index,
            prev_hash,
            payload,
            hash,
        })
    }

    /// Recompute this record's hash from its fields
    pub fn recompute_hash(&self) -> Result<String, serde_json::Error> {
        compute_hash(&self.prev_hash, &self.payload)
    }
}

/// `SHA-256(prev_hash ‖ canonical(payload))` as lowercase hex
pub fn compute_hash(prev_hash: &str, payload: &AuditPayload) -> Result<String, serde_json::Error> {
    let canonical = canonical_json_of(payload)?;
    let mut input = String::with_capacity(prev_hash.len() + canonical.len());
    input.push_str(prev_hash);
    input.push_str(&canonical);
    Ok(sha256_hex(input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::is_hash_hex;

    fn payload() -> AuditPayload {
        let ctx = InvocationContext::new("acme", Role::Operator).with_trace_id("trace-1");
        AuditPayload::new(AuditEventKind::ToolInvocation, &ctx, "sha256", "ab", Utc::now())
    }

    #[test]
    fn genesis_is_a_hash() {
        assert!(is_hash_hex(GENESIS_HASH));
        assert!(GENESIS_HASH.bytes().all(|b| b == b'0'));
    }

    #[test]
    fn hash_covers_prev_hash_and_payload() {
        let record = AuditRecord::new(0, GENESIS_HASH, payload()).unwrap();
        assert!(is_hash_hex(&record.hash));
        assert_eq!(record.recompute_hash().unwrap(), record.hash);

        let mut relinked = record.clone();
        relinked.prev_hash = "1".repeat(64);
        assert_ne!(relinked.recompute_hash().unwrap(), record.hash);

        let mut edited = record.clone();
        edited.payload.tenant_id = "globex".into();
        assert_ne!(edited.recompute_hash().unwrap(), record.hash);
    }

    #[test]
    fn hash_survives_storage_round_trip() {
        let record = AuditRecord::new(3, GENESIS_HASH, payload()).unwrap();
        let text = serde_json::to_string(&record).unwrap();
        let loaded: AuditRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(loaded.recompute_hash().unwrap(), record.hash);
    }
}
