//! Tamper-evident audit chain
//!
//! Every governed decision (allowed invocations, denials, skill runs) is
//! appended as an [`AuditRecord`] whose hash covers the previous record's
//! hash and the canonicalized payload:
//!
//! ```text
//! hash[i] = SHA-256(hash[i-1] ‖ canonical(payload[i]))      hash[-1] = GENESIS_HASH
//! ```
//!
//! Altering any record breaks verification from that record onward.

mod chain;
mod record;

pub use chain::{AuditChain, IntegrityReport, verify_records};
pub use record::{
    AuditDecision, AuditEventKind, AuditOutcome, AuditPayload, AuditRecord, GENESIS_HASH,
    compute_hash,
};
