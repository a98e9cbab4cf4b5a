//! Usage metering
//!
//! One [`MeterEvent`] is recorded per completed invocation. Only a
//! successful handler execution is billable; failures, denials and
//! replay-cache hits are recorded as `no_charge`. The idempotency key lets
//! billing detect a request that was charged more than once.

use crate::fingerprint::fingerprint;
use crate::tools::{CacheStatus, ErrorCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Billing rule applied to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Billing {
    Charge,
    NoCharge,
}

impl Billing {
    /// Charge only a successful execution that actually ran the handler
    pub fn for_outcome(success: bool, cache: CacheStatus) -> Self {
        if success && !cache.served_from_cache() {
            Billing::Charge
        } else {
            Billing::NoCharge
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Billing::Charge => "charge",
            Billing::NoCharge => "no_charge",
        }
    }
}

/// One metered invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterEvent {
    pub tenant_id: String,
    pub trace_id: String,
    pub run_id: String,
    pub tool: String,
    /// Identifies the request across retries
    pub idempotency_key: String,
    pub success: bool,
    pub error_code: Option<ErrorCode>,
    pub cache: CacheStatus,
    pub billing: Billing,
    /// Cost units charged (0 unless billed)
    pub cost: u64,
    pub recorded_at: DateTime<Utc>,
}

impl MeterEvent {
    /// Build an event, deriving the billing rule from the outcome
    pub fn new(
        tenant_id: impl Into<String>,
        tool: impl Into<String>,
        idempotency_key: impl Into<String>,
        error_code: Option<ErrorCode>,
        cache: CacheStatus,
        cost: u64,
    ) -> Self {
        let success = error_code.is_none();
        let billing = Billing::for_outcome(success, cache);
        Self {
            tenant_id: tenant_id.into(),
            trace_id: String::new(),
            run_id: String::new(),
            tool: tool.into(),
            idempotency_key: idempotency_key.into(),
            success,
            error_code,
            cache,
            billing,
            cost: if billing == Billing::Charge { cost } else { 0 },
            recorded_at: Utc::now(),
        }
    }

    /// Attach trace and run IDs
    pub fn with_trace(mut self, trace_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self.run_id = run_id.into();
        self
    }

    /// Key for a request: tenant, trace, tool version and input fingerprint.
    /// A retry within the same trace produces the same key.
    pub fn idempotency_key(
        tenant_id: &str,
        trace_id: &str,
        tool: &str,
        version: &str,
        input_fingerprint: &str,
    ) -> String {
        fingerprint(&serde_json::json!({
            "tenant": tenant_id,
            "trace": trace_id,
            "tool": tool,
            "version": version,
            "input": input_fingerprint,
        }))
    }

    pub fn is_charged(&self) -> bool {
        self.billing == Billing::Charge
    }
}

/// Metering invariants that did not hold
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParityError {
    #[error("expected {expected} charged events, found {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("request {0} charged more than once")]
    DuplicateCharge(String),
}

/// Append-only, thread-safe meter log
#[derive(Debug, Default)]
pub struct MeterLog {
    events: Mutex<Vec<MeterEvent>>,
}

impl MeterLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: MeterEvent) {
        tracing::trace!(
            tenant = %event.tenant_id,
            tool = %event.tool,
            billing = event.billing.as_str(),
            cost = event.cost,
            "Meter event"
        );
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Snapshot of all events in recording order
    pub fn events(&self) -> Vec<MeterEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events_for(&self, tenant_id: &str) -> Vec<MeterEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.tenant_id == tenant_id)
            .collect()
    }

    /// Number of charged events, for one tenant or all
    pub fn charged_count(&self, tenant_id: Option<&str>) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.is_charged() && tenant_id.is_none_or(|t| e.tenant_id == t))
            .count()
    }

    /// Sum of charged cost for a tenant
    pub fn charged_total(&self, tenant_id: &str) -> u64 {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.is_charged() && e.tenant_id == tenant_id)
            .map(|e| e.cost)
            .sum()
    }

    /// Idempotency keys charged more than once, sorted
    pub fn find_duplicates(&self) -> Vec<String> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        for event in events.iter().filter(|e| e.is_charged()) {
            *seen.entry(event.idempotency_key.as_str()).or_default() += 1;
        }
        seen.into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(key, _)| key.to_string())
            .collect()
    }

    /// Check that exactly `expected` events were charged and none twice
    pub fn verify_parity(&self, expected: usize) -> Result<(), ParityError> {
        let actual = self.charged_count(None);
        if actual != expected {
            return Err(ParityError::CountMismatch { expected, actual });
        }
        match self.find_duplicates().into_iter().next() {
            Some(key) => Err(ParityError::DuplicateCharge(key)),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(tenant: &str, key: &str, error: Option<ErrorCode>, cache: CacheStatus) -> MeterEvent {
        MeterEvent::new(tenant, "sha256", key, error, cache, 5)
    }

    #[test]
    fn billing_rules() {
        assert_eq!(Billing::for_outcome(true, CacheStatus::Bypass), Billing::Charge);
        assert_eq!(Billing::for_outcome(true, CacheStatus::Miss), Billing::Charge);
        assert_eq!(Billing::for_outcome(true, CacheStatus::Hit), Billing::NoCharge);
        assert_eq!(Billing::for_outcome(true, CacheStatus::Coalesced), Billing::NoCharge);
        assert_eq!(Billing::for_outcome(false, CacheStatus::Bypass), Billing::NoCharge);
    }

    #[test]
    fn failures_and_hits_cost_nothing() {
        let log = MeterLog::new();
        log.record(event("acme", "k1", None, CacheStatus::Miss));
        log.record(event("acme", "k1", None, CacheStatus::Hit));
        log.record(event("acme", "k2", Some(ErrorCode::ToolTimeout), CacheStatus::Bypass));
        log.record(event("globex", "k3", None, CacheStatus::Bypass));

        assert_eq!(log.len(), 4);
        assert_eq!(log.charged_total("acme"), 5);
        assert_eq!(log.charged_count(Some("acme")), 1);
        assert_eq!(log.charged_count(None), 2);
        assert!(log.find_duplicates().is_empty());
        assert!(log.verify_parity(2).is_ok());
        assert_eq!(
            log.verify_parity(3),
            Err(ParityError::CountMismatch { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn detects_double_charge() {
        let log = MeterLog::new();
        let key = MeterEvent::idempotency_key("acme", "t-1", "sha256", "1.0.0", "fp");
        log.record(event("acme", &key, None, CacheStatus::Bypass));
        log.record(event("acme", &key, None, CacheStatus::Bypass));

        assert_eq!(log.find_duplicates(), vec![key.clone()]);
        assert_eq!(log.verify_parity(2), Err(ParityError::DuplicateCharge(key)));
    }
}
