use super::record::{AuditPayload, AuditRecord, GENESIS_HASH};
use crate::error::{OstiaryError, Result};
use crate::store::SharedStore;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const HEAD_KEY: &str = "audit/head";
const RECORD_PREFIX: &str = "audit/";

fn record_key(index: u64) -> String {
    format!("{}{:020}", RECORD_PREFIX, index)
}

/// Result of verifying a chain from genesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Records examined
    pub total_entries: u64,
    /// Whether every record verified
    pub valid: bool,
    /// First record whose linkage or hash does not verify
    pub first_invalid_index: Option<u64>,
    /// What was wrong with it
    pub error_message: Option<String>,
}

impl IntegrityReport {
    fn valid(total_entries: u64) -> Self {
        Self {
            total_entries,
            valid: true,
            first_invalid_index: None,
            error_message: None,
        }
    }

    fn invalid(total_entries: u64, index: u64, message: String) -> Self {
        Self {
            total_entries,
            valid: false,
            first_invalid_index: Some(index),
            error_message: Some(message),
        }
    }
}

/// Verify `records` as a complete chain: positions, linkage and hashes,
/// recomputed from genesis. Stops at the first failure.
pub fn verify_records(records: &[AuditRecord]) -> IntegrityReport {
    let total = records.len() as u64;
    let mut expected_prev = GENESIS_HASH;

    for (position, record) in records.iter().enumerate() {
        let position = position as u64;
        if record.index != position {
            return IntegrityReport::invalid(
                total,
                position,
                format!("Record at position {} claims index {}", position, record.index),
            );
        }
        if record.prev_hash != expected_prev {
            return IntegrityReport::invalid(
                total,
                position,
                format!(
                    "Record {} has broken chain link (expected prev: {}, got: {})",
                    position, expected_prev, record.prev_hash
                ),
            );
        }
        match record.recompute_hash() {
            Ok(hash) if hash == record.hash => {}
            Ok(_) => {
                return IntegrityReport::invalid(
                    total,
                    position,
                    format!("Record {} has invalid hash", position),
                );
            }
            Err(e) => {
                return IntegrityReport::invalid(
                    total,
                    position,
                    format!("Record {} could not be canonicalized: {}", position, e),
                );
            }
        }
        expected_prev = &record.hash;
    }

    IntegrityReport::valid(total)
}

/// Persisted chain head
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Head {
    len: u64,
    hash: String,
}

struct ChainState {
    records: Vec<Arc<AuditRecord>>,
    head: String,
}

/// Append-only, hash-linked audit log.
///
/// Appends are serialized by a single lock around the head so no two
/// records can link to the same predecessor. With a durable store, a record
/// and the new head are persisted before the record becomes visible; a
/// failed write is fatal and leaves the chain unchanged.
pub struct AuditChain {
    state: Mutex<ChainState>,
    store: Option<SharedStore>,
}

impl std::fmt::Debug for AuditChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("AuditChain")
            .field("len", &state.records.len())
            .field("head", &state.head)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Default for AuditChain {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditChain {
    /// Create an empty, process-local chain
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState {
                records: Vec::new(),
                head: GENESIS_HASH.to_string(),
            }),
            store: None,
        }
    }

    /// Open the chain persisted in `store`, re-verifying it from genesis.
    ///
    /// Records written past the persisted head (an append that failed half
    /// way) are ignored and will be overwritten.
    pub fn open(store: SharedStore) -> Result<Self> {
        let head: Option<Head> = match store.get(HEAD_KEY)? {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None,
        };
        let len = head.as_ref().map_or(0, |h| h.len);

        let mut records = Vec::with_capacity(len as usize);
        for (key, value) in store.scan_prefix(RECORD_PREFIX)? {
            let Some(index) = key
                .strip_prefix(RECORD_PREFIX)
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if index >= len {
                tracing::warn!(index, len, "Ignoring audit record past the chain head");
                continue;
            }
            let record: AuditRecord = serde_json::from_value(value)
                .map_err(|_| OstiaryError::AuditCorrupted { index })?;
            records.push(record);
        }
        records.sort_by_key(|r| r.index);

        if records.len() as u64 != len {
            let missing = records
                .iter()
                .enumerate()
                .find(|(i, r)| r.index != *i as u64)
                .map_or(records.len() as u64, |(i, _)| i as u64);
            tracing::error!(missing, len, "Audit chain has missing records");
            return Err(OstiaryError::AuditCorrupted { index: missing });
        }

        let report = verify_records(&records);
        if let Some(index) = report.first_invalid_index {
            tracing::error!(
                index,
                error = report.error_message.as_deref().unwrap_or_default(),
                "Stored audit chain failed verification"
            );
            return Err(OstiaryError::AuditCorrupted { index });
        }

        let head_hash = records
            .last()
            .map_or_else(|| GENESIS_HASH.to_string(), |r| r.hash.clone());
        if let Some(head) = &head
            && head.hash != head_hash
        {
            tracing::error!(stored = %head.hash, computed = %head_hash, "Audit head does not match chain");
            return Err(OstiaryError::AuditCorrupted {
                index: len.saturating_sub(1),
            });
        }

        tracing::info!(records = records.len(), "Opened audit chain");
        Ok(Self {
            state: Mutex::new(ChainState {
                records: records.into_iter().map(Arc::new).collect(),
                head: head_hash,
            }),
            store: Some(store),
        })
    }

    /// Append a record for `payload` and advance the head
    pub fn append(&self, payload: AuditPayload) -> Result<Arc<AuditRecord>> {
        let mut state = self.lock();
        let index = state.records.len() as u64;
        let record = AuditRecord::new(index, state.head.clone(), payload)
            .map_err(|e| OstiaryError::AuditPersistence(format!("cannot encode record: {}", e)))?;

        if let Some(store) = &self.store {
            let head = Head {
                len: index + 1,
                hash: record.hash.clone(),
            };
            let persisted = serde_json::to_value(&record)
                .map_err(|e| e.to_string())
                .and_then(|value| {
                    store
                        .put(&record_key(index), &value)
                        .map_err(|e| e.to_string())
                })
                .and_then(|()| serde_json::to_value(&head).map_err(|e| e.to_string()))
                .and_then(|value| store.put(HEAD_KEY, &value).map_err(|e| e.to_string()));
            if let Err(e) = persisted {
                tracing::error!(index, error = %e, "Failed to persist audit record");
                return Err(OstiaryError::AuditPersistence(e));
            }
        }

        let record = Arc::new(record);
        state.head = record.hash.clone();
        state.records.push(Arc::clone(&record));
        tracing::debug!(
            index,
            kind = ?record.payload.kind,
            tenant = %record.payload.tenant_id,
            subject = %record.payload.subject,
            "Appended audit record"
        );
        Ok(record)
    }

    /// Recompute every hash from genesis
    pub fn verify(&self) -> IntegrityReport {
        let records: Vec<AuditRecord> = self.lock().records.iter().map(|r| (**r).clone()).collect();
        verify_records(&records)
    }

    /// All records in append order
    pub fn records(&self) -> Vec<Arc<AuditRecord>> {
        self.lock().records.clone()
    }

    /// Records belonging to one trace, in append order
    pub fn records_for_trace(&self, trace_id: &str) -> Vec<Arc<AuditRecord>> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.payload.trace_id == trace_id)
            .cloned()
            .collect()
    }

    /// Record at `index`
    pub fn get(&self, index: u64) -> Option<Arc<AuditRecord>> {
        self.lock().records.get(index as usize).cloned()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether the chain is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current head hash ([`GENESIS_HASH`] for an empty chain)
    pub fn head(&self) -> String {
        self.lock().head.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventKind, AuditOutcome};
    use crate::policy::Role;
    use crate::store::{DurableStore, FileStore, MemoryStore, StoreError, StoreResult};
    use crate::tools::InvocationContext;
    use serde_json::Value;

    fn payload(trace: &str, subject: &str) -> AuditPayload {
        let ctx = InvocationContext::new("acme", Role::Operator).with_trace_id(trace);
        AuditPayload::new(
            AuditEventKind::ToolInvocation,
            &ctx,
            subject,
            crate::fingerprint::sha256_hex(subject),
            chrono::Utc::now(),
        )
    }

    fn chain_of(n: usize) -> AuditChain {
        let chain = AuditChain::new();
        for i in 0..n {
            chain.append(payload(&format!("t{}", i % 2), &format!("tool-{}", i))).unwrap();
        }
        chain
    }

    #[test]
    fn appends_link_to_previous_hash() {
        let chain = AuditChain::new();
        assert_eq!(chain.head(), GENESIS_HASH);

        let first = chain.append(payload("t", "a")).unwrap();
        let second = chain.append(payload("t", "b")).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(chain.head(), second.hash);
    }

    #[test]
    fn untouched_chain_verifies() {
        let chain = chain_of(25);
        let report = chain.verify();
        assert!(report.valid);
        assert_eq!(report.total_entries, 25);
        assert_eq!(report.first_invalid_index, None);

        assert!(verify_records(&[]).valid);
    }

    #[test]
    fn any_single_edit_is_reported_at_its_index() {
        let chain = chain_of(10);
        let pristine: Vec<AuditRecord> = chain.records().iter().map(|r| (**r).clone()).collect();

        for target in 0..pristine.len() {
            let mut records = pristine.clone();
            records[target].payload.outcome = AuditOutcome::Denied;
            let report = verify_records(&records);
            assert!(!report.valid);
            assert_eq!(report.first_invalid_index, Some(target as u64));
        }

        // Re-hashing an edited record moves the break to the next link
        let mut records = pristine.clone();
        records[4].payload.tenant_id = "globex".into();
        records[4].hash = records[4].recompute_hash().unwrap();
        assert_eq!(verify_records(&records).first_invalid_index, Some(5));

        // Dropping a record breaks the chain at that position
        let mut records = pristine;
        records.remove(3);
        assert_eq!(verify_records(&records).first_invalid_index, Some(3));
    }

    #[test]
    fn concurrent_appends_form_one_chain() {
        let chain = Arc::new(AuditChain::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let chain = Arc::clone(&chain);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        chain.append(payload(&format!("t{}", t), &format!("{}-{}", t, i))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(chain.len(), 200);
        assert!(chain.verify().valid);
    }

    #[test]
    fn trace_query() {
        let chain = chain_of(6);
        let t0 = chain.records_for_trace("t0");
        assert_eq!(t0.len(), 3);
        assert!(t0.iter().all(|r| r.payload.trace_id == "t0"));
        assert!(chain.records_for_trace("nope").is_empty());
        assert_eq!(chain.get(5).unwrap().index, 5);
        assert!(chain.get(6).is_none());
    }

    #[test]
    fn reopens_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedStore = Arc::new(FileStore::open(dir.path()).unwrap());

        let head = {
            let chain = AuditChain::open(Arc::clone(&store)).unwrap();
            for i in 0..5 {
                chain.append(payload("t", &format!("tool-{}", i))).unwrap();
            }
            chain.head()
        };

        let reopened = AuditChain::open(store).unwrap();
        assert_eq!(reopened.len(), 5);
        assert_eq!(reopened.head(), head);
        assert!(reopened.verify().valid);

        let next = reopened.append(payload("t", "after-restart")).unwrap();
        assert_eq!(next.index, 5);
        assert_eq!(next.prev_hash, head);
    }

    #[test]
    fn tampered_store_fails_to_open() {
        let store = Arc::new(MemoryStore::new());
        {
            let chain = AuditChain::open(store.clone()).unwrap();
            for i in 0..4 {
                chain.append(payload("t", &format!("tool-{}", i))).unwrap();
            }
        }

        let key = record_key(2);
        let mut value = store.get(&key).unwrap().unwrap();
        value["payload"]["tenant_id"] = Value::String("globex".into());
        store.put(&key, &value).unwrap();

        match AuditChain::open(store) {
            Err(OstiaryError::AuditCorrupted { index }) => assert_eq!(index, 2),
            other => panic!("expected corruption, got {:?}", other.map(|c| c.len())),
        }
    }

    struct FailingStore;

    impl DurableStore for FailingStore {
        fn get(&self, _key: &str) -> StoreResult<Option<Value>> {
            Ok(None)
        }

        fn put(&self, _key: &str, _value: &Value) -> StoreResult<()> {
            Err(StoreError::Backend("disk full".into()))
        }

        fn scan_prefix(&self, _prefix: &str) -> StoreResult<Vec<(String, Value)>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn persistence_failure_is_fatal_and_invisible() {
        let chain = AuditChain::open(Arc::new(FailingStore)).unwrap();
        let err = chain.append(payload("t", "a")).unwrap_err();
        assert!(matches!(err, OstiaryError::AuditPersistence(_)));
        assert!(chain.is_empty());
        assert_eq!(chain.head(), GENESIS_HASH);
    }
}
