//! State that must survive a restart: the audit chain and tenant budgets

use ostiary_core::OstiaryError;
use ostiary_core::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn file_config(dir: &TempDir) -> OstiaryConfig {
    OstiaryConfig {
        store: StoreConfig::File {
            root: dir.path().to_path_buf(),
        },
        ..Default::default()
    }
}

async fn governor_with_history(config: OstiaryConfig) -> Governor {
    let governor = Governor::builder().config(config).build().unwrap();
    register_builtins(governor.registry(), &SandboxConfig::default(), None).unwrap();

    let ctx = InvocationContext::new("acme", Role::Viewer);
    for text in ["first", "second"] {
        let envelope = governor
            .invoke(&ctx, "sha256", json!({ "text": text }))
            .await
            .unwrap();
        assert!(envelope.is_success());
    }
    governor
}

#[tokio::test]
async fn test_audit_and_budget_survive_restart() {
    let dir = TempDir::new().unwrap();
    let head = {
        let governor = governor_with_history(file_config(&dir)).await;
        governor.audit().head()
    };

    let reopened = Governor::builder().config(file_config(&dir)).build().unwrap();
    let records = reopened.audit_records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].hash, head);
    assert!(reopened.verify_audit().valid);
    assert_eq!(reopened.budget_summary("acme").consumed, 2);

    // New records extend the restored chain
    register_builtins(reopened.registry(), &SandboxConfig::default(), None).unwrap();
    let ctx = InvocationContext::new("acme", Role::Viewer);
    let envelope = reopened
        .invoke(&ctx, "sha256", json!({ "text": "third" }))
        .await
        .unwrap();
    assert_eq!(envelope.provenance.audit_index, Some(2));
    assert_eq!(reopened.audit_records()[2].prev_hash, head);
    assert!(reopened.verify_audit().valid);
}

#[tokio::test]
async fn test_tampered_record_is_detected_on_open() {
    let dir = TempDir::new().unwrap();
    drop(governor_with_history(file_config(&dir)).await);

    let store = FileStore::open(dir.path()).unwrap();
    let key = "audit/00000000000000000001";
    let mut record = store.get(key).unwrap().unwrap();
    record["payload"]["charged"] = json!(0);
    store.put(key, &record).unwrap();

    let err = Governor::builder()
        .config(file_config(&dir))
        .build()
        .unwrap_err();
    assert!(matches!(err, OstiaryError::AuditCorrupted { index: 1 }));
}

#[tokio::test]
async fn test_deleted_record_is_detected_on_open() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    {
        let governor = Governor::builder().store(Arc::clone(&store)).build().unwrap();
        register_builtins(governor.registry(), &SandboxConfig::default(), None).unwrap();
        let ctx = InvocationContext::new("acme", Role::Viewer);
        for text in ["a", "b", "c"] {
            governor
                .invoke(&ctx, "sha256", json!({ "text": text }))
                .await
                .unwrap();
        }
    }

    // Rebuild the store without the middle record
    let pruned: SharedStore = Arc::new(MemoryStore::new());
    for (key, value) in store.scan_prefix("").unwrap() {
        if key != "audit/00000000000000000001" {
            pruned.put(&key, &value).unwrap();
        }
    }

    let err = Governor::builder().store(pruned).build().unwrap_err();
    assert!(matches!(err, OstiaryError::AuditCorrupted { index: 1 }));
}

#[test]
fn test_in_memory_chain_detects_tampering() {
    let chain = AuditChain::new();
    let ctx = InvocationContext::new("acme", Role::Admin);
    for subject in ["sha256", "fs_read", "sha256"] {
        let payload = ostiary_core::audit::AuditPayload::new(
            ostiary_core::audit::AuditEventKind::ToolInvocation,
            &ctx,
            subject,
            "fp",
            chrono::Utc::now(),
        );
        chain.append(payload).unwrap();
    }

    let mut records: Vec<AuditRecord> = chain.records().iter().map(|r| (**r).clone()).collect();
    assert!(ostiary_core::audit::verify_records(&records).valid);

    records[1].payload.subject = "model_complete".to_string();
    let report = ostiary_core::audit::verify_records(&records);
    assert!(!report.valid);
    assert_eq!(report.first_invalid_index, Some(1));
}
