//! Pipeline tests: tools invoked through the governor

use super::*;
use crate::audit::AuditOutcome;
use crate::config::OstiaryConfig;
use crate::governor::Governor;
use crate::policy::{Role, TenantPolicy};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn v1() -> semver::Version {
    semver::Version::new(1, 0, 0)
}

fn governor(config: OstiaryConfig) -> Governor {
    Governor::builder().config(config).build().unwrap()
}

/// Handler that counts calls and echoes its input
fn counting(calls: &Arc<AtomicUsize>) -> BoxedHandler {
    let calls = Arc::clone(calls);
    handler_fn(move |_ctx, input| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutput::new(json!({ "echo": input })))
        }
    })
}

fn slow(delay: Duration) -> BoxedHandler {
    handler_fn(move |_ctx, _input| async move {
        tokio::time::sleep(delay).await;
        Ok(HandlerOutput::new(json!({ "done": true })))
    })
}

fn ctx(tenant: &str, role: Role) -> InvocationContext {
    InvocationContext::new(tenant, role)
}

#[tokio::test]
async fn test_success_is_charged_and_audited() {
    let gov = governor(OstiaryConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    gov.registry()
        .register(
            ToolDefinition::new("echo", v1(), SideEffect::Read).with_estimated_cost(4),
            counting(&calls),
        )
        .unwrap();

    let ctx = ctx("acme", Role::Viewer);
    let envelope = gov.invoke(&ctx, "echo", json!({"q": 1})).await.unwrap();

    assert!(envelope.is_success());
    assert_eq!(envelope.value(), Some(&json!({"echo": {"q": 1}})));
    let provenance = &envelope.provenance;
    assert_eq!(provenance.cache, CacheStatus::Bypass);
    assert_eq!(provenance.depth, 1);
    assert_eq!(provenance.tool_version.as_deref(), Some("1.0.0"));
    assert!(provenance.result_fingerprint.is_some());
    let decision = provenance.decision.as_ref().unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.matched_rule, "role:viewer");
    assert_eq!(decision.actual_cost, Some(4));

    assert_eq!(gov.budget_summary("acme").consumed, 4);
    assert_eq!(gov.meter().charged_total("acme"), 4);

    let records = gov.audit_for_trace(&ctx.trace_id);
    assert_eq!(records.len(), 1);
    assert_eq!(Some(records[0].index), provenance.audit_index);
    assert_eq!(records[0].payload.outcome, AuditOutcome::Success);
    assert_eq!(records[0].payload.charged, 4);
}

#[tokio::test]
async fn test_unknown_tool_is_audited() {
    let gov = governor(OstiaryConfig::default());
    let envelope = gov
        .invoke(&ctx("acme", Role::Admin), "ghost", json!({}))
        .await
        .unwrap();

    assert_eq!(envelope.error_code(), Some(ErrorCode::NotFound));
    assert_eq!(gov.audit_records().len(), 1);
    assert_eq!(gov.audit_records()[0].payload.outcome, AuditOutcome::Failed);
}

#[tokio::test]
async fn test_missing_capability_denied_before_handler() {
    let gov = governor(OstiaryConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    gov.registry()
        .register(
            ToolDefinition::new("fetch", v1(), SideEffect::Network).requires(Capability::Network),
            counting(&calls),
        )
        .unwrap();

    let envelope = gov
        .invoke(&ctx("acme", Role::Viewer), "fetch", json!({}))
        .await
        .unwrap();

    assert_eq!(envelope.error_code(), Some(ErrorCode::CapabilityMissing));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(gov.budget_summary("acme").consumed, 0);

    let record = &gov.audit_records()[0];
    assert_eq!(record.payload.outcome, AuditOutcome::Denied);
    let decision = record.payload.decision.as_ref().unwrap();
    assert!(!decision.allowed);
    assert!(decision.matched_rule.starts_with("capability_missing:"));

    // Operators have network access
    let envelope = gov
        .invoke(&ctx("acme", Role::Operator), "fetch", json!({}))
        .await
        .unwrap();
    assert!(envelope.is_success());
}

#[tokio::test]
async fn test_tenant_deny_list_is_forbidden() {
    let mut config = OstiaryConfig::default();
    config.policy.tenants.insert(
        "acme".into(),
        TenantPolicy {
            deny_tools: ["echo".to_string()].into_iter().collect(),
        },
    );
    let gov = governor(config);
    let calls = Arc::new(AtomicUsize::new(0));
    gov.registry()
        .register(ToolDefinition::new("echo", v1(), SideEffect::Read), counting(&calls))
        .unwrap();

    let denied = gov.invoke(&ctx("acme", Role::Admin), "echo", json!({})).await.unwrap();
    assert_eq!(denied.error_code(), Some(ErrorCode::Forbidden));

    let allowed = gov.invoke(&ctx("globex", Role::Viewer), "echo", json!({})).await.unwrap();
    assert!(allowed.is_success());
}

#[tokio::test]
async fn test_schema_violation_never_reaches_handler() {
    let gov = governor(OstiaryConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    gov.registry()
        .register(
            ToolDefinition::new("greet", v1(), SideEffect::Read).with_input_schema(json!({
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            })),
            counting(&calls),
        )
        .unwrap();

    let envelope = gov
        .invoke(&ctx("acme", Role::Viewer), "greet", json!({"name": 42}))
        .await
        .unwrap();

    assert_eq!(envelope.error_code(), Some(ErrorCode::ToolSchemaViolation));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let decision = envelope.provenance.decision.as_ref().unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.matched_rule, "input_schema");
    assert_eq!(gov.budget_summary("acme").consumed, 0);
}

#[tokio::test]
async fn test_invalid_output_is_not_charged() {
    let gov = governor(OstiaryConfig::default());
    gov.registry()
        .register(
            ToolDefinition::new("count", v1(), SideEffect::Read).with_output_schema(json!({
                "type": "object",
                "required": ["count"]
            })),
            handler_fn(|_ctx, _input| async move { Ok(HandlerOutput::new(json!({"oops": 1}))) }),
        )
        .unwrap();
    gov.registry()
        .register(
            ToolDefinition::new("big", v1(), SideEffect::Read).with_max_output_bytes(8),
            handler_fn(|_ctx, _input| async move {
                Ok(HandlerOutput::new(json!({"payload": "far more than eight bytes"})))
            }),
        )
        .unwrap();

    let ctx = ctx("acme", Role::Viewer);
    let invalid = gov.invoke(&ctx, "count", json!({})).await.unwrap();
    assert_eq!(invalid.error_code(), Some(ErrorCode::ToolOutputInvalid));

    let oversized = gov.invoke(&ctx, "big", json!({})).await.unwrap();
    assert_eq!(oversized.error_code(), Some(ErrorCode::ToolOutputInvalid));

    assert_eq!(gov.budget_summary("acme").consumed, 0);
    assert_eq!(gov.meter().charged_count(None), 0);
}

#[tokio::test]
async fn test_budget_exhaustion() {
    let mut config = OstiaryConfig::default();
    config.budget = config.budget.with_tenant_limit("acme", 5);
    let gov = governor(config);
    let calls = Arc::new(AtomicUsize::new(0));
    gov.registry()
        .register(
            ToolDefinition::new("work", v1(), SideEffect::Write).with_estimated_cost(2),
            counting(&calls),
        )
        .unwrap();

    let ctx = ctx("acme", Role::Operator);
    for _ in 0..2 {
        let envelope = gov.invoke(&ctx, "work", json!({})).await.unwrap();
        assert!(envelope.is_success());
    }
    let denied = gov.invoke(&ctx, "work", json!({})).await.unwrap();

    let error = denied.get_error().unwrap();
    assert_eq!(error.code, ErrorCode::BudgetExceeded);
    assert_eq!(error.context.as_ref().unwrap()["remaining"], 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(gov.budget_summary("acme").consumed, 4);
}

#[tokio::test]
async fn test_actual_cost_replaces_estimate() {
    let gov = governor(OstiaryConfig::default());
    gov.registry()
        .register(
            ToolDefinition::new("metered", v1(), SideEffect::Read).with_estimated_cost(10),
            handler_fn(|_ctx, _input| async move {
                Ok(HandlerOutput::new(json!({})).with_cost(3))
            }),
        )
        .unwrap();

    let envelope = gov
        .invoke(&ctx("acme", Role::Viewer), "metered", json!({}))
        .await
        .unwrap();
    assert_eq!(
        envelope.provenance.decision.as_ref().unwrap().actual_cost,
        Some(3)
    );
    let summary = gov.budget_summary("acme");
    assert_eq!(summary.consumed, 3);
    assert_eq!(summary.outstanding, 0);
}

#[tokio::test]
async fn test_tenant_scope_mismatch_releases_budget() {
    let gov = governor(OstiaryConfig::default());
    gov.registry()
        .register(
            ToolDefinition::new("read_doc", v1(), SideEffect::Read)
                .with_tenant_scoped("/doc")
                .with_estimated_cost(5),
            counting(&Arc::new(AtomicUsize::new(0))),
        )
        .unwrap();

    let ctx = ctx("acme", Role::Viewer);
    let denied = gov
        .invoke(&ctx, "read_doc", json!({"doc": "globex/plan.txt"}))
        .await
        .unwrap();
    assert_eq!(denied.error_code(), Some(ErrorCode::TenantMismatch));
    assert_eq!(gov.budget_summary("acme").consumed, 0);

    let allowed = gov
        .invoke(&ctx, "read_doc", json!({"doc": "acme/plan.txt"}))
        .await
        .unwrap();
    assert!(allowed.is_success());
}

#[tokio::test]
async fn test_replay_hit_skips_handler_and_charge() {
    let gov = governor(OstiaryConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    gov.registry()
        .register(
            ToolDefinition::new("hash", v1(), SideEffect::Pure).with_estimated_cost(2),
            counting(&calls),
        )
        .unwrap();

    let ctx = ctx("acme", Role::Viewer);
    let first = gov.invoke(&ctx, "hash", json!({"a": 1, "b": 2})).await.unwrap();
    // Same canonical input, different key order
    let second = gov.invoke(&ctx, "hash", json!({"b": 2, "a": 1})).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.provenance.cache, CacheStatus::Miss);
    assert_eq!(second.provenance.cache, CacheStatus::Hit);
    assert_eq!(first.value(), second.value());
    assert_eq!(
        first.provenance.result_fingerprint,
        second.provenance.result_fingerprint
    );
    assert_eq!(gov.budget_summary("acme").consumed, 2);
    assert_eq!(gov.meter().charged_count(Some("acme")), 1);
    assert_eq!(gov.audit_records().len(), 2);
}

#[tokio::test]
async fn test_concurrent_pure_calls_run_once() {
    let gov = Arc::new(governor(OstiaryConfig::default()));
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    gov.registry()
        .register(
            ToolDefinition::new("slow_hash", v1(), SideEffect::Pure),
            handler_fn(move |_ctx, _input| {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(HandlerOutput::new(json!({"digest": "x"})))
                }
            }),
        )
        .unwrap();

    let invocations = (0..5).map(|_| {
        let gov = Arc::clone(&gov);
        async move {
            gov.invoke(&ctx("acme", Role::Viewer), "slow_hash", json!({"text": "same"}))
                .await
                .unwrap()
        }
    });
    let envelopes = futures::future::join_all(invocations).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let misses = envelopes
        .iter()
        .filter(|e| e.provenance.cache == CacheStatus::Miss)
        .count();
    let coalesced = envelopes
        .iter()
        .filter(|e| e.provenance.cache == CacheStatus::Coalesced)
        .count();
    assert_eq!((misses, coalesced), (1, 4));
    assert!(envelopes.iter().all(|e| e.value() == Some(&json!({"digest": "x"}))));
    assert_eq!(gov.meter().charged_count(None), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handler_timeout() {
    let gov = governor(OstiaryConfig::default());
    gov.registry()
        .register(
            ToolDefinition::new("stall", v1(), SideEffect::Read)
                .with_timeout(Duration::from_millis(100)),
            slow(Duration::from_secs(60)),
        )
        .unwrap();

    let envelope = gov
        .invoke(&ctx("acme", Role::Viewer), "stall", json!({}))
        .await
        .unwrap();
    assert_eq!(envelope.error_code(), Some(ErrorCode::ToolTimeout));
    assert_eq!(gov.budget_summary("acme").consumed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_releases_reservation() {
    let gov = governor(OstiaryConfig::default());
    gov.registry()
        .register(
            ToolDefinition::new("stall", v1(), SideEffect::Read).with_estimated_cost(7),
            slow(Duration::from_secs(10)),
        )
        .unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let ctx = ctx("acme", Role::Viewer).with_cancellation(token);
    let envelope = gov.invoke(&ctx, "stall", json!({})).await.unwrap();

    assert!(envelope.is_cancelled());
    let summary = gov.budget_summary("acme");
    assert_eq!(summary.consumed, 0);
    assert_eq!(summary.outstanding, 0);
    assert_eq!(
        gov.audit_records()[0].payload.outcome,
        AuditOutcome::Cancelled
    );
}

#[tokio::test]
async fn test_breaker_opens_after_consecutive_failures() {
    let mut config = OstiaryConfig::default();
    config.breaker.failure_threshold = 2;
    let gov = governor(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    gov.registry()
        .register(
            ToolDefinition::new("flaky", v1(), SideEffect::Network).with_provider("upstream"),
            handler_fn(move |_ctx, _input| {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<HandlerOutput, _>(ToolError::execution("upstream unavailable"))
                }
            }),
        )
        .unwrap();

    let ctx = ctx("acme", Role::Admin);
    for _ in 0..2 {
        let envelope = gov.invoke(&ctx, "flaky", json!({})).await.unwrap();
        assert_eq!(envelope.error_code(), Some(ErrorCode::ToolExecutionFailed));
    }
    let rejected = gov.invoke(&ctx, "flaky", json!({})).await.unwrap();

    assert_eq!(rejected.error_code(), Some(ErrorCode::CircuitOpen));
    assert!(rejected.get_error().unwrap().retry_after.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(gov.audit_records()[2].payload.outcome, AuditOutcome::Denied);

    let summaries = gov.breaker_summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].provider, "upstream");
    assert_eq!(summaries[0].state, crate::llm::CircuitState::Open);
}

#[tokio::test]
async fn test_chain_limit_counts_whole_request() {
    let mut config = OstiaryConfig::default();
    config.sandbox.max_chain_length = 3;
    let gov = governor(config);
    gov.registry()
        .register(
            ToolDefinition::new("step", v1(), SideEffect::Read),
            counting(&Arc::new(AtomicUsize::new(0))),
        )
        .unwrap();

    let ctx = ctx("acme", Role::Viewer);
    for _ in 0..3 {
        assert!(gov.invoke(&ctx, "step", json!({})).await.unwrap().is_success());
    }
    let denied = gov.invoke(&ctx, "step", json!({})).await.unwrap();
    assert_eq!(denied.error_code(), Some(ErrorCode::ChainLimit));
    let decision = denied.provenance.decision.as_ref().unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(ErrorCode::ChainLimit));
    assert_eq!(decision.matched_rule, "sandbox:chain_length");

    // A new request starts a new chain
    let fresh = InvocationContext::new("acme", Role::Viewer);
    assert!(gov.invoke(&fresh, "step", json!({})).await.unwrap().is_success());
}

#[tokio::test]
async fn test_nested_invocations_hit_recursion_limit() {
    let mut config = OstiaryConfig::default();
    config.sandbox.max_depth = 3;
    let gov = Arc::new(governor(config));

    let cell: Arc<OnceLock<Arc<Governor>>> = Arc::new(OnceLock::new());
    let handler_cell = Arc::clone(&cell);
    gov.registry()
        .register(
            ToolDefinition::new("recurse", v1(), SideEffect::Read),
            handler_fn(move |ctx, input| {
                let cell = Arc::clone(&handler_cell);
                async move {
                    let gov = cell.get().cloned().ok_or_else(|| ToolError::internal("unset"))?;
                    let inner = gov
                        .invoke(&ctx, "recurse", input)
                        .await
                        .map_err(|e| ToolError::internal(e.to_string()))?;
                    let value: Value = inner.into_value()?;
                    Ok(HandlerOutput::new(value))
                }
            }),
        )
        .unwrap();
    cell.set(Arc::clone(&gov)).unwrap();

    let root = ctx("acme", Role::Viewer);
    let envelope = gov.invoke(&root, "recurse", json!({})).await.unwrap();

    assert_eq!(envelope.error_code(), Some(ErrorCode::RecursionLimit));
    let records = gov.audit_for_trace(&root.trace_id);
    assert_eq!(records.len(), 4);
    // The innermost attempt is recorded first
    assert_eq!(records[0].payload.depth, 4);
    assert_eq!(records[0].payload.outcome, AuditOutcome::Denied);
    let decision = records[0].payload.decision.as_ref().unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(ErrorCode::RecursionLimit));
    assert_eq!(decision.matched_rule, "sandbox:depth");
    assert_eq!(records[3].payload.depth, 1);
    assert!(gov.verify_audit().valid);
}

fn file_governor(root: &std::path::Path, config: OstiaryConfig) -> Governor {
    let mut config = config;
    config.sandbox.root = Some(root.to_path_buf());
    let sandbox = config.sandbox.clone();
    let gov = governor(config);
    builtin::register_builtins(gov.registry(), &sandbox, None).unwrap();
    gov
}

#[tokio::test]
async fn test_path_escape_reported_ahead_of_budget() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = OstiaryConfig::default();
    config.budget = config.budget.with_tenant_limit("broke", 0);
    let gov = file_governor(dir.path(), config);

    let ctx = ctx("broke", Role::Viewer);
    let envelope = gov
        .invoke(&ctx, "fs_read", json!({"path": "../../etc/passwd"}))
        .await
        .unwrap();

    assert_eq!(envelope.error_code(), Some(ErrorCode::SandboxEscapeAttempt));
    let decision = envelope.provenance.decision.as_ref().unwrap();
    assert_eq!(decision.reason, Some(ErrorCode::SandboxEscapeAttempt));
    assert_eq!(decision.matched_rule, "sandbox:path");

    let records = gov.audit_for_trace(&ctx.trace_id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload.outcome, AuditOutcome::Denied);
    assert!(!records[0].payload.decision.as_ref().unwrap().allowed);
    assert_eq!(gov.budget_summary("broke").consumed, 0);

    // A legitimate read by the same tenant still hits the empty budget
    std::fs::create_dir_all(dir.path().join("broke")).unwrap();
    std::fs::write(dir.path().join("broke/notes.txt"), "hi").unwrap();
    let envelope = gov
        .invoke(&ctx, "fs_read", json!({"path": "notes.txt"}))
        .await
        .unwrap();
    assert_eq!(envelope.error_code(), Some(ErrorCode::BudgetExceeded));
}

#[tokio::test]
async fn test_tenants_cannot_read_each_others_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("acme")).unwrap();
    std::fs::create_dir_all(dir.path().join("globex")).unwrap();
    std::fs::write(dir.path().join("acme/secret.txt"), "acme only").unwrap();
    let gov = file_governor(dir.path(), OstiaryConfig::default());

    let acme = ctx("acme", Role::Viewer);
    let own = gov
        .invoke(&acme, "fs_read", json!({"path": "secret.txt"}))
        .await
        .unwrap();
    assert_eq!(own.value().unwrap()["content"], "acme only");

    let globex = ctx("globex", Role::Viewer);
    let traversal = gov
        .invoke(&globex, "fs_read", json!({"path": "../acme/secret.txt"}))
        .await
        .unwrap();
    assert_eq!(traversal.error_code(), Some(ErrorCode::SandboxEscapeAttempt));

    let absolute = dir.path().join("acme/secret.txt");
    let absolute = gov
        .invoke(&globex, "fs_read", json!({"path": absolute.to_string_lossy()}))
        .await
        .unwrap();
    assert_eq!(absolute.error_code(), Some(ErrorCode::SandboxEscapeAttempt));

    // The same relative path names globex's own (absent) file
    let relative = gov
        .invoke(&globex, "fs_read", json!({"path": "secret.txt"}))
        .await
        .unwrap();
    assert_eq!(relative.error_code(), Some(ErrorCode::ToolExecutionFailed));
    assert_eq!(gov.budget_summary("globex").consumed, 0);
}
