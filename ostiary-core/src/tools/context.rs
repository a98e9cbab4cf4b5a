//! Invocation context propagated through the pipeline
//!
//! A context is created once per top-level request by the caller. The
//! pipeline derives child contexts as invocations nest: depth grows by one
//! per level while the chain counter is shared by every context derived from
//! the same root, so it bounds the total number of calls in the request.

use crate::policy::Role;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;

/// Current context schema version
pub const CONTEXT_SCHEMA_VERSION: u32 = 1;

/// Context for one governed invocation
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Tenant the invocation runs for
    pub tenant_id: String,

    /// Caller role, resolved to a capability set by the policy gate
    pub role: Role,

    /// Trace ID for correlation across the whole request
    pub trace_id: String,

    /// Run ID (one per top-level request or skill run)
    pub run_id: String,

    /// Recursion depth; 0 for the caller, 1 for a top-level tool call
    pub depth: u32,

    /// Context schema version
    pub schema_version: u32,

    /// Cancellation token
    pub cancellation: Option<CancellationToken>,

    chain: Arc<AtomicU32>,
}

impl InvocationContext {
    /// Create a root context for a new top-level request
    pub fn new(tenant_id: impl Into<String>, role: Role) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            role,
            trace_id: uuid::Uuid::new_v4().to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            depth: 0,
            schema_version: CONTEXT_SCHEMA_VERSION,
            cancellation: None,
            chain: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Set trace ID
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Set run ID
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Set cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Check if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    /// Number of tool calls made so far within this request
    pub fn chain_length(&self) -> u32 {
        self.chain.load(Ordering::SeqCst)
    }

    /// Derive the context a nested invocation runs with.
    ///
    /// Shares the chain counter and cancellation token with its parent.
    pub(crate) fn child(&self) -> Self {
        let mut child = self.clone();
        child.depth = self.depth.saturating_add(1);
        child
    }

    /// Increment the shared chain counter, returning the new length
    pub(crate) fn increment_chain(&self) -> u32 {
        self.chain.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    /// Undo an increment that was rejected
    pub(crate) fn decrement_chain(&self) {
        // Only called right after a rejected increment, so this never underflows.
        self.chain.fetch_sub(1, Ordering::SeqCst);
    }
}
