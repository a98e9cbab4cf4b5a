//! # Ostiary - Gatekeeper for Agent Tool Invocations
//!
//! Ostiary governs how agents in a multi-tenant deployment call tools:
//! - Versioned tool and skill registry with JSON Schema contracts
//! - Recursion, chain and filesystem sandboxing
//! - Per-tenant budgets with reserve/settle accounting
//! - Circuit breakers per external provider
//! - Role-based capability policy with tenant deny lists
//! - Replay cache with single-flight for pure tools
//! - Hash-chained, tamper-evident audit trail
//! - Multi-step skills with assertions and rollback
//!
//! ## Quick Start
//!
//! ```rust
//! use ostiary_core::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> Result<()> {
//! let governor = Governor::builder().build()?;
//! register_builtins(governor.registry(), &SandboxConfig::default(), None)?;
//!
//! let ctx = InvocationContext::new("acme", Role::Viewer);
//! let envelope = governor.invoke(&ctx, "sha256", json!({"text": "abc"})).await?;
//!
//! assert!(envelope.is_success());
//! assert!(governor.verify_audit().valid);
//! # Ok(())
//! # }
//! # tokio::runtime::Runtime::new().unwrap().block_on(run()).unwrap();
//! ```
//!
//! ## Architecture
//!
//! [`governor::Governor`] runs every invocation through the same pipeline:
//! lookup, sandbox, input schema, policy gate (capabilities, deny list,
//! budget reservation, tenant scope, anomalies), execution behind the
//! provider breaker and replay cache, output validation, settlement, audit
//! and metering. Every outcome, denials included, comes back as a
//! [`tools::ToolResultEnvelope`] with provenance.

pub mod audit;
pub mod budget;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod governor;
pub mod llm;
pub mod metering;
pub mod policy;
pub mod replay;
pub mod sandbox;
pub mod skills;
pub mod store;
pub mod tools;

pub use error::{OstiaryError, Result};

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::audit::{AuditChain, AuditOutcome, AuditRecord, IntegrityReport};
    pub use crate::budget::{BudgetConfig, BudgetLedger, BudgetSummary};
    pub use crate::config::{OstiaryConfig, StoreConfig};
    pub use crate::error::{OstiaryError, Result};
    pub use crate::governor::{Governor, GovernorBuilder};
    pub use crate::llm::{CircuitBreakerConfig, CircuitState, ModelProvider, StubModelProvider};
    pub use crate::metering::{MeterEvent, MeterLog};
    pub use crate::policy::{PolicyDecision, Role};
    pub use crate::sandbox::SandboxConfig;
    pub use crate::skills::{SkillDefinition, SkillRunResult, SkillStep, ToolStep};
    pub use crate::store::{DurableStore, FileStore, MemoryStore, SharedStore};
    pub use crate::tools::builtin::register_builtins;
    pub use crate::tools::{
        CacheStatus, Capability, ErrorCode, HandlerOutput, InvocationContext, SideEffect,
        ToolDefinition, ToolError, ToolRegistry, ToolResultEnvelope, handler_fn,
    };

    // Re-export async_trait for convenience
    pub use async_trait::async_trait;
}
