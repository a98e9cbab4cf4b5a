//! Sandbox guard: recursion depth, call-chain length and path containment
//!
//! All checks are functions over explicit state. Depth travels in the
//! [`InvocationContext`](crate::tools::InvocationContext) and the chain
//! counter is shared only by contexts derived from the same top-level
//! request, so unrelated requests never interfere.

mod guard;
mod path;

pub use guard::{SandboxConfig, SandboxGuard};
pub use path::{normalize_lexically, sandbox_path, tenant_path, tenant_root};
