//! Role-based policy gate
//!
//! Roles resolve to explicit capability sets once per context. The
//! [`PolicyGate`] intersects that set with what a tool requires, reserves
//! budget, checks tenant scoping and runs the anomaly heuristics, producing
//! one [`PolicyDecision`] per invocation attempt.

mod gate;
mod roles;

pub use gate::{Admission, Denial, PolicyConfig, PolicyDecision, PolicyGate, TenantPolicy, check_tenant_scope};
pub use roles::{Role, RoleCapabilities, resolve_role};
