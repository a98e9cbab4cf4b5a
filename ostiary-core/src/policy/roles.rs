use crate::tools::{Capability, CapabilityPolicy, CapabilitySet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Caller role, ordered by privilege
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Read-only access to content
    #[default]
    Viewer,
    /// Viewer plus access to the audit trail
    Auditor,
    /// Auditor plus writes, network and model calls
    Operator,
    /// Everything
    Admin,
}

impl Role {
    /// All roles, least privileged first
    pub fn all() -> &'static [Role] {
        &[Role::Viewer, Role::Auditor, Role::Operator, Role::Admin]
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Auditor => "auditor",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    /// Built-in capability set for this role
    pub fn default_capabilities(&self) -> CapabilitySet {
        let mut caps =
            CapabilitySet::from_capabilities([Capability::FilesystemRead, Capability::VectorSearch]);
        if *self >= Role::Auditor {
            caps.add(Capability::AuditRead);
        }
        if *self >= Role::Operator {
            caps.add(Capability::FilesystemWrite)
                .add(Capability::Network)
                .add(Capability::ModelCall);
        }
        if *self == Role::Admin {
            caps = CapabilitySet::all();
        }
        caps
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::all()
            .iter()
            .copied()
            .find(|role| role.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!(
                    "Unknown role '{}', expected one of: viewer, auditor, operator, admin",
                    s
                )
            })
    }
}

/// Per-role capability overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleCapabilities {
    /// Capabilities granted on top of the role's defaults
    pub allow: CapabilitySet,

    /// Capabilities explicitly denied; a tool requiring one is `FORBIDDEN`
    pub deny: CapabilitySet,
}

/// Resolve `role` to its capability policy: defaults, plus configured
/// grants, minus configured denials.
pub fn resolve_role(role: Role, overrides: &BTreeMap<Role, RoleCapabilities>) -> CapabilityPolicy {
    let policy = CapabilityPolicy::deny_all().allow_many(role.default_capabilities().iter().copied());
    match overrides.get(&role) {
        Some(extra) => policy
            .allow_many(extra.allow.iter().copied())
            .deny_many(extra.deny.iter().copied()),
        None => policy,
    }
}
