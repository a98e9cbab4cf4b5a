//! Capability-based permission system for tools
//!
//! Tools declare the capabilities they require; a role resolves once per
//! context to a [`CapabilityPolicy`] and the policy gate intersects the two.
//! Enforcement is deny-by-default: anything not explicitly allowed is missing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Capabilities that tools may require
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Read from the sandboxed filesystem
    FilesystemRead,

    /// Write to the sandboxed filesystem
    FilesystemWrite,

    /// Make network requests
    Network,

    /// Query vector indexes
    VectorSearch,

    /// Call a model provider
    ModelCall,

    /// Execute subprocesses
    Subprocess,

    /// Access secrets/credentials
    Secrets,

    /// Read audit records
    AuditRead,
}

impl Capability {
    /// Get all defined capabilities
    pub fn all() -> &'static [Capability] {
        &[
            Capability::FilesystemRead,
            Capability::FilesystemWrite,
            Capability::Network,
            Capability::VectorSearch,
            Capability::ModelCall,
            Capability::Subprocess,
            Capability::Secrets,
            Capability::AuditRead,
        ]
    }

    /// Get the string name of this capability
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::FilesystemRead => "filesystem_read",
            Capability::FilesystemWrite => "filesystem_write",
            Capability::Network => "network",
            Capability::VectorSearch => "vector_search",
            Capability::ModelCall => "model_call",
            Capability::Subprocess => "subprocess",
            Capability::Secrets => "secrets",
            Capability::AuditRead => "audit_read",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::all()
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown capability '{}'", s))
    }
}

/// An ordered set of capabilities.
///
/// Ordered so that serialized definitions (and therefore digests and audit
/// payloads) do not depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    capabilities: BTreeSet<Capability>,
}

impl CapabilitySet {
    /// Create an empty capability set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a capability set with all capabilities
    pub fn all() -> Self {
        Capability::all().iter().copied().collect()
    }

    /// Create a capability set from an iterator of capabilities
    pub fn from_capabilities(iter: impl IntoIterator<Item = Capability>) -> Self {
        iter.into_iter().collect()
    }

    /// Add a capability
    pub fn add(&mut self, cap: Capability) -> &mut Self {
        self.capabilities.insert(cap);
        self
    }

    /// Remove a capability
    pub fn remove(&mut self, cap: Capability) -> &mut Self {
        self.capabilities.remove(&cap);
        self
    }

    /// Check if capability is present
    pub fn contains(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Check if all capabilities in `required` are present
    pub fn contains_all(&self, required: &CapabilitySet) -> bool {
        required.capabilities.is_subset(&self.capabilities)
    }

    /// Get missing capabilities compared to required set
    pub fn missing(&self, required: &CapabilitySet) -> CapabilitySet {
        required
            .capabilities
            .difference(&self.capabilities)
            .copied()
            .collect()
    }

    /// Capabilities present in both sets
    pub fn intersection(&self, other: &CapabilitySet) -> CapabilitySet {
        self.capabilities
            .intersection(&other.capabilities)
            .copied()
            .collect()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Number of capabilities in the set
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Get iterator over capabilities
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }

    /// Comma-separated names, for messages and logs
    pub fn names(&self) -> String {
        self.capabilities
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self {
            capabilities: iter.into_iter().collect(),
        }
    }
}

/// Why a capability check failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityDenial {
    /// Required capabilities sit on the policy's explicit deny list
    Forbidden(CapabilitySet),

    /// Required capabilities were never granted
    Missing(CapabilitySet),
}

/// Capability policy resolved for a role: an allow list plus a deny list.
///
/// The deny list takes precedence, and anything on neither list is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPolicy {
    /// Explicitly allowed capabilities
    #[serde(default)]
    allowed: CapabilitySet,

    /// Explicitly denied capabilities (takes precedence over allowed)
    #[serde(default)]
    denied: CapabilitySet,
}

impl CapabilityPolicy {
    /// Create a policy that denies all capabilities
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Create a policy that allows all capabilities
    pub fn allow_all() -> Self {
        Self {
            allowed: CapabilitySet::all(),
            denied: CapabilitySet::new(),
        }
    }

    /// Allow a specific capability
    pub fn allow(mut self, cap: Capability) -> Self {
        self.allowed.add(cap);
        self.denied.remove(cap);
        self
    }

    /// Deny a specific capability
    pub fn deny(mut self, cap: Capability) -> Self {
        self.denied.add(cap);
        self.allowed.remove(cap);
        self
    }

    /// Allow multiple capabilities
    pub fn allow_many(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        for cap in caps {
            self = self.allow(cap);
        }
        self
    }

    /// Deny multiple capabilities
    pub fn deny_many(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        for cap in caps {
            self = self.deny(cap);
        }
        self
    }

    /// Check if a capability is allowed by this policy
    pub fn is_allowed(&self, cap: Capability) -> bool {
        !self.denied.contains(cap) && self.allowed.contains(cap)
    }

    /// Check that every required capability is allowed.
    ///
    /// Explicitly denied capabilities are reported ahead of missing ones.
    pub fn check_all(&self, required: &CapabilitySet) -> Result<(), CapabilityDenial> {
        let forbidden = self.denied.intersection(required);
        if !forbidden.is_empty() {
            return Err(CapabilityDenial::Forbidden(forbidden));
        }

        let missing = self.allowed.missing(required);
        if !missing.is_empty() {
            return Err(CapabilityDenial::Missing(missing));
        }

        Ok(())
    }

    /// Get allowed capabilities
    pub fn allowed(&self) -> &CapabilitySet {
        &self.allowed
    }

    /// Get denied capabilities
    pub fn denied(&self) -> &CapabilitySet {
        &self.denied
    }
}
