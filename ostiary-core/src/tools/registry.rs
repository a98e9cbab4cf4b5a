//! Registry of versioned tool and skill definitions
//!
//! The `ToolRegistry` provides:
//! - Registration with `name@version` duplicate detection
//! - Lookup of the highest version by name, or an exact version
//! - A stable content digest per definition
//! - Listing in registration order, optionally filtered by capability policy
//!
//! Registration compiles the definition's schemas once; lookups hand out
//! shared [`RegisteredTool`] entries so the pipeline never recompiles them.
//!
//! # Example
//!
//! ```rust
//! use ostiary_core::tools::{handler_fn, HandlerOutput, SideEffect, ToolDefinition, ToolRegistry};
//! use semver::Version;
//!
//! let registry = ToolRegistry::new();
//! let def = ToolDefinition::new("echo", Version::new(1, 0, 0), SideEffect::Pure);
//! registry
//!     .register(def, handler_fn(|_ctx, input| async move { Ok(HandlerOutput::new(input)) }))
//!     .unwrap();
//!
//! let tool = registry.lookup("echo").unwrap();
//! assert_eq!(tool.digest().len(), 64);
//! ```

use super::capability::CapabilityPolicy;
use super::result::{ErrorCode, ToolError};
use super::schema::CompiledSchema;
use super::tool::{BoxedHandler, SideEffect, ToolDefinition};
use crate::fingerprint;
use crate::skills::SkillDefinition;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// Name and version already registered
    AlreadyRegistered {
        /// Definition name
        name: String,
        /// Definition version
        version: Version,
    },
    /// No definition with this name (and version, if given)
    NotFound(String),
    /// The definition's schema could not be compiled
    InvalidSchema(String),
    /// The definition could not be canonicalized
    InvalidDefinition(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::AlreadyRegistered { name, version } => {
                write!(f, "'{}@{}' is already registered", name, version)
            }
            RegistryError::NotFound(name) => {
                write!(f, "'{}' not found", name)
            }
            RegistryError::InvalidSchema(msg) => {
                write!(f, "Invalid schema: {}", msg)
            }
            RegistryError::InvalidDefinition(msg) => {
                write!(f, "Invalid definition: {}", msg)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

impl RegistryError {
    /// Taxonomy code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::AlreadyRegistered { .. } => ErrorCode::AlreadyRegistered,
            RegistryError::NotFound(_) => ErrorCode::NotFound,
            RegistryError::InvalidSchema(_) => ErrorCode::ToolSchemaViolation,
            RegistryError::InvalidDefinition(_) => ErrorCode::Internal,
        }
    }
}

impl From<RegistryError> for ToolError {
    fn from(err: RegistryError) -> Self {
        ToolError::new(err.code(), err.to_string())
    }
}

/// A registered tool: definition, handler, digest and compiled schemas
pub struct RegisteredTool {
    definition: ToolDefinition,
    handler: BoxedHandler,
    digest: String,
    input_schema: CompiledSchema,
    output_schema: CompiledSchema,
}

impl RegisteredTool {
    /// The immutable definition
    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// The handler
    pub fn handler(&self) -> &BoxedHandler {
        &self.handler
    }

    /// Content digest of the definition
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Compiled input schema
    pub fn input_schema(&self) -> &CompiledSchema {
        &self.input_schema
    }

    /// Compiled output schema
    pub fn output_schema(&self) -> &CompiledSchema {
        &self.output_schema
    }

    /// Summary for listing
    pub fn summary(&self) -> ToolSummary {
        let def = &self.definition;
        ToolSummary {
            name: def.name.clone(),
            version: def.version.to_string(),
            description: def.description.clone(),
            side_effect: def.side_effect,
            required_capabilities: def
                .required_capabilities
                .iter()
                .map(|c| c.to_string())
                .collect(),
            provider: def.provider.clone(),
            tags: def.tags.clone(),
            digest: self.digest.clone(),
        }
    }
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.definition.name)
            .field("version", &self.definition.version.to_string())
            .field("digest", &self.digest)
            .finish()
    }
}

/// A registered skill and its digest
#[derive(Debug)]
pub struct RegisteredSkill {
    definition: SkillDefinition,
    digest: String,
}

impl RegisteredSkill {
    /// The immutable definition
    pub fn definition(&self) -> &SkillDefinition {
        &self.definition
    }

    /// Content digest of the definition
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Summary for listing
    pub fn summary(&self) -> SkillSummary {
        SkillSummary {
            name: self.definition.name.clone(),
            version: self.definition.version.to_string(),
            description: self.definition.description.clone(),
            required_tools: self.definition.required_tools.clone(),
            steps: self.definition.steps.len(),
            rollback_steps: self.definition.rollback.len(),
            digest: self.digest.clone(),
        }
    }
}

/// Summary of a tool for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSummary {
    /// Tool name
    pub name: String,
    /// Tool version
    pub version: String,
    /// Tool description
    pub description: String,
    /// Declared side-effect class
    pub side_effect: SideEffect,
    /// Required capabilities
    pub required_capabilities: Vec<String>,
    /// Provider routed through the breaker
    pub provider: Option<String>,
    /// Tags for categorization
    pub tags: Vec<String>,
    /// Definition digest
    pub digest: String,
}

/// Summary of a skill for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillSummary {
    /// Skill name
    pub name: String,
    /// Skill version
    pub version: String,
    /// Skill description
    pub description: String,
    /// Tools the skill depends on
    pub required_tools: Vec<String>,
    /// Number of forward steps
    pub steps: usize,
    /// Number of rollback steps
    pub rollback_steps: usize,
    /// Definition digest
    pub digest: String,
}

/// Versioned entries with registration order preserved
struct Versioned<T> {
    entries: Vec<Arc<T>>,
    index: HashMap<String, BTreeMap<Version, usize>>,
}

impl<T> Default for Versioned<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Versioned<T> {
    fn contains(&self, name: &str, version: &Version) -> bool {
        self.index
            .get(name)
            .is_some_and(|versions| versions.contains_key(version))
    }

    fn insert(&mut self, name: String, version: Version, entry: T) -> Arc<T> {
        let entry = Arc::new(entry);
        self.index
            .entry(name)
            .or_default()
            .insert(version, self.entries.len());
        self.entries.push(Arc::clone(&entry));
        entry
    }

    fn latest(&self, name: &str) -> Option<Arc<T>> {
        self.index
            .get(name)
            .and_then(|versions| versions.values().next_back())
            .map(|&i| Arc::clone(&self.entries[i]))
    }

    fn exact(&self, name: &str, version: &Version) -> Option<Arc<T>> {
        self.index
            .get(name)
            .and_then(|versions| versions.get(version))
            .map(|&i| Arc::clone(&self.entries[i]))
    }
}

/// Registry for tool and skill definitions
///
/// Interior locking lets a registry shared behind an `Arc` accept new
/// definitions while the pipeline is serving lookups.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<Versioned<RegisteredTool>>,
    skills: RwLock<Versioned<RegisteredSkill>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tool_count", &self.len())
            .field("skill_count", &self.list_skills().len())
            .finish()
    }
}

/// Digest over the canonical `{name, version, input_schema, output_schema}`
pub fn tool_digest(definition: &ToolDefinition) -> String {
    fingerprint::fingerprint(&serde_json::json!({
        "name": definition.name,
        "version": definition.version.to_string(),
        "input_schema": definition.input_schema,
        "output_schema": definition.output_schema,
    }))
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool
    ///
    /// Returns an error if the same name and version is already registered
    /// or either schema fails to compile.
    pub fn register(
        &self,
        definition: ToolDefinition,
        handler: BoxedHandler,
    ) -> Result<Arc<RegisteredTool>, RegistryError> {
        let input_schema = CompiledSchema::compile(&definition.input_schema)
            .map_err(|e| RegistryError::InvalidSchema(e.message))?;
        let output_schema = CompiledSchema::compile(&definition.output_schema)
            .map_err(|e| RegistryError::InvalidSchema(e.message))?;
        let digest = tool_digest(&definition);

        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.contains(&definition.name, &definition.version) {
            return Err(RegistryError::AlreadyRegistered {
                name: definition.name,
                version: definition.version,
            });
        }

        tracing::debug!(
            tool = %definition.name,
            version = %definition.version,
            digest = %digest,
            "Registered tool"
        );

        let name = definition.name.clone();
        let version = definition.version.clone();
        Ok(tools.insert(
            name,
            version,
            RegisteredTool {
                definition,
                handler,
                digest,
                input_schema,
                output_schema,
            },
        ))
    }

    /// Look up the highest registered version of a tool
    pub fn lookup(&self, name: &str) -> Result<Arc<RegisteredTool>, RegistryError> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Look up an exact tool version
    pub fn lookup_version(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<Arc<RegisteredTool>, RegistryError> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .exact(name, version)
            .ok_or_else(|| RegistryError::NotFound(format!("{}@{}", name, version)))
    }

    /// Check if any version of a tool is registered
    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .index
            .contains_key(name)
    }

    /// All registered tools in registration order
    pub fn list(&self) -> Vec<Arc<RegisteredTool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    /// Summaries of all registered tools in registration order
    pub fn summaries(&self) -> Vec<ToolSummary> {
        self.list().iter().map(|t| t.summary()).collect()
    }

    /// Tools whose required capabilities are allowed by the policy
    pub fn filter_by_policy(&self, policy: &CapabilityPolicy) -> Vec<Arc<RegisteredTool>> {
        self.list()
            .into_iter()
            .filter(|tool| {
                policy
                    .check_all(&tool.definition().required_capabilities)
                    .is_ok()
            })
            .collect()
    }

    /// Get the number of registered tool versions
    pub fn len(&self) -> usize {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Check if no tools are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a skill
    pub fn register_skill(
        &self,
        definition: SkillDefinition,
    ) -> Result<Arc<RegisteredSkill>, RegistryError> {
        definition
            .validate()
            .map_err(RegistryError::InvalidDefinition)?;
        let digest = definition
            .digest()
            .map_err(|e| RegistryError::InvalidDefinition(e.to_string()))?;

        let mut skills = self.skills.write().unwrap_or_else(PoisonError::into_inner);
        if skills.contains(&definition.name, &definition.version) {
            return Err(RegistryError::AlreadyRegistered {
                name: definition.name,
                version: definition.version,
            });
        }

        tracing::debug!(
            skill = %definition.name,
            version = %definition.version,
            digest = %digest,
            "Registered skill"
        );

        let name = definition.name.clone();
        let version = definition.version.clone();
        Ok(skills.insert(name, version, RegisteredSkill { definition, digest }))
    }

    /// Look up the highest registered version of a skill
    pub fn lookup_skill(&self, name: &str) -> Result<Arc<RegisteredSkill>, RegistryError> {
        self.skills
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Look up an exact skill version
    pub fn lookup_skill_version(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<Arc<RegisteredSkill>, RegistryError> {
        self.skills
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .exact(name, version)
            .ok_or_else(|| RegistryError::NotFound(format!("{}@{}", name, version)))
    }

    /// All registered skills in registration order
    pub fn list_skills(&self) -> Vec<Arc<RegisteredSkill>> {
        self.skills
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }
}
