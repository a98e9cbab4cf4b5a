//! Tool definitions and handler contract
//!
//! A tool is a [`ToolDefinition`] (immutable, serializable data: name,
//! version, schemas, side-effect class, required capabilities, limits) plus
//! a [`ToolHandler`] that does the work. Handlers only run after every gate
//! has passed and receive already-validated input.

use super::capability::{Capability, CapabilitySet};
use super::context::InvocationContext;
use super::result::ToolError;
use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default maximum serialized output size (1 MiB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Declared side-effect class of a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    /// Deterministic function of its input; eligible for the replay cache
    Pure,
    /// Reads external state
    Read,
    /// Mutates external state
    Write,
    /// Talks to the network or a provider
    Network,
}

impl SideEffect {
    /// Get the string name of this class
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffect::Pure => "pure",
            SideEffect::Read => "read",
            SideEffect::Write => "write",
            SideEffect::Network => "network",
        }
    }
}

/// Immutable definition of a registered tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (unique within a version)
    pub name: String,

    /// Semantic version
    pub version: Version,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// JSON Schema for input
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,

    /// JSON Schema for output
    #[serde(default = "default_output_schema")]
    pub output_schema: Value,

    /// Declared side-effect class
    pub side_effect: SideEffect,

    /// Capabilities the caller's role must hold
    #[serde(default)]
    pub required_capabilities: CapabilitySet,

    /// Maximum serialized output size in bytes
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Cost units reserved before execution
    #[serde(default = "default_estimated_cost")]
    pub estimated_cost: u64,

    /// Provider the handler calls out to; routes execution through that provider's breaker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// JSON pointers into the input whose values name a tenant-owned resource
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenant_scoped: Vec<String>,

    /// Execution timeout (falls back to the runtime default)
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Tags for categorization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

fn default_input_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

fn default_output_schema() -> Value {
    serde_json::json!({})
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_estimated_cost() -> u64 {
    1
}

impl ToolDefinition {
    /// Create a definition with permissive schemas and no required capabilities
    pub fn new(name: impl Into<String>, version: Version, side_effect: SideEffect) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            input_schema: default_input_schema(),
            output_schema: default_output_schema(),
            side_effect,
            required_capabilities: CapabilitySet::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            estimated_cost: default_estimated_cost(),
            provider: None,
            tenant_scoped: Vec::new(),
            timeout: None,
            tags: Vec::new(),
        }
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set input schema
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Set output schema
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    /// Require a capability
    pub fn requires(mut self, cap: Capability) -> Self {
        self.required_capabilities.add(cap);
        self
    }

    /// Set maximum output size
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Set estimated cost
    pub fn with_estimated_cost(mut self, cost: u64) -> Self {
        self.estimated_cost = cost;
        self
    }

    /// Route execution through a provider's circuit breaker
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Mark an input location as naming a tenant-owned resource
    pub fn with_tenant_scoped(mut self, pointer: impl Into<String>) -> Self {
        self.tenant_scoped.push(pointer.into());
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Whether results may be served from the replay cache
    pub fn is_pure(&self) -> bool {
        self.side_effect == SideEffect::Pure
    }

    /// `name@version`
    pub fn qualified_name(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Successful handler output
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    /// Result value, validated against the output schema
    pub value: Value,

    /// Actual cost, if the handler knows it; the estimate is settled otherwise
    pub cost: Option<u64>,
}

impl HandlerOutput {
    /// Output with no reported cost
    pub fn new(value: Value) -> Self {
        Self { value, cost: None }
    }

    /// Report the actual cost
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = Some(cost);
        self
    }
}

impl From<Value> for HandlerOutput {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Handler contract
///
/// Called by the pipeline with the child context and validated input.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool
    async fn handle(&self, ctx: &InvocationContext, input: Value)
    -> Result<HandlerOutput, ToolError>;
}

/// Shared handler reference
pub type BoxedHandler = Arc<dyn ToolHandler>;

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(InvocationContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput, ToolError>> + Send,
{
    async fn handle(
        &self,
        ctx: &InvocationContext,
        input: Value,
    ) -> Result<HandlerOutput, ToolError> {
        (self.f)(ctx.clone(), input).await
    }
}

/// Wrap an async closure as a handler
///
/// ```rust
/// use ostiary_core::tools::{handler_fn, HandlerOutput};
///
/// let echo = handler_fn(|_ctx, input| async move { Ok(HandlerOutput::new(input)) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> BoxedHandler
where
    F: Fn(InvocationContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, ToolError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[cfg(test)]
mod tool_tests {
    use super::*;
    use crate::policy::Role;

    #[tokio::test]
    async fn test_handler_fn_execution() {
        let handler = handler_fn(|ctx, input| async move {
            Ok(HandlerOutput::new(serde_json::json!({
                "tenant": ctx.tenant_id,
                "echo": input,
            }))
            .with_cost(3))
        });

        let ctx = InvocationContext::new("tenant-a", Role::Viewer);
        let output = handler
            .handle(&ctx, serde_json::json!({"message": "hello"}))
            .await
            .unwrap();

        assert_eq!(output.value["tenant"], "tenant-a");
        assert_eq!(output.value["echo"]["message"], "hello");
        assert_eq!(output.cost, Some(3));
    }

    #[test]
    fn test_definition_builder() {
        let def = ToolDefinition::new("fetch", Version::new(1, 2, 0), SideEffect::Network)
            .with_description("Fetch a URL")
            .requires(Capability::Network)
            .with_provider("http")
            .with_estimated_cost(5)
            .with_tag("io");

        assert_eq!(def.qualified_name(), "fetch@1.2.0");
        assert!(!def.is_pure());
        assert!(def.required_capabilities.contains(Capability::Network));
        assert_eq!(def.provider.as_deref(), Some("http"));
    }

    #[test]
    fn test_definition_from_json_uses_defaults() {
        let def: ToolDefinition = serde_json::from_value(serde_json::json!({
            "name": "hash",
            "version": "0.1.0",
            "side_effect": "pure",
            "timeout": "2s"
        }))
        .unwrap();

        assert!(def.is_pure());
        assert_eq!(def.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert_eq!(def.estimated_cost, 1);
        assert_eq!(def.timeout, Some(Duration::from_secs(2)));
    }
}
