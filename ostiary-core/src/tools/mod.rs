//! Tool definitions, registry and invocation types
//!
//! A tool is a [`ToolDefinition`] (serializable data: name, semver
//! version, schemas, side-effect class, required capabilities, cost) plus a
//! [`ToolHandler`]. Both are registered together in the [`ToolRegistry`];
//! invocations go through [`crate::governor::Governor`], which wraps every
//! call in the governance pipeline and returns a [`ToolResultEnvelope`].
//!
//! # Example
//!
//! ```rust
//! use ostiary_core::tools::{
//!     Capability, HandlerOutput, SideEffect, ToolDefinition, ToolRegistry, handler_fn,
//! };
//! use semver::Version;
//!
//! let registry = ToolRegistry::new();
//! let definition = ToolDefinition::new("lookup", Version::new(1, 2, 0), SideEffect::Read)
//!     .requires(Capability::VectorSearch)
//!     .with_estimated_cost(3);
//! registry
//!     .register(definition, handler_fn(|_ctx, input| async move { Ok(HandlerOutput::new(input)) }))
//!     .unwrap();
//!
//! assert_eq!(registry.lookup("lookup").unwrap().definition().version, Version::new(1, 2, 0));
//! ```

pub mod builtin;
mod capability;
mod context;
mod registry;
mod result;
mod schema;
mod tool;

pub use capability::{Capability, CapabilityDenial, CapabilityPolicy, CapabilitySet};
pub use context::{CONTEXT_SCHEMA_VERSION, InvocationContext};
pub use registry::{
    RegisteredSkill, RegisteredTool, RegistryError, SkillSummary, ToolRegistry, ToolSummary,
    tool_digest,
};
pub use result::{
    CacheStatus, ErrorCategory, ErrorCode, RESULT_SCHEMA_VERSION, ToolError, ToolProvenance,
    ToolResult, ToolResultEnvelope, ToolWarning, ValidationError,
};
pub use schema::CompiledSchema;
pub use tool::{
    BoxedHandler, DEFAULT_MAX_OUTPUT_BYTES, FnHandler, HandlerOutput, SideEffect, ToolDefinition,
    ToolHandler, handler_fn,
};

#[cfg(test)]
mod tests;
