//! Built-in tools
//!
//! - `fs_read`: read a file under the caller's directory in the sandbox root
//! - `sha256`: pure digest of a string, served from the replay cache
//! - `model_complete`: completion through a [`ModelProvider`], behind the
//!   provider's circuit breaker

use super::{
    BoxedHandler, Capability, ErrorCode, HandlerOutput, InvocationContext, RegistryError,
    SideEffect, ToolDefinition, ToolError, ToolHandler, ToolRegistry,
};
use crate::fingerprint::sha256_hex;
use crate::llm::{ModelCallTool, ModelProvider};
use crate::sandbox::{SandboxConfig, tenant_path};
use async_trait::async_trait;
use semver::Version;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Register the built-ins that the configuration supports: `sha256` always,
/// `fs_read` when a sandbox root is set, `model_complete` when a provider is
/// given.
pub fn register_builtins(
    registry: &ToolRegistry,
    sandbox: &SandboxConfig,
    provider: Option<Arc<dyn ModelProvider>>,
) -> Result<(), RegistryError> {
    let (definition, handler) = sha256_tool();
    registry.register(definition, handler)?;

    if let Some(root) = &sandbox.root {
        let (definition, handler) = fs_read_tool(root.clone(), sandbox.max_file_bytes);
        registry.register(definition, handler)?;
    }

    if let Some(provider) = provider {
        let (definition, handler) = model_complete_tool(provider);
        registry.register(definition, handler)?;
    }
    Ok(())
}

/// Pure SHA-256 of `text`
pub fn sha256_tool() -> (ToolDefinition, BoxedHandler) {
    let definition = ToolDefinition::new("sha256", Version::new(1, 0, 0), SideEffect::Pure)
        .with_description("SHA-256 digest of a UTF-8 string, as lowercase hex")
        .with_input_schema(json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"],
            "additionalProperties": false
        }))
        .with_output_schema(json!({
            "type": "object",
            "properties": {
                "digest": { "type": "string", "pattern": "^[0-9a-f]{64}$" },
                "bytes": { "type": "integer", "minimum": 0 }
            },
            "required": ["digest", "bytes"]
        }))
        .with_estimated_cost(1)
        .with_tag("builtin");

    let handler = super::handler_fn(|_ctx, input| async move {
        let text = input
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::execution("'text' must be a string"))?;
        Ok(HandlerOutput::new(json!({
            "digest": sha256_hex(text),
            "bytes": text.len(),
        })))
    });
    (definition, handler)
}

/// Sandboxed file read under `root/<tenant_id>`
pub fn fs_read_tool(root: PathBuf, max_file_bytes: u64) -> (ToolDefinition, BoxedHandler) {
    let definition = ToolDefinition::new("fs_read", Version::new(1, 0, 0), SideEffect::Read)
        .with_description("Read a UTF-8 text file from the tenant's sandbox directory")
        .with_input_schema(json!({
            "type": "object",
            "properties": { "path": { "type": "string", "minLength": 1 } },
            "required": ["path"],
            "additionalProperties": false
        }))
        .with_output_schema(json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" },
                "bytes": { "type": "integer", "minimum": 0 }
            },
            "required": ["path", "content", "bytes"]
        }))
        .requires(Capability::FilesystemRead)
        .with_estimated_cost(1)
        .with_tag("builtin");

    let handler: BoxedHandler = Arc::new(FsReadTool {
        root,
        max_file_bytes,
    });
    (definition, handler)
}

/// Completion through `provider`
pub fn model_complete_tool(provider: Arc<dyn ModelProvider>) -> (ToolDefinition, BoxedHandler) {
    let handler = ModelCallTool::new(provider);
    let definition =
        ToolDefinition::new("model_complete", Version::new(1, 0, 0), SideEffect::Network)
            .with_description("Send a prompt to a model provider")
            .with_input_schema(json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string" },
                    "system": { "type": "string" },
                    "model": { "type": "string" },
                    "max_tokens": { "type": "integer", "minimum": 1 }
                },
                "required": ["prompt"],
                "additionalProperties": false
            }))
            .with_output_schema(json!({
                "type": "object",
                "properties": {
                    "content": { "type": "string" },
                    "model": { "type": "string" }
                },
                "required": ["content", "model"]
            }))
            .requires(Capability::ModelCall)
            .requires(Capability::Network)
            .with_provider(handler.provider_id())
            .with_estimated_cost(64)
            .with_tag("builtin");
    (definition, Arc::new(handler))
}

struct FsReadTool {
    root: PathBuf,
    max_file_bytes: u64,
}

#[async_trait]
impl ToolHandler for FsReadTool {
    async fn handle(
        &self,
        ctx: &InvocationContext,
        input: Value,
    ) -> Result<HandlerOutput, ToolError> {
        let requested = input
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::execution("'path' must be a string"))?;

        let resolved = tenant_path(
            &self.root,
            &ctx.tenant_id,
            Path::new(requested),
            self.max_file_bytes,
        )?;
        tracing::debug!(
            tenant = %ctx.tenant_id,
            path = %resolved.display(),
            "Reading sandboxed file"
        );

        let bytes = tokio::fs::read(&resolved).await.map_err(|e| {
            ToolError::execution(format!("Cannot read '{}': {}", requested, e))
                .with_context(json!({ "path": requested }))
        })?;
        // The size check above can race a concurrent writer
        if bytes.len() as u64 > self.max_file_bytes {
            return Err(ToolError::new(
                ErrorCode::SandboxFileTooLarge,
                format!("File '{}' grew past the limit while reading", requested),
            ));
        }
        let content = String::from_utf8(bytes).map_err(|_| {
            ToolError::execution(format!("'{}' is not valid UTF-8", requested))
        })?;

        Ok(HandlerOutput::new(json!({
            "path": requested,
            "bytes": content.len(),
            "content": content,
        })))
    }
}
