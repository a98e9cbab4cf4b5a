use super::path::tenant_path;
use crate::tools::{
    Capability, ErrorCategory, ErrorCode, InvocationContext, ToolDefinition, ToolError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Sandbox limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum nesting depth of tool invocations
    pub max_depth: u32,

    /// Maximum number of tool calls within one top-level request
    pub max_chain_length: u32,

    /// Maximum size of a file a sandboxed tool may touch
    pub max_file_bytes: u64,

    /// Root directory for filesystem tools
    pub root: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_chain_length: 64,
            max_file_bytes: 10 * 1024 * 1024,
            root: None,
        }
    }
}

/// Recursion, chain-length and path guard
#[derive(Debug, Clone, Default)]
pub struct SandboxGuard {
    config: SandboxConfig,
}

impl SandboxGuard {
    /// Create a guard with the given limits
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Get the limits
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Derive the child context for a nested invocation.
    ///
    /// Fails with `RECURSION_LIMIT` when the child would sit deeper than
    /// `max_depth`.
    pub fn check_depth(&self, ctx: &InvocationContext) -> Result<InvocationContext, ToolError> {
        let child = ctx.child();
        if child.depth > self.config.max_depth {
            tracing::warn!(
                tenant = %ctx.tenant_id,
                trace_id = %ctx.trace_id,
                depth = child.depth,
                max_depth = self.config.max_depth,
                "Recursion limit reached"
            );
            return Err(ToolError::new(
                ErrorCode::RecursionLimit,
                format!(
                    "Recursion depth {} exceeds maximum {}",
                    child.depth, self.config.max_depth
                ),
            )
            .with_context(serde_json::json!({
                "depth": child.depth,
                "max_depth": self.config.max_depth,
            })));
        }
        Ok(child)
    }

    /// Count one more call against the request's chain.
    ///
    /// Fails with `CHAIN_LIMIT` once the request has used up
    /// `max_chain_length` calls; a rejected call is not counted.
    pub fn check_chain_length(&self, ctx: &InvocationContext) -> Result<u32, ToolError> {
        let length = ctx.increment_chain();
        if length > self.config.max_chain_length {
            ctx.decrement_chain();
            tracing::warn!(
                tenant = %ctx.tenant_id,
                trace_id = %ctx.trace_id,
                max_chain_length = self.config.max_chain_length,
                "Chain length limit reached"
            );
            return Err(ToolError::new(
                ErrorCode::ChainLimit,
                format!(
                    "Request exceeded {} tool calls",
                    self.config.max_chain_length
                ),
            )
            .with_context(serde_json::json!({
                "max_chain_length": self.config.max_chain_length,
            })));
        }
        Ok(length)
    }

    /// Confine the `path` input of a filesystem tool to the caller's own
    /// directory under the sandbox root.
    ///
    /// Only sandbox violations are raised here. Tools without a filesystem
    /// capability, inputs without a string `path`, and a guard without a
    /// root pass; a missing file is left for the handler to report.
    pub fn check_path(
        &self,
        ctx: &InvocationContext,
        definition: &ToolDefinition,
        input: &Value,
    ) -> Result<(), ToolError> {
        let capabilities = &definition.required_capabilities;
        if !capabilities.contains(Capability::FilesystemRead)
            && !capabilities.contains(Capability::FilesystemWrite)
        {
            return Ok(());
        }
        let (Some(root), Some(requested)) = (
            self.config.root.as_deref(),
            input.get("path").and_then(Value::as_str),
        ) else {
            return Ok(());
        };

        match tenant_path(
            root,
            &ctx.tenant_id,
            Path::new(requested),
            self.config.max_file_bytes,
        ) {
            Err(e) if e.code.category() == ErrorCategory::SandboxViolation => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Role;
    use serde_json::json;

    fn guard(max_depth: u32, max_chain_length: u32) -> SandboxGuard {
        SandboxGuard::new(SandboxConfig {
            max_depth,
            max_chain_length,
            ..Default::default()
        })
    }

    #[test]
    fn depth_limit() {
        let guard = guard(2, 100);
        let root = InvocationContext::new("t", Role::Admin);

        let one = guard.check_depth(&root).unwrap();
        let two = guard.check_depth(&one).unwrap();
        assert_eq!(two.depth, 2);

        let err = guard.check_depth(&two).unwrap_err();
        assert_eq!(err.code, ErrorCode::RecursionLimit);
        // The rejected call does not mutate the parent
        assert_eq!(two.depth, 2);
    }

    #[test]
    fn chain_limit_counts_across_siblings() {
        let guard = guard(8, 3);
        let root = InvocationContext::new("t", Role::Admin);
        let a = guard.check_depth(&root).unwrap();
        let b = guard.check_depth(&root).unwrap();

        assert_eq!(guard.check_chain_length(&a).unwrap(), 1);
        assert_eq!(guard.check_chain_length(&b).unwrap(), 2);
        assert_eq!(guard.check_chain_length(&root).unwrap(), 3);

        let err = guard.check_chain_length(&b).unwrap_err();
        assert_eq!(err.code, ErrorCode::ChainLimit);
        assert_eq!(root.chain_length(), 3);
    }

    fn file_guard(root: &Path) -> SandboxGuard {
        SandboxGuard::new(SandboxConfig {
            root: Some(root.to_path_buf()),
            max_file_bytes: 16,
            ..Default::default()
        })
    }

    fn reader() -> ToolDefinition {
        ToolDefinition::new("reader", semver::Version::new(1, 0, 0), crate::tools::SideEffect::Read)
            .requires(Capability::FilesystemRead)
    }

    #[test]
    fn path_checked_against_tenant_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("acme")).unwrap();
        std::fs::write(dir.path().join("acme/notes.txt"), b"hi").unwrap();
        std::fs::write(dir.path().join("acme/big.txt"), [b'x'; 32]).unwrap();
        let guard = file_guard(dir.path());
        let acme = InvocationContext::new("acme", Role::Viewer);
        let globex = InvocationContext::new("globex", Role::Viewer);

        assert!(guard.check_path(&acme, &reader(), &json!({"path": "notes.txt"})).is_ok());
        // Missing files are the handler's business
        assert!(guard.check_path(&acme, &reader(), &json!({"path": "nope.txt"})).is_ok());
        assert!(guard.check_path(&globex, &reader(), &json!({"path": "notes.txt"})).is_ok());

        let err = guard
            .check_path(&globex, &reader(), &json!({"path": "../acme/notes.txt"}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SandboxEscapeAttempt);

        let err = guard
            .check_path(&acme, &reader(), &json!({"path": "big.txt"}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SandboxFileTooLarge);
    }

    #[test]
    fn path_check_skips_tools_without_file_access() {
        let dir = tempfile::tempdir().unwrap();
        let guard = file_guard(dir.path());
        let ctx = InvocationContext::new("acme", Role::Viewer);
        let escape = json!({"path": "../../etc/passwd"});

        let hasher = ToolDefinition::new(
            "hasher",
            semver::Version::new(1, 0, 0),
            crate::tools::SideEffect::Pure,
        );
        assert!(guard.check_path(&ctx, &hasher, &escape).is_ok());
        assert!(SandboxGuard::default().check_path(&ctx, &reader(), &escape).is_ok());
        assert!(guard.check_path(&ctx, &reader(), &escape).is_err());
    }

    #[test]
    fn separate_requests_have_separate_chains() {
        let guard = guard(8, 1);
        let first = InvocationContext::new("t", Role::Admin);
        let second = InvocationContext::new("t", Role::Admin);

        assert!(guard.check_chain_length(&first).is_ok());
        assert!(guard.check_chain_length(&second).is_ok());
        assert!(guard.check_chain_length(&first).is_err());
    }
}
