use crate::tools::{ErrorCode, ToolError};
use std::path::{Component, Path, PathBuf};

/// Normalize a relative path without touching the filesystem.
///
/// Returns `None` if a `..` would climb above the starting directory or the
/// path is not relative.
pub fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn escape(candidate: &Path, detail: &str) -> ToolError {
    tracing::warn!(candidate = %candidate.display(), detail, "Sandbox escape attempt");
    ToolError::new(
        ErrorCode::SandboxEscapeAttempt,
        format!("Path '{}' resolves outside the sandbox root", candidate.display()),
    )
    .with_context(serde_json::json!({ "detail": detail }))
}

/// Resolve `candidate` against `root`, confining it to the root.
///
/// The candidate is first normalized lexically, so no sequence of `..`
/// segments can leave the root. The deepest existing ancestor of the result
/// is then canonicalized, so a symlink anywhere on the path that points
/// outside the root is rejected as well. Absolute candidates are accepted
/// only if they already lie under the root.
///
/// Fails with `SANDBOX_ESCAPE_ATTEMPT` or, for existing files larger than
/// `max_bytes`, `SANDBOX_FILE_TOO_LARGE`.
pub fn sandbox_path(root: &Path, candidate: &Path, max_bytes: u64) -> Result<PathBuf, ToolError> {
    let canonical_root = root.canonicalize().map_err(|e| {
        ToolError::internal(format!(
            "Sandbox root '{}' is unavailable: {}",
            root.display(),
            e
        ))
    })?;

    let relative = if candidate.is_absolute() {
        match candidate
            .strip_prefix(&canonical_root)
            .or_else(|_| candidate.strip_prefix(root))
        {
            Ok(rest) => rest.to_path_buf(),
            Err(_) => return Err(escape(candidate, "absolute path outside root")),
        }
    } else {
        candidate.to_path_buf()
    };

    let normalized = normalize_lexically(&relative)
        .ok_or_else(|| escape(candidate, "parent traversal above root"))?;
    let joined = canonical_root.join(&normalized);

    // Deepest ancestor that exists (as a file, directory or link)
    let existing = joined
        .ancestors()
        .find(|p| std::fs::symlink_metadata(p).is_ok())
        .unwrap_or(canonical_root.as_path());

    let canonical_existing = existing
        .canonicalize()
        .map_err(|_| escape(candidate, "unresolvable link"))?;
    if !canonical_existing.starts_with(&canonical_root) {
        return Err(escape(candidate, "link resolves outside root"));
    }

    let remainder = joined
        .strip_prefix(existing)
        .map_err(|_| escape(candidate, "path changed during resolution"))?;
    let resolved = canonical_existing.join(remainder);

    if let Ok(metadata) = std::fs::metadata(&resolved)
        && metadata.is_file()
        && metadata.len() > max_bytes
    {
        tracing::warn!(
            path = %resolved.display(),
            size = metadata.len(),
            max_bytes,
            "Sandboxed file too large"
        );
        return Err(ToolError::new(
            ErrorCode::SandboxFileTooLarge,
            format!(
                "File '{}' is {} bytes, limit is {}",
                candidate.display(),
                metadata.len(),
                max_bytes
            ),
        )
        .with_context(serde_json::json!({
            "size": metadata.len(),
            "max_bytes": max_bytes,
        })));
    }

    Ok(resolved)
}

/// The directory under `root` that holds `tenant`'s files.
///
/// A tenant ID that is not a single plain path segment would address a
/// directory other than its own and is rejected as an escape attempt.
pub fn tenant_root(root: &Path, tenant: &str) -> Result<PathBuf, ToolError> {
    let mut components = Path::new(tenant).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(segment)), None) if segment == tenant => Ok(root.join(segment)),
        _ => Err(escape(Path::new(tenant), "tenant id is not a single path segment")),
    }
}

/// Resolve `candidate` inside `tenant`'s directory under `root`.
///
/// Escapes are reported before anything else, so a traversal attempt by a
/// tenant that owns no files yet is still `SANDBOX_ESCAPE_ATTEMPT`.
pub fn tenant_path(
    root: &Path,
    tenant: &str,
    candidate: &Path,
    max_bytes: u64,
) -> Result<PathBuf, ToolError> {
    let base = tenant_root(root, tenant)?;
    if !base.is_dir() {
        if candidate.is_absolute() || normalize_lexically(candidate).is_none() {
            return Err(escape(candidate, "parent traversal above root"));
        }
        return Err(ToolError::execution(format!(
            "Tenant '{}' has no files under the sandbox root",
            tenant
        )));
    }
    sandbox_path(&base, candidate, max_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAX: u64 = 1024;

    fn setup() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/nested")).unwrap();
        std::fs::write(dir.path().join("docs/readme.txt"), b"hello").unwrap();
        dir
    }

    #[test]
    fn resolves_paths_inside_root() {
        let dir = setup();
        let root = dir.path();

        let resolved = sandbox_path(root, Path::new("docs/readme.txt"), MAX).unwrap();
        assert_eq!(resolved, root.canonicalize().unwrap().join("docs/readme.txt"));

        // Traversal that stays inside is fine
        let resolved = sandbox_path(root, Path::new("docs/nested/../readme.txt"), MAX).unwrap();
        assert!(resolved.ends_with("docs/readme.txt"));

        // Non-existent targets resolve too (for writes)
        assert!(sandbox_path(root, Path::new("docs/new/file.txt"), MAX).is_ok());
    }

    #[test]
    fn rejects_parent_traversal() {
        let dir = setup();
        for candidate in ["..", "../etc/passwd", "docs/../../x", "./docs/nested/../../../../y"] {
            let err = sandbox_path(dir.path(), Path::new(candidate), MAX).unwrap_err();
            assert_eq!(err.code, ErrorCode::SandboxEscapeAttempt, "{candidate}");
        }
    }

    #[test]
    fn rejects_absolute_paths_outside_root() {
        let dir = setup();
        let err = sandbox_path(dir.path(), Path::new("/etc/passwd"), MAX).unwrap_err();
        assert_eq!(err.code, ErrorCode::SandboxEscapeAttempt);

        let inside = dir.path().join("docs/readme.txt");
        assert!(sandbox_path(dir.path(), &inside, MAX).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_out_of_root() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"secret").unwrap();

        let dir = setup();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("docs/link")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("secret-link.txt"),
        )
        .unwrap();

        for candidate in ["docs/link/secret.txt", "docs/link/new.txt", "secret-link.txt"] {
            let err = sandbox_path(dir.path(), Path::new(candidate), MAX).unwrap_err();
            assert_eq!(err.code, ErrorCode::SandboxEscapeAttempt, "{candidate}");
        }
    }

    #[test]
    fn rejects_oversized_files() {
        let dir = setup();
        std::fs::write(dir.path().join("big.bin"), vec![0u8; (MAX + 1) as usize]).unwrap();

        let err = sandbox_path(dir.path(), Path::new("big.bin"), MAX).unwrap_err();
        assert_eq!(err.code, ErrorCode::SandboxFileTooLarge);
    }

    #[test]
    fn tenant_root_is_one_segment() {
        let root = Path::new("/srv/files");
        assert_eq!(tenant_root(root, "acme").unwrap(), root.join("acme"));

        for tenant in ["..", ".", "acme/../globex", "a/b", "/etc", ""] {
            let err = tenant_root(root, tenant).unwrap_err();
            assert_eq!(err.code, ErrorCode::SandboxEscapeAttempt, "{tenant:?}");
        }
    }

    #[test]
    fn tenants_only_see_their_own_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("acme")).unwrap();
        std::fs::create_dir_all(dir.path().join("globex")).unwrap();
        std::fs::write(dir.path().join("acme/secret.txt"), b"acme only").unwrap();

        let resolved = tenant_path(dir.path(), "acme", Path::new("secret.txt"), MAX).unwrap();
        assert!(resolved.ends_with("acme/secret.txt"));

        let err = tenant_path(dir.path(), "globex", Path::new("../acme/secret.txt"), MAX)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SandboxEscapeAttempt);

        let inside_acme = dir.path().join("acme/secret.txt");
        let err = tenant_path(dir.path(), "globex", &inside_acme, MAX).unwrap_err();
        assert_eq!(err.code, ErrorCode::SandboxEscapeAttempt);
    }

    #[test]
    fn escape_reported_before_missing_tenant_directory() {
        let dir = tempfile::tempdir().unwrap();

        let err = tenant_path(dir.path(), "initech", Path::new("../../etc/passwd"), MAX)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SandboxEscapeAttempt);

        let err = tenant_path(dir.path(), "initech", Path::new("notes.txt"), MAX).unwrap_err();
        assert_eq!(err.code, ErrorCode::ToolExecutionFailed);
    }

    proptest! {
        #[test]
        fn resolved_paths_never_leave_root(
            segments in proptest::collection::vec(
                prop_oneof![
                    Just("..".to_string()),
                    Just(".".to_string()),
                    Just("docs".to_string()),
                    Just("nested".to_string()),
                    "[a-z]{1,6}",
                ],
                1..12,
            )
        ) {
            let dir = setup();
            let candidate: PathBuf = segments.iter().collect();
            let canonical_root = dir.path().canonicalize().unwrap();

            if let Ok(resolved) = sandbox_path(dir.path(), &candidate, MAX) {
                prop_assert!(resolved.starts_with(&canonical_root));
            }
        }
    }
}
