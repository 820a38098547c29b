//! Path containment for every path argument the agent receives.

use crate::{AgentError, Result};
use deploy_core::paths::{has_traversal, normalize_relative, to_posix};
use deploy_core::STATE_DIR;
use std::fs;
use std::path::{Path, PathBuf};

/// A validated request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// POSIX path relative to the project root (`""` for the root itself)
    pub relative: String,
    pub absolute: PathBuf,
}

impl ResolvedPath {
    pub fn is_root(&self) -> bool {
        self.relative.is_empty()
    }
}

/// Resolves client paths against the canonical project root.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    pub fn new(root: &Path) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| {
            AgentError::Config(format!("project root {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate `input`; the project root itself (`""`, `"."`, `"/"`) is accepted.
    pub fn resolve(&self, input: &str) -> Result<ResolvedPath> {
        if input.contains('\0') {
            return Err(AgentError::BadRequest("path contains a null byte".into()));
        }
        if has_traversal(input) {
            return Err(AgentError::Forbidden(format!("path traversal rejected: {input}")));
        }

        let relative = normalize_relative(input).unwrap_or_default();
        if relative == STATE_DIR || relative.starts_with(&format!("{STATE_DIR}/")) {
            return Err(AgentError::Forbidden(format!("{STATE_DIR} is reserved")));
        }

        let absolute = if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&relative)
        };
        self.check_contained(&absolute, input)?;

        Ok(ResolvedPath { relative, absolute })
    }

    /// Like [`resolve`](Self::resolve) but refuses the project root.
    pub fn resolve_entry(&self, input: &str) -> Result<ResolvedPath> {
        let resolved = self.resolve(input)?;
        if resolved.is_root() {
            return Err(AgentError::BadRequest(
                "operation is not allowed on the project root".into(),
            ));
        }
        Ok(resolved)
    }

    /// Root-relative POSIX form of an absolute path under the root.
    pub fn relative(&self, absolute: &Path) -> Option<String> {
        absolute.strip_prefix(&self.root).ok().map(to_posix)
    }

    /// The canonical form of the nearest existing ancestor must stay under root.
    fn check_contained(&self, absolute: &Path, input: &str) -> Result<()> {
        let mut candidate = absolute;
        while fs::symlink_metadata(candidate).is_err() {
            match candidate.parent() {
                Some(parent) => candidate = parent,
                None => break,
            }
        }

        let canonical = candidate
            .canonicalize()
            .map_err(|_| AgentError::Forbidden(format!("cannot resolve path: {input}")))?;
        if !canonical.starts_with(&self.root) {
            return Err(AgentError::Forbidden(format!(
                "path escapes project root: {input}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn guard() -> (TempDir, PathGuard) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c.txt"), b"c").unwrap();
        let guard = PathGuard::new(dir.path()).unwrap();
        (dir, guard)
    }

    #[test]
    fn test_rejects_traversal() {
        let (_dir, guard) = guard();
        assert!(matches!(
            guard.resolve("../../etc/passwd"),
            Err(AgentError::Forbidden(_))
        ));
        assert!(matches!(guard.resolve("a/../../b"), Err(AgentError::Forbidden(_))));
        assert!(matches!(guard.resolve("a\\..\\b"), Err(AgentError::Forbidden(_))));
    }

    #[test]
    fn test_rejects_null_byte() {
        let (_dir, guard) = guard();
        assert!(matches!(
            guard.resolve("a/b\0/c.txt"),
            Err(AgentError::BadRequest(_))
        ));
    }

    #[test]
    fn test_accepts_nested_file() {
        let (_dir, guard) = guard();
        let resolved = guard.resolve("a/b/c.txt").unwrap();
        assert_eq!(resolved.relative, "a/b/c.txt");
        assert_eq!(resolved.absolute, guard.root().join("a/b/c.txt"));
    }

    #[test]
    fn test_leading_slash_is_root_relative() {
        let (_dir, guard) = guard();
        let resolved = guard.resolve("/a/b/c.txt").unwrap();
        assert_eq!(resolved.relative, "a/b/c.txt");
    }

    #[test]
    fn test_missing_parents_fall_back_to_existing_ancestor() {
        let (_dir, guard) = guard();
        let resolved = guard.resolve("a/new/deeper/file.txt").unwrap();
        assert_eq!(resolved.relative, "a/new/deeper/file.txt");
    }

    #[test]
    fn test_root_only_through_resolve() {
        let (_dir, guard) = guard();
        assert!(guard.resolve("").unwrap().is_root());
        assert!(guard.resolve(".").unwrap().is_root());
        assert!(matches!(guard.resolve_entry("/"), Err(AgentError::BadRequest(_))));
    }

    #[test]
    fn test_state_dir_is_reserved() {
        let (_dir, guard) = guard();
        assert!(matches!(guard.resolve(".deploy/trash"), Err(AgentError::Forbidden(_))));
        assert!(matches!(guard.resolve(".deploy"), Err(AgentError::Forbidden(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let (dir, guard) = guard();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        assert!(matches!(
            guard.resolve("escape/secret.txt"),
            Err(AgentError::Forbidden(_))
        ));
    }
}
