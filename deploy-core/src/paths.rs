//! POSIX relative path helpers.
//!
//! Paths crossing the wire are relative to the project root, use `/` as the
//! separator, never start with `/` and never contain a `..` segment.

use std::path::{Component, Path};

/// Split on either separator, dropping empty and `.` segments.
fn segments(input: &str) -> impl Iterator<Item = &str> {
    input
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
}

/// True when any segment of `input` is `..`.
pub fn has_traversal(input: &str) -> bool {
    segments(input).any(|segment| segment == "..")
}

/// Normalize a client-supplied relative path.
///
/// Returns `None` for empty paths and for paths containing `..`.
pub fn normalize_relative(input: &str) -> Option<String> {
    if input.contains('\0') || has_traversal(input) {
        return None;
    }
    let joined = segments(input).collect::<Vec<_>>().join("/");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Render a filesystem-relative path in POSIX form.
pub fn to_posix(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Parent portion of a POSIX relative path (`""` for top-level entries).
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Whether `path` is `scope` itself or lies underneath it.
pub fn is_within(path: &str, scope: &str) -> bool {
    let scope = scope.trim_matches('/');
    scope.is_empty() || path == scope || path.starts_with(&format!("{scope}/"))
}
