//! Repository path handling.
//!
//! Absolute paths begin with `/`; `/` alone is the root. Segments are
//! separated by `/` and may carry a `prefix:` portion that must resolve to
//! a registered namespace (resolution happens in the session, not here).
//! Relative paths are resolved against a context path by concatenation
//! plus `.`/`..` normalisation.

use thiserror::Error;

/// The root path.
pub const ROOT: &str = "/";

/// Errors raised by path parsing and resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// Path violates the basic syntax rules
    #[error("Malformed path: {0}")]
    Malformed(String),

    /// An absolute path was required
    #[error("Path is not absolute: {0}")]
    NotAbsolute(String),

    /// `..` escaped above the root during normalisation
    #[error("Path escapes the root: {0}")]
    EscapesRoot(String),
}

/// Validate an item name (one path segment).
///
/// A name may carry at most one `prefix:` portion; neither side of the
/// colon may be empty. `.` and `..` are reserved and rejected.
pub fn validate_name(name: &str) -> Result<(), PathError> {
    if name.is_empty() {
        return Err(PathError::Malformed("empty name".to_string()));
    }
    if name == "." || name == ".." {
        return Err(PathError::Malformed(format!("reserved name: {}", name)));
    }
    if name.contains('/') {
        return Err(PathError::Malformed(format!(
            "name contains '/': {}",
            name
        )));
    }
    let mut parts = name.split(':');
    let first = parts.next().unwrap_or_default();
    if let Some(local) = parts.next() {
        if parts.next().is_some() {
            return Err(PathError::Malformed(format!(
                "name contains more than one ':': {}",
                name
            )));
        }
        if first.is_empty() || local.is_empty() {
            return Err(PathError::Malformed(format!(
                "empty prefix or local name: {}",
                name
            )));
        }
    }
    Ok(())
}

/// Split a name into its optional namespace prefix and local part.
pub fn name_prefix(name: &str) -> Option<&str> {
    name.split_once(':').map(|(prefix, _)| prefix)
}

/// Validate and normalise an absolute path.
///
/// Accepts `.` and `..` segments and collapses them; rejects relative
/// input, empty segments and a trailing slash (other than root itself).
pub fn normalize(path: &str) -> Result<String, PathError> {
    if !path.starts_with('/') {
        return Err(PathError::NotAbsolute(path.to_string()));
    }
    if path == ROOT {
        return Ok(ROOT.to_string());
    }
    if path.ends_with('/') {
        return Err(PathError::Malformed(format!("trailing slash: {}", path)));
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(PathError::Malformed(format!("empty segment: {}", path))),
            "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(PathError::EscapesRoot(path.to_string()));
                }
            }
            name => {
                validate_name(name)?;
                segments.push(name);
            }
        }
    }
    if segments.is_empty() {
        return Ok(ROOT.to_string());
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Resolve a path against a context path.
///
/// Absolute input is normalised as-is; relative input is appended to the
/// context before normalisation.
pub fn resolve(context: &str, path: &str) -> Result<String, PathError> {
    if path.starts_with('/') {
        return normalize(path);
    }
    if path.is_empty() {
        return Err(PathError::Malformed("empty path".to_string()));
    }
    if context == ROOT {
        normalize(&format!("/{}", path))
    } else {
        normalize(&format!("{}/{}", context, path))
    }
}

/// The parent of an absolute path; the root is its own parent.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(idx) => &path[..idx],
    }
}

/// The last segment of an absolute path; empty for the root.
pub fn node_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join a parent path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// True iff `ancestor` is a strict ancestor of `path`.
pub fn is_strict_ancestor(ancestor: &str, path: &str) -> bool {
    if ancestor == path {
        return false;
    }
    if ancestor == ROOT {
        return path.starts_with('/') && path.len() > 1;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// True iff `path` equals `base` or lies strictly below it.
pub fn is_self_or_descendant(base: &str, path: &str) -> bool {
    base == path || is_strict_ancestor(base, path)
}

/// Substitute the `old_base` prefix of `path` with `new_base`.
///
/// `path` must equal `old_base` or lie below it.
pub fn reparent(path: &str, old_base: &str, new_base: &str) -> String {
    if path == old_base {
        new_base.to_string()
    } else {
        debug_assert!(is_strict_ancestor(old_base, path));
        format!("{}{}", new_base, &path[old_base.len()..])
    }
}
