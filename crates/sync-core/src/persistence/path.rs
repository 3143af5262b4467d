//! Path sanitization: the one primitive every caller-supplied path must
//! pass through before it touches the filesystem. Deliberately stricter
//! than resolving `..` components — a literal `..` substring anywhere in
//! the input is rejected outright, which also catches symlink-escape
//! tricks a pure path-algebra check would miss.

use std::path::{Path, PathBuf};

use crate::error::SyncError;

/// Sanitize `raw` against `base`, returning the absolute path it refers to.
///
/// Algorithm (must stay in this order):
/// 1. Reject empty input.
/// 2. Strip leading `/`s.
/// 3. Reject if the literal substring `..` appears anywhere.
/// 4. Join onto `base`, canonicalize-by-components (not by resolving
///    symlinks), and require the result to be strictly inside `base`.
pub fn sanitize_path(base: &Path, raw: &str) -> Result<PathBuf, SyncError> {
    if raw.is_empty() {
        return Err(SyncError::PathEscape {
            path: raw.to_string(),
        });
    }

    let stripped = raw.trim_start_matches('/');
    if stripped.is_empty() {
        return Err(SyncError::PathEscape {
            path: raw.to_string(),
        });
    }

    if stripped.contains("..") {
        return Err(SyncError::PathEscape {
            path: raw.to_string(),
        });
    }

    let base = normalize(base);
    let candidate = normalize(&base.join(stripped));

    if candidate == base || !candidate.starts_with(&base) {
        return Err(SyncError::PathEscape {
            path: raw.to_string(),
        });
    }

    Ok(candidate)
}

/// Component-wise normalization that does not touch the filesystem (no
/// `canonicalize`, which would fail for paths that don't exist yet).
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component;
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
