//! Path sandboxing: confine every remote operation to its sharing root
//!
//! A client path beginning with the separator is taken relative to the
//! sharing root, anything else relative to the session's current remote
//! directory. Dot-segments collapse lexically and a `..` that would climb
//! above the root is rejected, then the lexical result is symlink-checked
//! against the canonical root. Containment uses path components, never
//! plain string prefixes, so `/share-evil` can not pass as `/share`.

use std::path::{Component, Path, PathBuf};

use crate::protocol::ErrorCode;

/// A sandbox-approved path: the absolute server-side location plus its
/// sharing-relative form (what clients see as names).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub abs: PathBuf,
    pub rel: PathBuf,
}

/// Resolve `requested` against a sharing rooted at `root` with current
/// remote directory `rcwd` (relative to the root).
pub fn resolve(root: &Path, rcwd: &Path, requested: &str) -> Result<Resolved, ErrorCode> {
    if requested.contains('\0') {
        return Err(ErrorCode::InvalidPath);
    }

    // Client-absolute paths restart at the sharing root
    let mut stack: Vec<std::ffi::OsString> = if requested.starts_with('/') {
        Vec::new()
    } else {
        rcwd.components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_os_string()),
                _ => None,
            })
            .collect()
    };

    for comp in Path::new(requested).components() {
        match comp {
            Component::CurDir | Component::RootDir => {}
            Component::Normal(s) => stack.push(s.to_os_string()),
            Component::ParentDir => {
                // Popping past the root is an escape, not a no-op
                if stack.pop().is_none() {
                    return Err(ErrorCode::InvalidPath);
                }
            }
            Component::Prefix(_) => return Err(ErrorCode::InvalidPath),
        }
    }

    let rel: PathBuf = stack.iter().collect();
    let abs = root.join(&rel);
    check_contained(root, &abs)?;
    Ok(Resolved { abs, rel })
}

/// Symlink containment: canonicalize what exists (the path itself, or its
/// parent for entries about to be created) and require the canonical root
/// as a component prefix.
fn check_contained(root: &Path, abs: &Path) -> Result<(), ErrorCode> {
    if let Ok(canon) = std::fs::canonicalize(abs) {
        if !canon.starts_with(root) {
            return Err(ErrorCode::InvalidPath);
        }
        return Ok(());
    }
    if let Some(parent) = abs.parent() {
        if let Ok(canon_parent) = std::fs::canonicalize(parent) {
            if !canon_parent.starts_with(root) {
                return Err(ErrorCode::InvalidPath);
            }
        }
    }
    // Nothing on disk to chase; the lexical walk already bounded it
    Ok(())
}

/// Recover the sharing-relative form of an absolute path produced by a
/// directory walk inside the root.
pub fn relativize(root: &Path, abs: &Path) -> Result<PathBuf, ErrorCode> {
    abs.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| ErrorCode::InvalidPath)
}
