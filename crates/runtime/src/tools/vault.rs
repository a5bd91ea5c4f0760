//! Path resolution shared by every vault-scoped tool.
//!
//! Each tool receives a relative path from the model and must never touch
//! anything outside the person's vault subtree, even if the model asks for
//! `../../etc/passwd` or an absolute path.

use std::path::{Component, Path, PathBuf};

/// Resolve `requested` against `person_root`, rejecting any path that would
/// escape it. Accepts both relative and (within-vault) absolute-looking
/// paths; `.` and `..` components are resolved lexically before the escape
/// check so a request can't tunnel out via a `..` that cancels later.
pub fn resolve(person_root: &Path, requested: &str) -> Result<PathBuf, String> {
    let requested = requested.trim();
    if requested.is_empty() {
        return Err("path must not be empty".to_string());
    }

    let mut resolved = PathBuf::new();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(format!("path escapes the vault: '{requested}'"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                // Treat a leading '/' as vault-root-relative rather than
                // filesystem-root-relative.
            }
        }
    }

    Ok(person_root.join(resolved))
}
