//! Module reference normalization.
//!
//! Local references are normalized lexically against a base directory so that
//! `./math`, `lib/../math` and `/base/math` all name the same module. Remote
//! references are recognized but left untouched.

use std::path::{Component, Path, PathBuf};

/// Returns true if the reference uses a remote URL scheme.
pub fn is_remote(reference: &str) -> bool {
    let lower = reference.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Normalize a local reference relative to `base`.
///
/// A `file://` prefix is stripped. Relative references are joined onto
/// `base`. `.` and `..` components are folded lexically; `..` never climbs
/// above the root.
pub fn normalize(base: &Path, reference: &str) -> PathBuf {
    let trimmed = reference.trim();
    let stripped = trimmed.strip_prefix("file://").unwrap_or(trimmed);
    let path = Path::new(stripped);

    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // pop() is a no-op at the root
                if !matches!(out.components().next_back(), Some(Component::RootDir) | None) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
