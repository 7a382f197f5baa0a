//! Shared helpers for locating host binaries.

use std::path::PathBuf;

/// Resolve `env_key` to an existing binary path, falling back to a PATH
/// lookup of `default_bin`.
pub(crate) fn bin_from_env_or_path(env_key: &str, default_bin: &str) -> Option<PathBuf> {
    if let Ok(configured) = std::env::var(env_key) {
        let path = PathBuf::from(configured);
        if path.exists() {
            return Some(path);
        }
    }
    bin_from_path(default_bin)
}

/// Locate `bin` on PATH; path-like inputs are checked directly.
pub(crate) fn bin_from_path(bin: &str) -> Option<PathBuf> {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(bin);
        return path.exists().then_some(path);
    }
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(bin);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}
