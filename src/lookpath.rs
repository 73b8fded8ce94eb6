//! Executable path resolution.
//!
//! Bare names (no path separator) are resolved against the parent process's
//! `PATH`, accepting the first entry that is an executable regular file.
//! Names containing a separator are taken as given, relative or absolute.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{HatchError, Result};

/// Resolve a command name to the path that will be spawned.
pub(crate) fn resolve(name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        return Err(HatchError::NotFound(name.to_string()));
    }
    if name.contains(std::path::MAIN_SEPARATOR) {
        return Ok(PathBuf::from(name));
    }
    let path_var = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(HatchError::NotFound(name.to_string()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
