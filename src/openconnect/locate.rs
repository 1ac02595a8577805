//! Finding the openconnect binary

use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const CLIENT_NAME: &str = "openconnect";

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("openconnect not found at: {0}")]
    NotAt(PathBuf),
    #[error("openconnect not found. Install it (e.g. sudo apt-get install openconnect)")]
    NotInstalled,
}

/// Resolve the client binary, preferring an explicitly configured path.
pub fn locate_client(explicit: Option<&Path>) -> Result<PathBuf, LocateError> {
    if let Some(path) = explicit {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(LocateError::NotAt(path.to_path_buf()))
        };
    }

    let path_var = std::env::var_os("PATH");
    let found = find_in_path(CLIENT_NAME, path_var.as_deref()).ok_or(LocateError::NotInstalled)?;
    debug!("Using openconnect at {}", found.display());
    Ok(found)
}

fn find_in_path(name: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
