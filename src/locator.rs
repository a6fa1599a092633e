//! Debug-server binary/script-directory discovery (§4.1). Mirrors the
//! teacher's `CargoWrapper::cmd` idea of "find the tool in `PATH`,
//! honor an environment override" (`build.rs`), generalized to also
//! try a known user-home install prefix and to return a diagnosable,
//! every-path-tried error instead of panicking.
use std::env;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::diag;

pub const SERVER_BINARY_ENV: &str = "HIL_SERVER_BIN";
pub const DEFAULT_BINARY_NAME: &str = "openocd";
const HOME_INSTALL_SUBDIR: &str = ".local/share/openocd/bin";

#[derive(Debug, Clone)]
pub struct ServerLocation {
    pub binary_path: PathBuf,
    pub scripts_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("could not find a debug-server binary; tried: {0:?}")]
    NotFound(Vec<PathBuf>),
}

impl diag::DiagnosableError for LocatorError {
    fn diagnose(&self) -> Vec<String> {
        vec![format!(
            "Install the debug server, or point to it with --server-bin / ${}",
            SERVER_BINARY_ENV
        )]
    }
}

fn candidates_from_path(binary_name: &str) -> Vec<PathBuf> {
    env::var_os("PATH")
        .map(|paths| {
            env::split_paths(&paths)
                .map(|dir| dir.join(binary_name))
                .collect()
        })
        .unwrap_or_default()
}

fn home_install_candidate(binary_name: &str) -> Option<PathBuf> {
    dirs_home().map(|home| home.join(HOME_INSTALL_SUBDIR).join(binary_name))
}

/// Minimal `$HOME` lookup; no extra crate needed for a single
/// environment variable read at the call site (§5 "no process-wide
/// environment-variable reads inside the core" only forbids *implicit*
/// reads deep in the core -- this is the one boundary-level read
/// locate() itself is responsible for).
fn dirs_home() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}

/// Resolves the debug-server binary by priority: explicit argument,
/// environment variable, `PATH`, known user-home install prefix.
pub fn locate(
    explicit: Option<&Path>,
    binary_name: &str,
) -> Result<ServerLocation, LocatorError> {
    let mut tried = Vec::new();

    if let Some(path) = explicit {
        tried.push(path.to_path_buf());
        if path.is_file() {
            return Ok(ServerLocation {
                binary_path: path.to_path_buf(),
                scripts_path: scripts_path_for(path),
            });
        }
    }

    if let Some(env_path) = env::var_os(SERVER_BINARY_ENV) {
        let path = PathBuf::from(env_path);
        tried.push(path.clone());
        if path.is_file() {
            return Ok(ServerLocation {
                binary_path: path.clone(),
                scripts_path: scripts_path_for(&path),
            });
        }
    }

    for candidate in candidates_from_path(binary_name) {
        tried.push(candidate.clone());
        if candidate.is_file() {
            return Ok(ServerLocation {
                binary_path: candidate.clone(),
                scripts_path: scripts_path_for(&candidate),
            });
        }
    }

    if let Some(candidate) = home_install_candidate(binary_name) {
        tried.push(candidate.clone());
        if candidate.is_file() {
            return Ok(ServerLocation {
                binary_path: candidate.clone(),
                scripts_path: scripts_path_for(&candidate),
            });
        }
    }

    Err(LocatorError::NotFound(tried))
}

/// Guesses the script directory from the binary's location, following
/// the common `<prefix>/bin/openocd` -> `<prefix>/share/openocd/scripts`
/// install layout. Returns `None` if nothing plausible exists; callers
/// may still pass an explicit `-s` override upstream of this.
fn scripts_path_for(binary_path: &Path) -> Option<PathBuf> {
    let prefix = binary_path.parent()?.parent()?;
    let candidate = prefix.join("share/openocd/scripts");
    candidate.is_dir().then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn explicit_path_wins_even_if_not_in_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("myopenocd");
        fs::write(&bin, b"").unwrap();

        let loc = locate(Some(&bin), DEFAULT_BINARY_NAME).unwrap();
        assert_eq!(loc.binary_path, bin);
    }

    #[test]
    fn not_found_lists_every_tried_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let err = locate(Some(&missing), "also-missing-binary-xyz").unwrap_err();
        match err {
            LocatorError::NotFound(tried) => assert!(tried.contains(&missing)),
        }
    }
}
