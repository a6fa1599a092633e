//! One-shot program/verify/reset flow against the target (§4.6). Built
//! the same way the teacher's `build.rs` wraps one subprocess
//! invocation and classifies its exit, generalized here to the
//! debug-server's inline-command one-shot mode instead of `cargo
//! build`.
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;

use crate::diag;
use crate::locator::ServerLocation;
use crate::preflight::{self, PreflightError, PreflightRequest};
use crate::result::{CheckResult, HilResult, Status};
use crate::server::{self, ServerConfig, ServerError};

const DEFAULT_CHECK_AGE_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("debug server error: {0}")]
    Server(#[from] ServerError),
    #[error("pre-flight check failed, aborting flash: {0}")]
    PreflightFailed(String),
    #[error(transparent)]
    Preflight(#[from] PreflightError),
    #[error("failed to stat firmware artifact {0}: {1}")]
    ArtifactStat(std::path::PathBuf, #[source] std::io::Error),
}

impl diag::DiagnosableError for FlashError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            FlashError::PreflightFailed(_) => {
                vec!["Run `hil preflight` on its own to see the full diagnostic report.".into()]
            }
            _ => vec![],
        }
    }
}

pub struct FlashRequest<'a> {
    pub location: &'a ServerLocation,
    pub server_cfg: &'a ServerConfig,
    pub elf_path: &'a Path,
    pub timeout: Duration,
    pub reset_only: bool,
    pub check_age: Option<Duration>,
    pub run_preflight: bool,
}

/// Runs the flash flow described in §4.6. `run_preflight`, when set,
/// aborts before touching the hardware if the pre-flight report is
/// not a pass (non-advisory checks all green).
pub fn run(req: FlashRequest) -> Result<HilResult, FlashError> {
    let start = Instant::now();

    if req.run_preflight {
        let report = preflight::run(PreflightRequest {
            location: req.location,
            server_cfg: req.server_cfg,
            elf_path: Some(req.elf_path),
            max_artifact_age: req.check_age.or(Some(Duration::from_secs(DEFAULT_CHECK_AGE_SECS))),
            probe_timeout: Duration::from_secs(10),
        })?;
        if report.status != Status::Success {
            return Err(FlashError::PreflightFailed(
                report.error.unwrap_or_else(|| "pre-flight checks did not pass".to_string()),
            ));
        }
    }

    // Best-effort terminate whatever currently holds the hardware; a
    // failure here is not fatal on its own -- the spawn below will
    // fail loudly with PortInUse if it really mattered.
    let _ = terminate_port_holder(req.server_cfg.tcl_port);

    let inline_command = build_inline_command(req.reset_only, req.elf_path);

    let mut command = Command::new(&req.location.binary_path);
    if let Some(scripts) = &req.location.scripts_path {
        command.arg("-s").arg(scripts);
    }
    command
        .arg("-f")
        .arg(&req.server_cfg.interface_cfg)
        .arg("-f")
        .arg(&req.server_cfg.target_cfg)
        .arg("-c")
        .arg(format!("tcl_port {}", req.server_cfg.tcl_port))
        .arg("-c")
        .arg(format!("gdb_port {}", req.server_cfg.gdb_port))
        .arg("-c")
        .arg(format!("init; {inline_command}"));

    let outcome = server::run_to_completion(command, req.timeout);
    let duration_ms = start.elapsed().as_millis() as u64;

    let mut checks = std::collections::BTreeMap::new();
    if !req.reset_only {
        if let Some(max_age) = req.check_age.or(Some(Duration::from_secs(DEFAULT_CHECK_AGE_SECS))) {
            checks.insert("artifact_age".to_string(), artifact_age_check(req.elf_path, max_age)?);
        }
    }

    let result = match outcome {
        Ok((true, output)) => {
            checks.insert(
                "program_verify_reset".to_string(),
                CheckResult::pass(summarize_tail(&output)),
            );
            HilResult::success("flash", duration_ms)
        }
        Ok((false, output)) => {
            checks.insert(
                "program_verify_reset".to_string(),
                CheckResult::fail(summarize_tail(&output)),
            );
            HilResult::failure("flash", duration_ms, "debug server exited with a non-zero status")
        }
        Err(ServerError::ReadinessTimeout) => {
            checks.insert(
                "program_verify_reset".to_string(),
                CheckResult::fail("timed out waiting for the debug server to finish"),
            );
            HilResult::timeout("flash", duration_ms)
        }
        Err(e) => return Err(e.into()),
    };

    Ok(result.with_checks(checks))
}

fn build_inline_command(reset_only: bool, elf_path: &Path) -> String {
    if reset_only {
        "reset run; exit".to_string()
    } else {
        format!("program {} verify reset; exit", elf_path.display())
    }
}

fn artifact_age_check(elf_path: &Path, max_age: Duration) -> Result<CheckResult, FlashError> {
    let modified = std::fs::metadata(elf_path)
        .and_then(|m| m.modified())
        .map_err(|e| FlashError::ArtifactStat(elf_path.to_path_buf(), e))?;
    let age = SystemTime::now().duration_since(modified).unwrap_or(Duration::ZERO);
    if age > max_age {
        Ok(CheckResult::fail(format!(
            "firmware artifact is {}s old, older than the {}s freshness window",
            age.as_secs(),
            max_age.as_secs()
        ))
        .advisory())
    } else {
        Ok(CheckResult::pass(format!("firmware artifact is {}s old", age.as_secs())))
    }
}

fn summarize_tail(output: &str) -> String {
    output.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim().to_string()
}

/// Best-effort: if something is already listening on the RPC port,
/// there is no portable way to identify and signal that exact process
/// from its port number alone, so this is a liveness probe only --
/// a genuine conflict still surfaces as `ServerError::PortInUse` from
/// the subsequent spawn.
fn terminate_port_holder(port: u16) -> bool {
    !server::is_running(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_only_skips_the_program_command() {
        let cmd = build_inline_command(true, Path::new("build/firmware/app/firmware.elf"));
        assert_eq!(cmd, "reset run; exit");
    }

    #[test]
    fn default_flow_programs_verifies_and_resets() {
        let cmd = build_inline_command(false, Path::new("build/firmware/app/firmware.elf"));
        assert_eq!(cmd, "program build/firmware/app/firmware.elf verify reset; exit");
    }

    #[test]
    fn artifact_age_check_passes_for_freshly_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.elf");
        std::fs::write(&path, b"x").unwrap();
        let check = artifact_age_check(&path, Duration::from_secs(DEFAULT_CHECK_AGE_SECS)).unwrap();
        assert!(check.pass);
    }

    #[test]
    fn artifact_age_check_flags_old_file_as_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.elf");
        std::fs::write(&path, b"x").unwrap();
        // Can't rewind mtime without touching the filesystem clock;
        // exercise the advisory path instead by passing a zero-width
        // freshness window, which any file on disk will exceed.
        let check = artifact_age_check(&path, Duration::from_secs(0)).unwrap();
        assert!(!check.pass);
        assert_eq!(check.advisory, Some(true));
    }

    #[test]
    fn summarize_tail_picks_last_non_blank_line() {
        let out = "first\nsecond\n\n";
        assert_eq!(summarize_tail(out), "second");
    }
}
