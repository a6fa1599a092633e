//! Composite diagnostic run before flashing or a full pipeline (§4.5):
//! is the RPC port clear, is the probe/target reachable, is the
//! firmware artifact a valid, fresh ELF image. Each sub-check builds
//! its own `CheckResult`, the way the teacher's `build.rs` classifies
//! one subprocess outcome into one typed result -- here there are
//! three, composed into a single `HilResult`.
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant, SystemTime};

use object::{Architecture, Object};
use thiserror::Error;

use crate::diag;
use crate::locator::ServerLocation;
use crate::result::{CheckResult, HilResult};
use crate::server::{self, ServerConfig};

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("failed to read firmware artifact {0}: {1}")]
    ArtifactIo(std::path::PathBuf, #[source] std::io::Error),
    #[error("firmware artifact {0} is not a readable ELF image: {1}")]
    NotAnElf(std::path::PathBuf, String),
}

impl diag::DiagnosableError for PreflightError {
    fn diagnose(&self) -> Vec<String> {
        vec!["Make sure the project has been built before running pre-flight.".into()]
    }
}

/// Expected firmware architecture. A fixed Cortex-M target is all this
/// core ever drives (§1 scope); `expect_thumb` records that the ELF
/// must declare the ARM family, which covers every Cortex-M variant.
fn is_expected_architecture(arch: Architecture) -> bool {
    matches!(arch, Architecture::Arm)
}

/// `server_clear`: advisory. Passes when nothing currently answers on
/// the RPC port.
fn check_server_clear(tcl_port: u16) -> CheckResult {
    if server::is_running(tcl_port) {
        CheckResult::fail(format!("a process is already bound to RPC port {tcl_port}")).advisory()
    } else {
        CheckResult::pass("RPC port is clear")
    }
}

/// `probe_reachable`: blocking. Spawns the debug server in a one-shot
/// `init; exit` mode and requires a clean exit.
fn check_probe_reachable(
    location: &ServerLocation,
    cfg: &ServerConfig,
    timeout: Duration,
) -> CheckResult {
    let mut command = Command::new(&location.binary_path);
    if let Some(scripts) = &location.scripts_path {
        command.arg("-s").arg(scripts);
    }
    command
        .arg("-f")
        .arg(&cfg.interface_cfg)
        .arg("-f")
        .arg(&cfg.target_cfg)
        .arg("-c")
        .arg(format!("tcl_port {}", cfg.tcl_port))
        .arg("-c")
        .arg(format!("gdb_port {}", cfg.gdb_port))
        .arg("-c")
        .arg("init; exit");

    match server::run_to_completion(command, timeout) {
        Ok((true, output)) => CheckResult::pass(format!("probe reachable: {}", summarize(&output))),
        Ok((false, output)) => CheckResult::fail(format!("probe init failed: {}", summarize(&output))),
        Err(e) => CheckResult::fail(format!("could not spawn debug server: {e}")),
    }
}

fn summarize(output: &str) -> String {
    output.lines().last().unwrap_or("").trim().to_string()
}

/// `artifact_valid`: blocking whenever an artifact path is supplied.
/// Checks the file exists, parses as an ELF of the expected
/// architecture, and (when `max_age` is given) is fresh enough.
fn check_artifact_valid(elf_path: &Path, max_age: Option<Duration>) -> Result<CheckResult, PreflightError> {
    let bytes = std::fs::read(elf_path).map_err(|e| PreflightError::ArtifactIo(elf_path.to_path_buf(), e))?;
    let obj = object::File::parse(&*bytes)
        .map_err(|e| PreflightError::NotAnElf(elf_path.to_path_buf(), e.to_string()))?;

    if !is_expected_architecture(obj.architecture()) {
        return Ok(CheckResult::fail(format!(
            "firmware architecture {:?} does not match expected target family",
            obj.architecture()
        )));
    }

    if let Some(max_age) = max_age {
        let modified = std::fs::metadata(elf_path)
            .and_then(|m| m.modified())
            .map_err(|e| PreflightError::ArtifactIo(elf_path.to_path_buf(), e))?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age > max_age {
            return Ok(CheckResult::fail(format!(
                "firmware artifact is {}s old, older than the {}s freshness window",
                age.as_secs(),
                max_age.as_secs()
            ))
            .advisory());
        }
    }

    Ok(CheckResult::pass("firmware artifact is a valid, fresh ELF image"))
}

pub struct PreflightRequest<'a> {
    pub location: &'a ServerLocation,
    pub server_cfg: &'a ServerConfig,
    pub elf_path: Option<&'a Path>,
    pub max_artifact_age: Option<Duration>,
    pub probe_timeout: Duration,
}

pub fn run(req: PreflightRequest) -> Result<HilResult, PreflightError> {
    let start = Instant::now();
    let mut checks = BTreeMap::new();

    checks.insert("server_clear".to_string(), check_server_clear(req.server_cfg.tcl_port));
    checks.insert(
        "probe_reachable".to_string(),
        check_probe_reachable(req.location, req.server_cfg, req.probe_timeout),
    );

    if let Some(elf_path) = req.elf_path {
        checks.insert(
            "artifact_valid".to_string(),
            check_artifact_valid(elf_path, req.max_artifact_age)?,
        );
    }

    let duration_ms = start.elapsed().as_millis() as u64;
    let pass = HilResult::checks_pass(&checks);

    let mut result = if pass {
        HilResult::success("preflight", duration_ms)
    } else {
        HilResult::failure("preflight", duration_ms, "one or more blocking checks failed")
    };
    result = result.with_checks(checks);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_clear_passes_when_port_is_free() {
        // Port 0 never has a listener bound to it directly, and the
        // probe connects with a short timeout -- this exercises the
        // "nothing answers" branch deterministically.
        let check = check_server_clear(0);
        assert!(check.pass);
    }

    #[test]
    fn artifact_valid_reports_io_error_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.elf");
        let err = check_artifact_valid(&missing, None).unwrap_err();
        assert!(matches!(err, PreflightError::ArtifactIo(..)));
    }

    #[test]
    fn artifact_valid_rejects_non_elf_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.elf");
        std::fs::write(&path, b"not an elf file at all").unwrap();
        let err = check_artifact_valid(&path, None).unwrap_err();
        assert!(matches!(err, PreflightError::NotAnElf(..)));
    }

    #[test]
    fn artifact_valid_flags_stale_artifact_as_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.elf");
        // A zero-byte file is not a parseable ELF, so this exercises
        // the staleness-advisory branch's ancestor failure path
        // instead: confirms the parse error surfaces before the age
        // check ever runs, rather than silently skipping it.
        std::fs::write(&path, b"").unwrap();
        let err = check_artifact_valid(&path, Some(Duration::from_secs(1)));
        assert!(err.is_err());
    }
}
