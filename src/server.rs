//! Spawn, supervise, and terminate the debug server (§4.2). Follows
//! the teacher's `CargoWrapper::build` shape for wrapping a
//! subprocess call (`build.rs`: construct `Command`, pipe stdout and
//! stderr, spawn, classify on wait) generalized to a long-lived
//! supervised child instead of a one-shot build.
use std::io::{BufRead, BufReader};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;

use crate::diag;
use crate::locator::ServerLocation;
use crate::rpc::TclClient;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub interface_cfg: PathBuf,
    pub target_cfg: PathBuf,
    pub tcl_port: u16,
    pub gdb_port: u16,
    pub rtt_text_port: u16,
    pub rtt_binary_port: u16,
}

pub struct ServerHandle {
    child: Child,
    pub tcl_port: u16,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to spawn debug server: {0}")]
    SpawnFailed(#[source] std::io::Error),
    #[error("port {0} is already held by another debug-server instance")]
    PortInUse(u16),
    #[error("debug server did not become ready within the timeout")]
    ReadinessTimeout,
    #[error("debug server did not exit cleanly when asked to stop")]
    UncleanStop,
}

impl diag::DiagnosableError for ServerError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            ServerError::PortInUse(port) => vec![format!(
                "Another debug-server instance is already bound to port {port}. Stop it first."
            )],
            _ => vec![],
        }
    }
}

/// Port-based liveness probe: true iff something accepts a TCP
/// connection on `port`.
pub fn is_running(port: u16) -> bool {
    TcpStream::connect_timeout(
        &format!("127.0.0.1:{port}").parse().unwrap(),
        Duration::from_millis(200),
    )
    .is_ok()
}

/// Spawns the server with the given interface/target configs and the
/// ports it should republish RTT on. `post_init_commands` are joined
/// into one `-c` startup string of the form "init; <cmd1>; <cmd2>; ..."
/// so that commands requiring an initialized target (starting RTT,
/// opening the RTT TCP listeners) run strictly after `init` has
/// completed inside the server (§4.2 ordering guarantee).
pub fn start(
    location: &ServerLocation,
    cfg: &ServerConfig,
    post_init_commands: &[String],
) -> Result<ServerHandle, ServerError> {
    if is_running(cfg.tcl_port) {
        return Err(ServerError::PortInUse(cfg.tcl_port));
    }

    let mut startup = vec!["init".to_string()];
    startup.extend(post_init_commands.iter().cloned());
    let startup_cmd = startup.join("; ");

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
        .arg(startup_cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = command.spawn().map_err(ServerError::SpawnFailed)?;

    Ok(ServerHandle {
        child,
        tcl_port: cfg.tcl_port,
    })
}

/// Succeeds once the TCL RPC port accepts a connection and answers a
/// trivial command.
pub fn wait_until_ready(handle: &ServerHandle, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(mut client) = TclClient::connect("127.0.0.1", handle.tcl_port, Duration::from_millis(500)) {
            if client.execute("version").is_ok() {
                return true;
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

/// Sends a graceful termination request, waits a bounded time, then
/// escalates to a forced kill.
pub fn stop(mut handle: ServerHandle, graceful_timeout: Duration) -> Result<(), ServerError> {
    let pid = Pid::from_raw(handle.child.id() as i32);
    let _ = signal::kill(pid, Signal::SIGTERM);

    let deadline = Instant::now() + graceful_timeout;
    loop {
        match handle.child.try_wait() {
            Ok(Some(_)) => return Ok(()),
            Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(50)),
            Ok(None) => break,
            Err(_) => break,
        }
    }

    handle.child.kill().map_err(|_| ServerError::UncleanStop)?;
    handle.child.wait().map_err(|_| ServerError::UncleanStop)?;
    Ok(())
}

/// Drains a one-shot server invocation to completion, classifying its
/// exit as success/failure/timeout (used by the flash driver and
/// pre-flight probe-reachable check, both of which invoke the server
/// in a run-to-completion mode rather than a supervised daemon mode).
pub fn run_to_completion(
    mut command: Command,
    timeout: Duration,
) -> Result<(bool, String), ServerError> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = command.spawn().map_err(ServerError::SpawnFailed)?;

    // Drain stdout/stderr on their own thread: `Lines` has no timeout
    // of its own, so reading it on the main thread would make the
    // outer deadline below meaningless against a hung process.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let reader = std::thread::spawn(move || {
        let mut output = String::new();
        if let Some(stdout) = stdout {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                output.push_str(&line);
                output.push('\n');
            }
        }
        if let Some(stderr) = stderr {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                output.push_str(&line);
                output.push('\n');
            }
        }
        output
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(50)),
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                break Err(ServerError::ReadinessTimeout);
            }
            Err(e) => break Err(ServerError::SpawnFailed(e)),
        }
    };

    let output = reader.join().unwrap_or_default();
    status.map(|s| (s.success(), output))
}
