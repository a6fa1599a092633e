//! RTT readiness polling (§4.7): wait for the debug server to
//! discover the RTT control block, then wait for a specific boot
//! marker string to appear on the text channel. Polling cadence and
//! the shared backoff-connect helper follow the same shape as the
//! teacher's capture loop in `main.rs`, which polls a source at a
//! bounded interval rather than sleeping a fixed duration.
use std::io::Read;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::rpc::{self, RpcError, TclClient};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize)]
pub struct RttReadyResult {
    pub ready: bool,
    pub channels: Vec<String>,
    pub elapsed_seconds: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootMarkerResult {
    pub found: bool,
    pub boot_log: String,
    pub elapsed_seconds: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Polls `tcl_port` with a channel-listing command until the debug
/// server reports at least one discovered RTT channel, or `timeout`
/// elapses. An RPC failure on the very first poll returns immediately
/// (§4.7 edge case) rather than retrying for the full timeout budget,
/// since a connect failure this early almost always means the server
/// itself is not up, which will not resolve by polling longer.
pub fn wait_for_rtt_ready(tcl_port: u16, timeout: Duration) -> RttReadyResult {
    let start = Instant::now();

    let mut client = match TclClient::connect("127.0.0.1", tcl_port, Duration::from_millis(500)) {
        Ok(c) => c,
        Err(e) => {
            return RttReadyResult {
                ready: false,
                channels: vec![],
                elapsed_seconds: start.elapsed().as_secs_f32(),
                error: Some(e.to_string()),
            };
        }
    };

    // The same connection is reused for every poll: opening a fresh
    // socket per tick is the wrong shape here, since the server may
    // rate-limit new connections (§4.3 design note).
    loop {
        if let Ok(listing) = client.execute("rtt channels") {
            let channels = parse_channel_listing(&listing);
            if !channels.is_empty() {
                return RttReadyResult {
                    ready: true,
                    channels,
                    elapsed_seconds: start.elapsed().as_secs_f32(),
                    error: None,
                };
            }
        }

        if start.elapsed() >= timeout {
            return RttReadyResult {
                ready: false,
                channels: vec![],
                elapsed_seconds: start.elapsed().as_secs_f32(),
                error: None,
            };
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn parse_channel_listing(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("error"))
        .map(str::to_string)
        .collect()
}

/// Connects to the RTT text channel (with backoff retry, since the
/// listener may open slightly after the server declares itself ready)
/// and searches the accumulated buffer for `marker` after every chunk
/// read, so a marker split across two reads is still found.
pub fn wait_for_boot_marker(text_channel_port: u16, marker: &str, timeout: Duration) -> BootMarkerResult {
    let start = Instant::now();

    let mut stream: TcpStream = match rpc::connect_with_backoff(
        "127.0.0.1",
        text_channel_port,
        Duration::from_millis(500),
        8,
    ) {
        Ok(s) => s,
        Err(e) => {
            return BootMarkerResult {
                found: false,
                boot_log: String::new(),
                elapsed_seconds: start.elapsed().as_secs_f32(),
                error: Some(format_connect_error(&e)),
            };
        }
    };

    if let Err(e) = stream.set_read_timeout(Some(Duration::from_millis(500))) {
        return BootMarkerResult {
            found: false,
            boot_log: String::new(),
            elapsed_seconds: start.elapsed().as_secs_f32(),
            error: Some(e.to_string()),
        };
    }

    let mut raw = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                raw.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&raw);
                if let Some(idx) = text.find(marker) {
                    return BootMarkerResult {
                        found: true,
                        boot_log: text[..idx + marker.len()].to_string(),
                        elapsed_seconds: start.elapsed().as_secs_f32(),
                        error: None,
                    };
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                return BootMarkerResult {
                    found: false,
                    boot_log: String::from_utf8_lossy(&raw).to_string(),
                    elapsed_seconds: start.elapsed().as_secs_f32(),
                    error: Some(e.to_string()),
                };
            }
        }

        if start.elapsed() >= timeout {
            return BootMarkerResult {
                found: false,
                boot_log: String::from_utf8_lossy(&raw).to_string(),
                elapsed_seconds: start.elapsed().as_secs_f32(),
                error: Some("target may have already booted before capture started".to_string()),
            };
        }
    }

    BootMarkerResult {
        found: false,
        boot_log: String::from_utf8_lossy(&raw).to_string(),
        elapsed_seconds: start.elapsed().as_secs_f32(),
        error: Some("text channel closed before the marker was seen".to_string()),
    }
}

fn format_connect_error(e: &RpcError) -> String {
    format!("could not connect to RTT text channel: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    #[test]
    fn parse_channel_listing_drops_blank_and_error_lines() {
        let listing = "  \nrtt0\nerror\nrtt1\n";
        assert_eq!(parse_channel_listing(listing), vec!["rtt0", "rtt1"]);
    }

    #[test]
    fn rtt_not_ready_without_a_listening_server_returns_immediately() {
        let result = wait_for_rtt_ready(0, Duration::from_secs(5));
        assert!(!result.ready);
        assert!(result.error.is_some());
    }

    #[test]
    fn boot_marker_found_across_two_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"booting... SYST").unwrap();
            std::thread::sleep(Duration::from_millis(100));
            sock.write_all(b"EM READY\n").unwrap();
        });

        let result = wait_for_boot_marker(port, "SYSTEM READY", Duration::from_secs(5));
        assert!(result.found);
        assert_eq!(result.boot_log, "booting... SYSTEM READY");
        handle.join().unwrap();
    }

    #[test]
    fn boot_marker_times_out_with_advisory_note() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"still booting\n").unwrap();
            std::thread::sleep(Duration::from_millis(700));
        });

        let result = wait_for_boot_marker(port, "NEVER APPEARS", Duration::from_millis(300));
        assert!(!result.found);
        assert_eq!(
            result.error.as_deref(),
            Some("target may have already booted before capture started")
        );
        handle.join().unwrap();
    }
}
