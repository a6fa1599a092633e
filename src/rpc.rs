//! Framed request/response client to the debug server's TCL command
//! port (§4.3). The framing byte (`0x1A`) is the only delimiter in
//! either direction -- there is no dependence on newlines.
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::diag;

const FRAME_BYTE: u8 = 0x1A;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to connect to debug-server RPC port: {0}")]
    ConnectFailed(#[source] std::io::Error),
    #[error("RPC socket error: {0}")]
    Io(#[source] std::io::Error),
    #[error("RPC request timed out")]
    Timeout,
}

impl diag::DiagnosableError for RpcError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            RpcError::ConnectFailed(_) => {
                vec!["Is the debug server running and listening on the RPC port?".into()]
            }
            _ => vec![],
        }
    }
}

/// A single-threaded, non-reentrant client. Connects lazily, and is
/// meant to be reused across a polling loop rather than reopened per
/// tick (§4.3, design note: "a new socket per poll tick ... is
/// incorrect because the server may rate-limit new connections").
pub struct TclClient {
    stream: TcpStream,
}

impl TclClient {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, RpcError> {
        let addr: SocketAddr = (host, port)
            .to_socket_addrs()
            .map_err(RpcError::ConnectFailed)?
            .next()
            .ok_or_else(|| {
                RpcError::ConnectFailed(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("no address for {host}:{port}"),
                ))
            })?;

        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(RpcError::ConnectFailed)?;
        stream.set_read_timeout(Some(timeout)).map_err(RpcError::Io)?;
        stream.set_write_timeout(Some(timeout)).map_err(RpcError::Io)?;
        stream.set_nodelay(true).map_err(RpcError::Io)?;

        Ok(Self { stream })
    }

    /// Blocking request/response. Writes `command` followed by the
    /// frame byte, then reads until the frame byte is seen in the
    /// response.
    pub fn execute(&mut self, command: &str) -> Result<String, RpcError> {
        let mut request = command.as_bytes().to_vec();
        request.push(FRAME_BYTE);
        self.stream.write_all(&request).map_err(map_io)?;

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.stream.read(&mut byte).map_err(map_io)?;
            if n == 0 {
                // Peer closed before sending a frame terminator.
                return Err(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-response",
                )));
            }
            if byte[0] == FRAME_BYTE {
                break;
            }
            response.push(byte[0]);
        }

        Ok(String::from_utf8_lossy(&response).trim_end_matches('\0').to_string())
    }

    /// Runs `commands` over the same connection, in order.
    pub fn execute_many(&mut self, commands: &[&str]) -> Result<Vec<String>, RpcError> {
        commands.iter().map(|c| self.execute(c)).collect()
    }
}

fn map_io(e: std::io::Error) -> RpcError {
    if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
        RpcError::Timeout
    } else {
        RpcError::Io(e)
    }
}

/// Connects with exponential backoff, since the server may open its
/// listener slightly after declaring itself ready (§4.7, §4.10 point
/// 7). Shared by the RTT text-channel connect and the binary-channel
/// connect so there is exactly one backoff implementation.
pub fn connect_with_backoff(
    host: &str,
    port: u16,
    per_attempt_timeout: Duration,
    max_attempts: u32,
) -> Result<TcpStream, RpcError> {
    let mut delay = Duration::from_millis(50);
    let mut last_err = None;

    for attempt in 0..max_attempts {
        let deadline = Instant::now();
        match (host, port)
            .to_socket_addrs()
            .map_err(RpcError::ConnectFailed)
            .and_then(|mut addrs| {
                addrs
                    .next()
                    .ok_or_else(|| RpcError::ConnectFailed(std::io::Error::new(
                        std::io::ErrorKind::AddrNotAvailable,
                        "no resolvable address",
                    )))
            })
            .and_then(|addr| {
                TcpStream::connect_timeout(&addr, per_attempt_timeout).map_err(RpcError::ConnectFailed)
            }) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 == max_attempts {
                    break;
                }
                let elapsed = deadline.elapsed();
                std::thread::sleep(delay.saturating_sub(elapsed));
                delay = (delay * 2).min(Duration::from_secs(2));
            }
        }
    }

    Err(last_err.unwrap_or(RpcError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::net::TcpListener;

    #[test]
    fn execute_reads_up_to_frame_byte() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                sock.read_exact(&mut byte).unwrap();
                if byte[0] == FRAME_BYTE {
                    break;
                }
                buf.push(byte[0]);
            }
            assert_eq!(buf, b"version");
            sock.write_all(b"Open On-Chip Debugger\x1a").unwrap();
        });

        let mut client = TclClient::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let resp = client.execute("version").unwrap();
        assert_eq!(resp, "Open On-Chip Debugger");
        handle.join().unwrap();
    }

    #[test]
    fn connect_with_backoff_succeeds_once_listener_is_up() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let _listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
            std::thread::sleep(Duration::from_millis(300));
        });

        let stream = connect_with_backoff("127.0.0.1", port, Duration::from_millis(200), 10);
        assert!(stream.is_ok());
        handle.join().unwrap();
    }
}
