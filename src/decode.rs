//! Consumes the binary RTT stream, reassembles framed packets,
//! verifies the build-identifier handshake, and decodes to structured
//! records (§4.10). Pushed bytes arrive from whatever transport the
//! caller chose (TCP RTT channel, replay file); the decoder itself is
//! a pure buffer -> record state machine, the same push/pull shape
//! the teacher's `tracing::Sink::push` uses around the `itm` crate's
//! `Decoder`.
use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::diag;
use crate::fnv::fnv1a_32;
use crate::rpc::{self, RpcError};
use crate::tokendb::{ArgType, Database, Level};
use crate::varint;

/// Reserved token for the build-identifier handshake packet. Firmware
/// and host must agree on this value; it is derived the same way any
/// other token is (FNV-1a of a fixed, reserved format string) so that
/// it can live in the ordinary token space without a side channel.
const BUILD_ID_RESERVED_FORMAT: &str = "__RTT_BUILD_ID__";

pub fn build_id_token() -> u32 {
    fnv1a_32(BUILD_ID_RESERVED_FORMAT.as_bytes())
}

const MAX_CONSECUTIVE_RESYNC_FAILURES: u32 = 3;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to connect to binary RTT channel: {0}")]
    ConnectFailed(#[from] RpcError),
    #[error("firmware BUILD_ID 0x{firmware:08x} does not match token database BUILD_ID 0x{database:08x}")]
    BuildIdMismatch { firmware: u32, database: u32 },
    #[error("could not resynchronize after {0} consecutive malformed packets")]
    MalformedPacket(u32),
    #[error("token database error: {0}")]
    DatabaseError(#[from] crate::tokendb::DatabaseError),
    #[error("I/O error while reading trace stream: {0}")]
    Io(#[from] std::io::Error),
}

impl diag::DiagnosableError for DecodeError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            DecodeError::BuildIdMismatch { .. } => vec![
                "The firmware was built against a different token database than the one passed with --csv. Rebuild or regenerate the database.".into(),
            ],
            _ => vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub level: String,
    pub msg: String,
    pub token: String,
    pub file: String,
    pub line: u32,
    pub raw_args: Vec<Value>,
}

/// An event the decoder reports out-of-band (printed as a warning by
/// the caller); not fatal by itself.
#[derive(Debug, Clone)]
pub enum DecodeEvent {
    ArgCountMismatch { token: u32, expected: usize, got: usize },
    UnknownToken { token: u32 },
    MalformedArgs { token: u32 },
}

pub struct LogDecoder<'a> {
    db: &'a Database,
    buf: Vec<u8>,
    validate_build_id: bool,
    handshake_done: bool,
    resync_failures: u32,
    pub pending_events: Vec<DecodeEvent>,
}

enum ArgDecodeOutcome {
    Done(Vec<Value>, usize),
    Incomplete,
    /// A varint ran 5 bytes without terminating: the stream is
    /// corrupt at this position, not merely short. More bytes will
    /// never fix it, so this must drive a resync rather than a wait.
    Malformed,
}

impl<'a> LogDecoder<'a> {
    pub fn new(db: &'a Database, validate_build_id: bool) -> Self {
        Self {
            db,
            buf: Vec::new(),
            validate_build_id,
            handshake_done: !validate_build_id,
            resync_failures: 0,
            pending_events: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pulls the next fully-buffered record, if any. Returns `Ok(None)`
    /// when more bytes are needed (caller should `push` and retry),
    /// `Ok(Some(record))` on a decoded record (which may carry
    /// `level: UNKNOWN`), or `Err` on a fatal condition (build-id
    /// mismatch, or three consecutive resync failures).
    pub fn pull(&mut self) -> Result<Option<LogRecord>, DecodeError> {
        loop {
            if self.buf.len() < 5 {
                return Ok(None);
            }

            let token_hash = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            let header = self.buf[4];
            let arg_count = (header & 0x0F) as usize;

            if !self.handshake_done {
                return self.pull_handshake(token_hash, arg_count);
            }

            let record = self.db.lookup(token_hash).cloned();
            let expected_types: Vec<ArgType> = match &record {
                Some(r) => r.arg_types.clone(),
                None => vec![ArgType::U32; arg_count],
            };

            if record.is_some() && expected_types.len() != arg_count {
                self.pending_events.push(DecodeEvent::ArgCountMismatch {
                    token: token_hash,
                    expected: expected_types.len(),
                    got: arg_count,
                });
                if self.resync()? {
                    self.resync_failures = 0;
                    continue;
                } else {
                    self.resync_failures += 1;
                    if self.resync_failures >= MAX_CONSECUTIVE_RESYNC_FAILURES {
                        return Err(DecodeError::MalformedPacket(self.resync_failures));
                    }
                    continue;
                }
            }

            match decode_args(&self.buf[5..], &expected_types) {
                ArgDecodeOutcome::Incomplete => return Ok(None),
                ArgDecodeOutcome::Malformed => {
                    self.pending_events.push(DecodeEvent::MalformedArgs { token: token_hash });
                    if self.resync()? {
                        self.resync_failures = 0;
                        continue;
                    } else {
                        self.resync_failures += 1;
                        if self.resync_failures >= MAX_CONSECUTIVE_RESYNC_FAILURES {
                            return Err(DecodeError::MalformedPacket(self.resync_failures));
                        }
                        continue;
                    }
                }
                ArgDecodeOutcome::Done(args, consumed) => {
                    self.resync_failures = 0;
                    let total = 5 + consumed;
                    let out = match &record {
                        Some(r) => LogRecord {
                            ts: Utc::now(),
                            level: r.level.to_string(),
                            msg: format_message(&r.format_string, &args),
                            token: format!("0x{token_hash:08x}"),
                            file: r.file.clone(),
                            line: r.line,
                            raw_args: args,
                        },
                        None => {
                            self.pending_events.push(DecodeEvent::UnknownToken { token: token_hash });
                            LogRecord {
                                ts: Utc::now(),
                                level: Level::Unknown.to_string(),
                                msg: format!("<unknown token 0x{token_hash:08x}>"),
                                token: format!("0x{token_hash:08x}"),
                                file: String::new(),
                                line: 0,
                                raw_args: vec![],
                            }
                        }
                    };
                    self.buf.drain(..total);
                    return Ok(Some(out));
                }
            }
        }
    }

    fn pull_handshake(&mut self, token_hash: u32, arg_count: usize) -> Result<Option<LogRecord>, DecodeError> {
        if token_hash != build_id_token() || arg_count != 1 {
            // Not a recognizable handshake packet; proceed without
            // validation rather than stalling forever on a stream that
            // genuinely never sends one (forensic/replay use, §4.10).
            self.handshake_done = true;
            return self.pull();
        }

        match decode_args(&self.buf[5..], &[ArgType::U32]) {
            ArgDecodeOutcome::Incomplete => Ok(None),
            ArgDecodeOutcome::Malformed => {
                // A corrupt handshake packet can't be resynced against
                // a database (nothing has been validated yet); treat
                // it the same as an absent handshake and proceed.
                self.handshake_done = true;
                self.pull()
            }
            ArgDecodeOutcome::Done(args, consumed) => {
                self.buf.drain(..5 + consumed);
                self.handshake_done = true;
                let firmware_build_id = args[0].as_u64().unwrap_or(0) as u32;
                let database_build_id = self.db.build_id();
                if firmware_build_id != database_build_id {
                    return Err(DecodeError::BuildIdMismatch {
                        firmware: firmware_build_id,
                        database: database_build_id,
                    });
                }
                self.pull()
            }
        }
    }

    /// Scans the buffer (starting one byte in, since that byte is the
    /// one being discarded) for a 4-byte little-endian window that
    /// matches a known token hash. Drains up to that point if found.
    fn resync(&mut self) -> Result<bool, DecodeError> {
        for start in 1..self.buf.len().saturating_sub(3) {
            let window = u32::from_le_bytes([
                self.buf[start],
                self.buf[start + 1],
                self.buf[start + 2],
                self.buf[start + 3],
            ]);
            if self.db.lookup(window).is_some() {
                self.buf.drain(..start);
                return Ok(true);
            }
        }
        if !self.buf.is_empty() {
            self.buf.remove(0);
        }
        Ok(false)
    }
}

fn decode_args(buf: &[u8], arg_types: &[ArgType]) -> ArgDecodeOutcome {
    let mut offset = 0;
    let mut values = Vec::with_capacity(arg_types.len());

    for arg_type in arg_types {
        match arg_type {
            ArgType::I32 => match varint::decode_signed(&buf[offset..]) {
                Ok((v, n)) => {
                    values.push(Value::from(v));
                    offset += n;
                }
                Err(varint::VarintError::Incomplete) => return ArgDecodeOutcome::Incomplete,
                Err(varint::VarintError::Malformed) => return ArgDecodeOutcome::Malformed,
            },
            ArgType::U32 | ArgType::Hex32 => match varint::decode_unsigned(&buf[offset..]) {
                Ok((v, n)) => {
                    values.push(Value::from(v));
                    offset += n;
                }
                Err(varint::VarintError::Incomplete) => return ArgDecodeOutcome::Incomplete,
                Err(varint::VarintError::Malformed) => return ArgDecodeOutcome::Malformed,
            },
            ArgType::F32 => {
                if buf.len() < offset + 4 {
                    return ArgDecodeOutcome::Incomplete;
                }
                let bytes = [
                    buf[offset],
                    buf[offset + 1],
                    buf[offset + 2],
                    buf[offset + 3],
                ];
                values.push(Value::from(f32::from_le_bytes(bytes)));
                offset += 4;
            }
            ArgType::Str => {
                // §9 open question: string length is a plain unsigned
                // varint, not zig-zag (negative lengths are
                // meaningless).
                let (len, n) = match varint::decode_unsigned(&buf[offset..]) {
                    Ok(pair) => pair,
                    Err(varint::VarintError::Incomplete) => return ArgDecodeOutcome::Incomplete,
                    Err(varint::VarintError::Malformed) => return ArgDecodeOutcome::Malformed,
                };
                let len = len as usize;
                if buf.len() < offset + n + len {
                    return ArgDecodeOutcome::Incomplete;
                }
                let bytes = &buf[offset + n..offset + n + len];
                values.push(Value::from(String::from_utf8_lossy(bytes).to_string()));
                offset += n + len;
            }
        }
    }

    ArgDecodeOutcome::Done(values, offset)
}

fn format_spec_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"%[-+ #0-9.]*(?:hh|h|ll|l|L|z|j|t)?[diouxXeEfFgGaAcs]").unwrap())
}

/// Host-side `printf`-style substitution of decoded arguments into
/// the record's format string.
fn format_message(format_string: &str, args: &[Value]) -> String {
    let re = format_spec_regex();
    let mut result = String::with_capacity(format_string.len());
    let mut last = 0;
    let mut arg_iter = args.iter();

    for m in re.find_iter(format_string) {
        result.push_str(&format_string[last..m.start()]);
        last = m.end();
        let spec = m.as_str();
        let value = arg_iter.next();
        let rendered = match (spec.chars().last(), value) {
            (Some('f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'a' | 'A'), Some(v)) => {
                format!("{:.6}", v.as_f64().unwrap_or(0.0))
            }
            (Some('x'), Some(v)) => format!("{:x}", v.as_u64().unwrap_or(0)),
            (Some('X'), Some(v)) => format!("{:X}", v.as_u64().unwrap_or(0)),
            (Some('s'), Some(v)) => v.as_str().unwrap_or("").to_string(),
            (Some('u' | 'o'), Some(v)) => v.as_u64().unwrap_or(0).to_string(),
            (_, Some(v)) => v.as_i64().map(|i| i.to_string()).unwrap_or_else(|| v.to_string()),
            (_, None) => spec.to_string(),
        };
        result.push_str(&rendered);
    }
    result.push_str(&format_string[last..]);
    result
}

/// Connects to the binary RTT channel with retry (§4.10 point 7) and
/// feeds it to `decoder` until the stream ends or a fatal error
/// occurs. Calls `on_record` for each decoded record as it completes,
/// preserving packet-completion order (§4.10 point 6).
pub fn decode_stream(
    host: &str,
    port: u16,
    decoder: &mut LogDecoder,
    max_retries: u32,
    mut on_record: impl FnMut(&LogRecord),
) -> Result<(), DecodeError> {
    let mut stream: TcpStream =
        rpc::connect_with_backoff(host, port, Duration::from_secs(2), max_retries)?;
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                decoder.push(&chunk[..n]);
                while let Some(record) = decoder.pull()? {
                    on_record(&record);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    // A partial packet at end-of-stream is discarded, not an error
    // (§3 lifecycle: "leftover partial packets at end-of-stream are
    // discarded").
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokendb::{ArgType, Database};
    use std::io::Write;

    fn build_db(dir: &std::path::Path, rows: &[(&str, &str, &str, &str, u32)]) -> Database {
        let path = dir.join("tokens.csv");
        let mut hashes = vec![];
        let mut body = String::new();
        for (fmt, level, arg_types, file, line) in rows {
            let hash = fnv1a_32(fmt.as_bytes());
            hashes.push(hash);
            body.push_str(&format!(
                "0x{hash:08x},{level},\"{fmt}\",{arg_types},{file},{line}\n"
            ));
        }
        let build_id = crate::fnv::build_id_of(hashes);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# build_id=0x{build_id:08x}").unwrap();
        writeln!(f, "token_hash,level,format_string,arg_types,file,line").unwrap();
        f.write_all(body.as_bytes()).unwrap();
        Database::load(&path).unwrap()
    }

    #[test]
    fn decodes_happy_path_example() {
        let dir = tempfile::tempdir().unwrap();
        let db = build_db(
            &dir.path(),
            &[("Motor rpm=%d, temp=%f", "INFO", "i32;f32", "main.c", 87)],
        );

        let mut decoder = LogDecoder::new(&db, false);
        let packet: [u8; 11] = [0xD4, 0xC3, 0xB2, 0xA1, 0x22, 0x80, 0x32, 0x00, 0x00, 0x28, 0x42];
        decoder.push(&packet);

        let record = decoder.pull().unwrap().unwrap();
        assert_eq!(record.level, "INFO");
        assert_eq!(record.msg, "Motor rpm=3200, temp=42.000000");
        assert_eq!(record.token, "0xa1b2c3d4");
        assert_eq!(record.raw_args, vec![Value::from(3200), Value::from(42.0f32)]);
        assert!(decoder.pull().unwrap().is_none());
    }

    #[test]
    fn unknown_token_emits_unknown_record() {
        let dir = tempfile::tempdir().unwrap();
        let db = build_db(&dir.path(), &[]);
        let mut decoder = LogDecoder::new(&db, false);
        decoder.push(&[0xEF, 0xBE, 0xAD, 0xDE, 0x20]);

        let record = decoder.pull().unwrap().unwrap();
        assert_eq!(record.level, "UNKNOWN");
        assert_eq!(record.msg, "<unknown token 0xdeadbeef>");
        assert!(record.raw_args.is_empty());
    }

    #[test]
    fn build_id_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let db = build_db(&dir.path(), &[("x", "INFO", "", "a.c", 1)]);
        let mut decoder = LogDecoder::new(&db, true);

        let mut packet = build_id_token().to_le_bytes().to_vec();
        packet.push(0x01); // header: level 0, arg_count 1
        varint::encode_unsigned(0xdead_beef, &mut packet);
        decoder.push(&packet);

        let err = decoder.pull().unwrap_err();
        assert!(matches!(err, DecodeError::BuildIdMismatch { .. }));
    }

    #[test]
    fn matching_build_id_handshake_then_decodes_records() {
        let dir = tempfile::tempdir().unwrap();
        let db = build_db(&dir.path(), &[("hello", "DEBUG", "", "a.c", 3)]);
        let mut decoder = LogDecoder::new(&db, true);

        let mut packet = build_id_token().to_le_bytes().to_vec();
        packet.push(0x01);
        varint::encode_unsigned(db.build_id(), &mut packet);

        let hash = fnv1a_32(b"hello");
        packet.extend_from_slice(&hash.to_le_bytes());
        packet.push(0x30); // level DEBUG(3), arg_count 0

        decoder.push(&packet);
        let record = decoder.pull().unwrap().unwrap();
        assert_eq!(record.level, "DEBUG");
        assert_eq!(record.msg, "hello");
    }

    #[test]
    fn incomplete_packet_waits_for_more_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let db = build_db(&dir.path(), &[("n=%d", "ERROR", "i32", "a.c", 9)]);
        let mut decoder = LogDecoder::new(&db, false);

        let hash = fnv1a_32(b"n=%d");
        decoder.push(&hash.to_le_bytes());
        decoder.push(&[0x01]); // header only so far
        assert!(decoder.pull().unwrap().is_none());

        let mut arg = Vec::new();
        varint::encode_signed(7, &mut arg);
        decoder.push(&arg);
        let record = decoder.pull().unwrap().unwrap();
        assert_eq!(record.msg, "n=7");
    }
}
