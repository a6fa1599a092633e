//! The uniform machine-readable result document (§4.12) emitted by
//! every user-visible command. Mirrors how the teacher serializes one
//! struct straight out to its chosen sink; here the sink is always
//! stdout, and there is ever exactly one document per invocation.
use std::collections::BTreeMap;
use std::io::Write;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
    Error,
    Timeout,
    Skipped,
}

impl Status {
    /// §6: exit code 0 on success, 1 on any other non-success status.
    /// `decode_log` overrides this with its own dedicated code 2 on a
    /// build-id mismatch; see `main::exit_code_for`.
    pub fn exit_code(self) -> i32 {
        match self {
            Status::Success => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub pass: bool,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<bool>,
}

impl CheckResult {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            pass: true,
            detail: detail.into(),
            advisory: None,
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            pass: false,
            detail: detail.into(),
            advisory: None,
        }
    }

    pub fn advisory(mut self) -> Self {
        self.advisory = Some(true);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HilResult {
    pub status: Status,
    pub tool: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<BTreeMap<String, HilResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checks: Option<BTreeMap<String, CheckResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HilResult {
    pub fn new(tool: impl Into<String>, status: Status, duration_ms: u64) -> Self {
        Self {
            status,
            tool: tool.into(),
            duration_ms,
            stages: None,
            checks: None,
            error: None,
        }
    }

    pub fn success(tool: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(tool, Status::Success, duration_ms)
    }

    pub fn failure(tool: impl Into<String>, duration_ms: u64, error: impl Into<String>) -> Self {
        let mut r = Self::new(tool, Status::Failure, duration_ms);
        r.error = Some(error.into());
        r
    }

    pub fn error(tool: impl Into<String>, duration_ms: u64, error: impl Into<String>) -> Self {
        let mut r = Self::new(tool, Status::Error, duration_ms);
        r.error = Some(error.into());
        r
    }

    pub fn timeout(tool: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(tool, Status::Timeout, duration_ms)
    }

    pub fn skipped(tool: impl Into<String>) -> Self {
        Self::new(tool, Status::Skipped, 0)
    }

    pub fn with_checks(mut self, checks: BTreeMap<String, CheckResult>) -> Self {
        self.checks = Some(checks);
        self
    }

    pub fn with_stages(mut self, stages: BTreeMap<String, HilResult>) -> Self {
        self.stages = Some(stages);
        self
    }

    /// Overall pass iff every *non-advisory* check passed (§3, §8).
    pub fn checks_pass(checks: &BTreeMap<String, CheckResult>) -> bool {
        checks
            .values()
            .all(|c| c.pass || c.advisory.unwrap_or(false))
    }

    /// Writes this document as the sole line of stdout output
    /// (`--json` mode; §7 "exactly one JSON document").
    pub fn emit_json(&self, mut out: impl Write) -> std::io::Result<()> {
        serde_json::to_writer(&mut out, self)?;
        writeln!(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checks_pass_ignores_advisory_failures() {
        let mut checks = BTreeMap::new();
        checks.insert(
            "server_clear".to_string(),
            CheckResult::fail("RPC port bound").advisory(),
        );
        checks.insert("probe_reachable".to_string(), CheckResult::pass("ok"));
        assert!(HilResult::checks_pass(&checks));
    }

    #[test]
    fn checks_pass_fails_on_blocking_check() {
        let mut checks = BTreeMap::new();
        checks.insert("probe_reachable".to_string(), CheckResult::fail("no probe"));
        assert!(!HilResult::checks_pass(&checks));
    }

    #[test]
    fn serializes_without_optional_fields() {
        let r = HilResult::success("flash", 120);
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("stages"));
        assert!(!json.contains("checks"));
        assert!(!json.contains("error"));
    }
}
