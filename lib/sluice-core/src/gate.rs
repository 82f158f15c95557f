//! Vulnerability gate.

use std::{io, process::Stdio, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tokio::{process::Command, time::timeout};
use tracing::debug;

/// Vulnerability gate error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum GateError {
    /// The scanner could not be started.
    #[snafu(display("failed to run scanner '{}': {}", command, source))]
    Spawn {
        /// Scanner command.
        command: String,

        /// Underlying I/O error.
        source: io::Error,
    },

    /// The scanner did not finish in time.
    #[snafu(display("scanner '{}' did not finish within {} seconds", command, timeout.as_secs()))]
    TimedOut {
        /// Scanner command.
        command: String,

        /// Scan timeout.
        timeout: Duration,
    },

    /// The scanner exited unsuccessfully.
    #[snafu(display("scanner '{}' failed with exit code {}: {}", command, exit_code, stderr))]
    ScannerFailed {
        /// Scanner command.
        command: String,

        /// Exit code, or -1 if killed by a signal.
        exit_code: i32,

        /// Scanner error output.
        stderr: String,
    },

    /// The scanner report could not be parsed.
    #[snafu(display("failed to parse scanner report: {}", source))]
    InvalidReport {
        /// Underlying parse error.
        source: serde_json::Error,
    },
}

/// Result of scanning an artifact.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanOutcome {
    /// Nothing at the configured severities was found.
    Clean,

    /// Vulnerabilities were found.
    Findings {
        /// Number of findings.
        count: usize,
    },
}

/// Checks a candidate artifact for known vulnerabilities.
///
/// Findings are advisory unless blocking is configured, and gate errors never fail an update.
#[async_trait]
pub trait VulnerabilityGate: Send + Sync {
    /// Scans the artifact at the given version. Must not have side effects.
    async fn scan(&self, artifact: &str, version: &str) -> Result<ScanOutcome, GateError>;
}

/// Runs an external scanner that emits a Trivy-compatible JSON report.
///
/// The command is split on whitespace, so it may carry leading arguments of its own.
pub struct CommandGate {
    command: String,
    severities: String,
    timeout: Duration,
}

impl CommandGate {
    /// Creates a new `CommandGate`.
    ///
    /// `severities` is a comma-separated list, such as `HIGH,CRITICAL`.
    pub fn new<C: Into<String>, S: Into<String>>(command: C, severities: S, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            severities: severities.into(),
            timeout,
        }
    }
}

#[async_trait]
impl VulnerabilityGate for CommandGate {
    async fn scan(&self, artifact: &str, version: &str) -> Result<ScanOutcome, GateError> {
        let target = format!("{}:{}", artifact, version);
        let mut parts = self.command.split_whitespace();
        let program = parts.next().unwrap_or("trivy");
        let child = Command::new(program)
            .args(parts)
            .args(["image", "--quiet", "--format", "json", "--severity"])
            .arg(&self.severities)
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context(Spawn { command: &self.command })?;

        debug!(command = %self.command, target = %target, "Spawned vulnerability scanner.");

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| GateError::TimedOut {
                command: self.command.clone(),
                timeout: self.timeout,
            })?
            .context(Spawn { command: &self.command })?;

        if !output.status.success() {
            return ScannerFailed {
                command: &self.command,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .fail();
        }

        let count = count_findings(&output.stdout)?;
        debug!(target = %target, findings = count, "Vulnerability scan complete.");

        Ok(if count == 0 {
            ScanOutcome::Clean
        } else {
            ScanOutcome::Findings { count }
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ScanReport {
    #[serde(default)]
    results: Option<Vec<ScanResult>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ScanResult {
    #[serde(default)]
    vulnerabilities: Option<Vec<serde_json::Value>>,
}

/// Counts the vulnerabilities listed in a scanner report.
fn count_findings(report: &[u8]) -> Result<usize, GateError> {
    let report: ScanReport = serde_json::from_slice(report).context(InvalidReport)?;
    Ok(report
        .results
        .unwrap_or_default()
        .iter()
        .map(|r| r.vulnerabilities.as_ref().map_or(0, Vec::len))
        .sum())
}
