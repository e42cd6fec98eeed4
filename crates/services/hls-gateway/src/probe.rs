//! Pre-flight source probe
//!
//! Runs the transcoder for a short, bounded interval against the source and
//! discards the output, so unreachable sources fail fast before a long-running
//! session is launched.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use url::Url;

use crate::config::{ProbeConfig, TranscoderConfig};
use crate::error::{ProbeFailure, Result, StreamError};
use crate::transcoder::spawn_error;

/// stderr fragments that indicate DNS resolution failed
const UNRESOLVABLE_MARKERS: &[&str] = &[
    "name or service not known",
    "temporary failure in name resolution",
    "nodename nor servname",
    "no address associated",
    "could not resolve",
    "failed to resolve hostname",
];

const REFUSED_MARKERS: &[&str] = &["connection refused"];

/// Classify probe stderr into a failure kind
pub fn classify_failure(stderr: &str) -> ProbeFailure {
    let lower = stderr.to_ascii_lowercase();
    if UNRESOLVABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        ProbeFailure::HostUnresolvable
    } else if REFUSED_MARKERS.iter().any(|m| lower.contains(m)) {
        ProbeFailure::ConnectionRefused
    } else {
        ProbeFailure::Generic
    }
}

/// Validate a client-supplied source URL and return it trimmed
pub fn validate_source_url(raw: Option<&str>, allowed_schemes: &[String]) -> Result<String> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StreamError::Validation("RTSP URL is required".to_string()))?;

    let url = Url::parse(raw)
        .map_err(|e| StreamError::Validation(format!("Invalid RTSP URL '{}': {}", raw, e)))?;

    if !allowed_schemes
        .iter()
        .any(|s| s.eq_ignore_ascii_case(url.scheme()))
    {
        return Err(StreamError::Validation(format!(
            "Unsupported URL scheme '{}', expected one of: {}",
            url.scheme(),
            allowed_schemes.join(", ")
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(StreamError::Validation(format!(
            "RTSP URL '{}' has no host",
            raw
        )));
    }

    Ok(raw.to_string())
}

/// Short connectivity check against a source
#[derive(Debug, Clone)]
pub struct Prober {
    binary: String,
    rtsp_transport: String,
    connect_timeout_ms: u64,
    duration_secs: u64,
    timeout: Duration,
}

impl Prober {
    pub fn new(transcoder: &TranscoderConfig, probe: &ProbeConfig) -> Self {
        Self {
            binary: transcoder.binary.clone(),
            rtsp_transport: transcoder.rtsp_transport.clone(),
            connect_timeout_ms: transcoder.connect_timeout_ms,
            duration_secs: probe.duration_secs.max(1),
            timeout: probe.timeout(),
        }
    }

    pub fn build_args(&self, source_url: &str) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-rtsp_transport".into(),
            self.rtsp_transport.clone(),
            "-timeout".into(),
            self.connect_timeout_ms.saturating_mul(1000).to_string(),
            "-i".into(),
            source_url.to_string(),
            "-t".into(),
            self.duration_secs.to_string(),
            "-f".into(),
            "null".into(),
            "-".into(),
        ]
    }

    /// Probe `source_url`.
    ///
    /// The probe subprocess is killed if it outlives the configured timeout.
    pub async fn probe(&self, source_url: &str) -> Result<()> {
        let child = Command::new(&self.binary)
            .args(self.build_args(source_url))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.binary, e))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(StreamError::Launch(format!("probe failed to run: {}", e)));
            }
            Err(_) => {
                tracing::warn!(source = %source_url, timeout = ?self.timeout, "Probe timed out");
                return Err(StreamError::ProbeTimeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if output.status.success() {
            tracing::debug!(source = %source_url, "Probe succeeded");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let kind = classify_failure(&stderr);
        let detail = if stderr.is_empty() {
            format!("transcoder exited with {}", output.status)
        } else {
            stderr
        };
        tracing::warn!(source = %source_url, ?kind, "Probe failed: {}", detail);

        Err(StreamError::Probe { kind, detail })
    }
}
