//! Readiness polling
//!
//! Waits for a freshly launched transcoder to produce usable HLS output:
//! a non-empty manifest or at least one non-empty segment. The poller only
//! observes; killing the process and removing the directory is the caller's job.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::transcoder::TranscoderProcess;

/// How long to wait for the stderr reader once the process has exited
const DIAGNOSTIC_DRAIN: Duration = Duration::from_millis(500);

/// Where to look for output
#[derive(Debug, Clone)]
pub struct ReadinessTarget {
    pub output_dir: PathBuf,
    pub manifest_name: String,
    pub segment_extension: String,
}

impl ReadinessTarget {
    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(&self.manifest_name)
    }

    /// Whether the transcoder has written usable output yet
    pub async fn has_output(&self) -> bool {
        if non_empty_file(&self.manifest_path()).await {
            return true;
        }
        self.has_segment().await
    }

    async fn has_segment(&self) -> bool {
        let mut entries = match tokio::fs::read_dir(&self.output_dir).await {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_segment = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == self.segment_extension);
            if is_segment && non_empty_file(&path).await {
                return true;
            }
        }
        false
    }
}

async fn non_empty_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Poll timing
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

/// Output is available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready;

#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("no output within {0:?}")]
    Timeout(Duration),

    #[error("transcoder exited ({status}) before producing output")]
    Exited { status: String, diagnostics: String },

    #[error("readiness wait cancelled")]
    Cancelled,
}

impl From<ReadinessError> for StreamError {
    fn from(err: ReadinessError) -> Self {
        match err {
            ReadinessError::Timeout(timeout) => StreamError::ReadinessTimeout {
                secs: timeout.as_secs(),
            },
            ReadinessError::Exited {
                status,
                diagnostics,
            } => StreamError::PrematureExit {
                status,
                diagnostics,
            },
            ReadinessError::Cancelled => StreamError::Cancelled,
        }
    }
}

/// Wait until `target` has output, the process dies, the deadline passes or
/// `cancel` fires, whichever comes first.
pub async fn wait_until_ready(
    target: &ReadinessTarget,
    process: &TranscoderProcess,
    options: PollOptions,
    cancel: &CancellationToken,
) -> Result<Ready, ReadinessError> {
    let deadline = Instant::now() + options.timeout;
    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReadinessError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(pid = process.pid(), timeout = ?options.timeout, "Transcoder not ready before deadline");
                return Err(ReadinessError::Timeout(options.timeout));
            }
            _ = ticker.tick() => {}
        }

        if target.has_output().await {
            tracing::debug!(
                pid = process.pid(),
                elapsed = ?process.uptime(),
                "Transcoder output ready"
            );
            return Ok(Ready);
        }

        if let Some(status) = process.try_exit().await {
            let diagnostics = process.drain_diagnostics(DIAGNOSTIC_DRAIN).await;
            tracing::warn!(pid = process.pid(), %status, "Transcoder exited before producing output");
            return Err(ReadinessError::Exited {
                status: status.to_string(),
                diagnostics,
            });
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;

    fn target(dir: &Path) -> ReadinessTarget {
        ReadinessTarget {
            output_dir: dir.to_path_buf(),
            manifest_name: "index.m3u8".to_string(),
            segment_extension: "ts".to_string(),
        }
    }

    fn options(timeout_ms: u64) -> PollOptions {
        PollOptions {
            timeout: Duration::from_millis(timeout_ms),
            interval: Duration::from_millis(20),
        }
    }

    fn shell(script: &str) -> TranscoderProcess {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        TranscoderProcess::spawn(&mut command, 20).unwrap()
    }

    #[tokio::test]
    async fn test_ready_when_manifest_appears() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("index.m3u8");
        let process = shell(&format!(
            "sleep 0.1; echo '#EXTM3U' > '{}'; exec sleep 30",
            manifest.display()
        ));

        let result =
            wait_until_ready(&target(dir.path()), &process, options(5000), &CancellationToken::new())
                .await;
        assert_eq!(result.unwrap(), Ready);
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_manifest_is_not_ready_but_segment_is() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.m3u8"), b"").unwrap();
        let target = target(dir.path());
        assert!(!target.has_output().await);

        std::fs::write(dir.path().join("000.ts"), b"").unwrap();
        assert!(!target.has_output().await);

        std::fs::write(dir.path().join("001.ts"), b"\x47").unwrap();
        assert!(target.has_output().await);
    }

    #[tokio::test]
    async fn test_timeout_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let process = shell("exec sleep 30");

        let started = std::time::Instant::now();
        let result =
            wait_until_ready(&target(dir.path()), &process, options(200), &CancellationToken::new())
                .await;
        assert!(matches!(result, Err(ReadinessError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));

        // The poller leaves the process alone
        assert!(process.is_running().await);
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_premature_exit_surfaces_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let process = shell("echo 'rtsp://cam: Invalid data found when processing input' >&2; exit 1");

        let started = std::time::Instant::now();
        let result =
            wait_until_ready(&target(dir.path()), &process, options(5000), &CancellationToken::new())
                .await;
        match result {
            Err(ReadinessError::Exited { diagnostics, .. }) => {
                assert!(diagnostics.contains("Invalid data found"));
            }
            other => panic!("expected premature exit, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let process = shell("exec sleep 30");
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let result = wait_until_ready(&target(dir.path()), &process, options(5000), &cancel).await;
        assert!(matches!(result, Err(ReadinessError::Cancelled)));
        canceller.await.unwrap();
        process.kill().await.unwrap();
    }

    #[test]
    fn test_error_mapping() {
        let err: StreamError = ReadinessError::Timeout(Duration::from_secs(30)).into();
        assert!(matches!(err, StreamError::ReadinessTimeout { secs: 30 }));

        let err: StreamError = ReadinessError::Cancelled.into();
        assert!(matches!(err, StreamError::Cancelled));
    }
}
