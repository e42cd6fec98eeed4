//! Transcoder process management
//!
//! Builds the ffmpeg RTSP → HLS invocation, spawns it without waiting for
//! output and keeps a handle that can be polled for liveness and killed.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use crate::config::TranscoderConfig;
use crate::error::{Result, StreamError};

/// How long a killed process gets to be reaped before we stop waiting
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Marker written to prove the output directory is writable
const WRITE_CHECK_FILE: &str = ".write-check";

/// Bounded tail of a process's stderr
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl DiagnosticLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// All retained lines joined with newlines
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

/// Handle to a running transcoder
#[derive(Debug)]
pub struct TranscoderProcess {
    pid: u32,
    child: tokio::sync::Mutex<Child>,
    diagnostics: DiagnosticLog,
    stderr_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl TranscoderProcess {
    /// Spawn `command` with stderr captured into a diagnostic log.
    ///
    /// The child is killed if the handle is dropped.
    pub fn spawn(command: &mut Command, tail_lines: usize) -> std::io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id().unwrap_or_default();
        let diagnostics = DiagnosticLog::new(tail_lines);

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_reader(pid, stderr, diagnostics.clone()));

        Ok(Self {
            pid,
            child: tokio::sync::Mutex::new(child),
            diagnostics,
            stderr_task: tokio::sync::Mutex::new(stderr_task),
            started_at: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Exit status if the process has terminated
    pub async fn try_exit(&self) -> Option<ExitStatus> {
        match self.child.lock().await.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(pid = self.pid, "Failed to query transcoder status: {}", e);
                None
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.try_exit().await.is_none()
    }

    /// Current stderr tail
    pub fn diagnostics(&self) -> String {
        self.diagnostics.snapshot()
    }

    /// Stderr tail after the reader has drained the pipe.
    ///
    /// Only meaningful once the process has exited; waits at most `wait`.
    pub async fn drain_diagnostics(&self, wait: Duration) -> String {
        if let Some(task) = self.stderr_task.lock().await.take() {
            if tokio::time::timeout(wait, task).await.is_err() {
                tracing::debug!(pid = self.pid, "Stderr reader still busy, using partial output");
            }
        }
        self.diagnostics.snapshot()
    }

    /// Kill the process forcefully (SIGKILL on Unix) and reap it.
    ///
    /// Killing a process that already exited is a no-op.
    pub async fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!(pid = self.pid, %status, "Transcoder already exited");
            return Ok(());
        }

        child.start_kill().map_err(|e| StreamError::Signal {
            pid: self.pid,
            reason: e.to_string(),
        })?;

        match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid = self.pid, %status, "Transcoder killed");
                Ok(())
            }
            Ok(Err(e)) => Err(StreamError::Signal {
                pid: self.pid,
                reason: format!("kill sent but reaping failed: {}", e),
            }),
            Err(_) => {
                tracing::warn!(pid = self.pid, "Transcoder not reaped within {:?}", REAP_TIMEOUT);
                Ok(())
            }
        }
    }
}

fn spawn_stderr_reader(pid: u32, stderr: ChildStderr, log: DiagnosticLog) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(pid, "[transcoder] {}", line);
            log.push(line);
        }
    })
}

/// Send SIGKILL to a process known only by pid.
///
/// A process that no longer exists counts as killed.
#[cfg(unix)]
pub fn kill_pid(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| StreamError::Signal {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    if raw <= 0 {
        return Err(StreamError::Signal {
            pid,
            reason: "refusing to signal a process group".to_string(),
        });
    }

    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(StreamError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
pub fn kill_pid(pid: u32) -> Result<()> {
    Err(StreamError::Signal {
        pid,
        reason: "signalling detached processes is only supported on Unix".to_string(),
    })
}

/// Map a spawn failure to a launch error naming the binary
pub(crate) fn spawn_error(binary: &str, err: std::io::Error) -> StreamError {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            StreamError::Launch(format!("transcoder binary '{}' not found", binary))
        }
        std::io::ErrorKind::PermissionDenied => {
            StreamError::Launch(format!("permission denied executing '{}'", binary))
        }
        _ => StreamError::Launch(format!("{}: {}", binary, err)),
    }
}

/// Starts transcoder processes with the configured HLS profile
#[derive(Debug, Clone)]
pub struct Launcher {
    config: TranscoderConfig,
}

impl Launcher {
    pub fn new(config: TranscoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }

    pub fn manifest_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.config.manifest_name)
    }

    /// ffmpeg argument list for one session
    pub fn build_args(&self, source_url: &str, output_dir: &Path) -> Vec<String> {
        let c = &self.config;
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            c.log_level.clone(),
            // Input: forced transport, bounded analysis, connect timeout
            "-rtsp_transport".into(),
            c.rtsp_transport.clone(),
            "-analyzeduration".into(),
            c.analyze_duration_us.to_string(),
            "-probesize".into(),
            c.probe_size.to_string(),
            "-timeout".into(),
            c.connect_timeout_ms.saturating_mul(1000).to_string(),
            "-i".into(),
            source_url.to_string(),
            // Low-latency video encode
            "-c:v".into(),
            c.video_codec.clone(),
            "-preset".into(),
            c.preset.clone(),
            "-tune".into(),
            c.tune.clone(),
            "-g".into(),
            c.gop_size.to_string(),
            "-sc_threshold".into(),
            "0".into(),
            "-maxrate".into(),
            format!("{}k", c.max_bitrate_kbps),
            "-bufsize".into(),
            format!("{}k", c.buffer_size_kbps),
        ];

        if c.audio_codec.is_empty() {
            args.push("-an".into());
        } else {
            args.push("-c:a".into());
            args.push(c.audio_codec.clone());
        }

        // HLS segmenting
        args.extend([
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            c.segment_duration_secs.to_string(),
            "-hls_list_size".into(),
            c.playlist_size.to_string(),
        ]);
        if !c.hls_flags.is_empty() {
            args.push("-hls_flags".into());
            args.push(c.hls_flags.clone());
        }
        args.push("-hls_segment_filename".into());
        args.push(
            output_dir
                .join(format!("%03d.{}", c.segment_extension))
                .to_string_lossy()
                .into_owned(),
        );
        args.push(self.manifest_path(output_dir).to_string_lossy().into_owned());

        args
    }

    /// Create the output directory and start the transcoder.
    ///
    /// Returns as soon as the process is spawned.
    pub async fn launch(&self, source_url: &str, output_dir: &Path) -> Result<TranscoderProcess> {
        prepare_output_dir(output_dir).await?;

        let mut command = Command::new(&self.config.binary);
        command.args(self.build_args(source_url, output_dir));

        let process = TranscoderProcess::spawn(&mut command, self.config.diagnostic_tail_lines)
            .map_err(|e| spawn_error(&self.config.binary, e))?;

        tracing::info!(
            pid = process.pid(),
            output_dir = %output_dir.display(),
            "Transcoder launched"
        );
        Ok(process)
    }
}

async fn prepare_output_dir(dir: &Path) -> Result<()> {
    let directory_error = |reason: String| StreamError::Directory {
        path: dir.to_path_buf(),
        reason,
    };

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| directory_error(e.to_string()))?;

    let marker = dir.join(WRITE_CHECK_FILE);
    tokio::fs::write(&marker, b"")
        .await
        .map_err(|e| directory_error(format!("not writable: {}", e)))?;
    if let Err(e) = tokio::fs::remove_file(&marker).await {
        tracing::debug!(path = %marker.display(), "Failed to remove write marker: {}", e);
    }
    Ok(())
}
