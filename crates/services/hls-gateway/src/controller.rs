//! Session controller
//!
//! Orchestrates the stream lifecycle: validate → probe → launch → register →
//! wait for output → notify → respond, plus stop, expiry and shutdown. Every
//! failure and stop path funnels through a single idempotent teardown.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Result, StreamError};
use crate::events::NotificationPublisher;
use crate::probe::{validate_source_url, Prober};
use crate::readiness::{wait_until_ready, PollOptions, ReadinessTarget};
use crate::registry::{Claim, ProcessRegistry, Registered, RegistryEntry};
use crate::session::{new_session_id, parse_session_id, Session, SessionStatus};
use crate::transcoder::{kill_pid, Launcher, TranscoderProcess};

/// Error text attached to `stopped` updates emitted by the reaper
const EXPIRED_REASON: &str = "session expired";

/// A stream that reached `connected`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartedStream {
    pub stream_id: String,
    pub stream_url: String,
}

/// Result of a stop request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StopOutcome {
    pub stream_id: String,
    /// Best-effort cleanup steps that failed
    pub warnings: Vec<String>,
}

/// Snapshot of a registered stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub stream_id: String,
    pub status: SessionStatus,
    pub stream_url: String,
    pub source_url: String,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// False when the process belongs to another gateway instance
    pub local: bool,
}

/// What teardown has to terminate
enum Teardown {
    Live(Arc<TranscoderProcess>),
    Detached(u32),
    Nothing,
}

pub struct SessionController {
    config: Arc<Config>,
    registry: Arc<ProcessRegistry>,
    publisher: NotificationPublisher,
    launcher: Launcher,
    prober: Prober,
    shutdown: CancellationToken,
}

impl SessionController {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ProcessRegistry>,
        publisher: NotificationPublisher,
    ) -> Self {
        let launcher = Launcher::new(config.transcoder.clone());
        let prober = Prober::new(&config.transcoder, &config.probe);
        Self {
            config,
            registry,
            publisher,
            launcher,
            prober,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn publisher(&self) -> &NotificationPublisher {
        &self.publisher
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Externally reachable manifest URL for a stream
    pub fn stream_url(&self, stream_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.server.public_base_url.trim_end_matches('/'),
            stream_id,
            self.config.transcoder.manifest_name
        )
    }

    pub fn output_dir(&self, stream_id: &str) -> PathBuf {
        self.config.storage.root.join(stream_id)
    }

    /// Run only the pre-flight probe against a source
    pub async fn test_source(&self, rtsp_url: Option<&str>) -> Result<()> {
        let source_url = validate_source_url(rtsp_url, &self.config.probe.allowed_schemes)?;
        self.prober.probe(&source_url).await
    }

    /// Start a stream and wait until it produces output.
    ///
    /// The `connected` or `failed` notification is published before this
    /// returns.
    pub async fn start(&self, rtsp_url: Option<&str>) -> Result<StartedStream> {
        let source_url = validate_source_url(rtsp_url, &self.config.probe.allowed_schemes)?;
        let stream_id = new_session_id();
        let session = Arc::new(Session::new(
            stream_id.clone(),
            source_url.clone(),
            self.output_dir(&stream_id),
        ));
        tracing::info!(stream_id = %stream_id, source = %source_url, "Starting stream");

        if let Err(e) = self.prober.probe(&source_url).await {
            return Err(self.fail(&session, e).await);
        }

        let process = match self.launcher.launch(&source_url, &session.output_dir).await {
            Ok(process) => Arc::new(process),
            Err(e) => {
                self.teardown(&stream_id, &session.output_dir, Teardown::Nothing)
                    .await;
                return Err(self.fail(&session, e).await);
            }
        };

        if let Err(e) = self
            .registry
            .register(session.clone(), process.clone(), self.config.registry.session_ttl())
            .await
        {
            // The id belongs to someone else: only our own process is ours to kill.
            if let Err(kill_err) = process.kill().await {
                tracing::warn!(stream_id = %stream_id, "{}", kill_err);
            }
            return Err(self.fail(&session, e).await);
        }

        let target = ReadinessTarget {
            output_dir: session.output_dir.clone(),
            manifest_name: self.config.transcoder.manifest_name.clone(),
            segment_extension: self.config.transcoder.segment_extension.clone(),
        };
        let options = PollOptions {
            timeout: self.config.readiness.timeout(),
            interval: self.config.readiness.poll_interval(),
        };
        let cancel = self.shutdown.child_token();

        if let Err(e) = wait_until_ready(&target, &process, options, &cancel).await {
            self.teardown(&stream_id, &session.output_dir, Teardown::Live(process))
                .await;
            return Err(self.fail(&session, e.into()).await);
        }

        if session.set_connected().await.is_err() {
            // A stop request won the race after output appeared.
            return Err(StreamError::StoppedDuringStart(stream_id));
        }
        self.registry
            .record_status(&stream_id, SessionStatus::Connected)
            .await;
        self.publisher
            .publish(&stream_id, SessionStatus::Connected, None);

        tracing::info!(
            stream_id = %stream_id,
            pid = process.pid(),
            "Stream connected"
        );
        Ok(StartedStream {
            stream_url: self.stream_url(&stream_id),
            stream_id,
        })
    }

    /// Stop a stream: kill, unregister, delete output, notify.
    pub async fn stop(&self, stream_id: Option<&str>) -> Result<StopOutcome> {
        let raw = stream_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StreamError::Validation("Stream ID is required".to_string()))?;
        let stream_id =
            parse_session_id(raw).ok_or_else(|| StreamError::NotFound(raw.to_string()))?;

        let registered = match self.registry.take(&stream_id).await {
            Some(Claim::Won(registered)) => registered,
            Some(Claim::Released(entry)) => {
                self.release(entry).await;
                return Err(StreamError::NotFound(stream_id));
            }
            None => return Err(StreamError::NotFound(stream_id)),
        };

        let warnings = self.finish(&stream_id, registered, None).await;
        tracing::info!(stream_id = %stream_id, warnings = warnings.len(), "Stream stopped");

        Ok(StopOutcome {
            stream_id,
            warnings,
        })
    }

    /// Status of one registered stream
    pub async fn status(&self, stream_id: &str) -> Result<StreamStatus> {
        let id = parse_session_id(stream_id)
            .ok_or_else(|| StreamError::NotFound(stream_id.to_string()))?;
        let registered = self
            .registry
            .lookup(&id)
            .await
            .ok_or_else(|| StreamError::NotFound(id.clone()))?;

        Ok(match registered {
            Registered::Live(entry) => StreamStatus {
                stream_url: self.stream_url(&id),
                stream_id: id,
                status: entry.session.status().await,
                source_url: entry.session.source_url.clone(),
                pid: entry.process.pid(),
                created_at: entry.session.created_at,
                expires_at: entry.expires_at,
                local: true,
            },
            Registered::Detached(record) => StreamStatus {
                stream_url: self.stream_url(&id),
                stream_id: id,
                status: record.status,
                source_url: record.source_url,
                pid: record.pid,
                created_at: record.created_at,
                expires_at: record.expires_at,
                local: false,
            },
        })
    }

    /// Status of every stream owned by this instance, oldest first
    pub async fn list(&self) -> Vec<StreamStatus> {
        self.release_stopped_elsewhere().await;

        let mut streams = Vec::new();
        for entry in self.registry.entries().await {
            streams.push(StreamStatus {
                stream_id: entry.session.id.clone(),
                status: entry.session.status().await,
                stream_url: self.stream_url(&entry.session.id),
                source_url: entry.session.source_url.clone(),
                pid: entry.process.pid(),
                created_at: entry.session.created_at,
                expires_at: entry.expires_at,
                local: true,
            });
        }
        streams.sort_by_key(|s| s.created_at);
        streams
    }

    /// Tear down every stream whose ttl elapsed; returns how many were reaped
    pub async fn reap_expired(&self) -> usize {
        let mut reaped = 0;
        for stream_id in self.registry.expired(Utc::now()).await {
            match self.registry.take(&stream_id).await {
                Some(Claim::Won(registered)) => {
                    tracing::info!(stream_id = %stream_id, "Reaping expired stream");
                    self.finish(&stream_id, registered, Some(EXPIRED_REASON.to_string()))
                        .await;
                    reaped += 1;
                }
                Some(Claim::Released(entry)) => self.release(entry).await,
                None => {}
            }
        }
        reaped
    }

    /// Clean up local handles of streams a peer instance stopped through the
    /// shared store; returns how many were released
    pub async fn release_stopped_elsewhere(&self) -> usize {
        let released = self.registry.drain_released().await;
        let count = released.len();
        for entry in released {
            self.release(entry).await;
        }
        count
    }

    /// Run the expiry reaper until shutdown is signalled
    pub async fn run_reaper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tracing::info!("Session reaper started (interval: {:?})", interval);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let released = self.release_stopped_elsewhere().await;
                    let reaped = self.reap_expired().await;
                    if reaped > 0 || released > 0 {
                        tracing::info!(reaped, released, "Reaped streams");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Session reaper shutting down");
                    break;
                }
            }
        }
    }

    /// Cancel in-flight starts and tear down every live stream
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let ids = self.registry.ids().await;
        tracing::info!(streams = ids.len(), "Stopping all streams");
        for stream_id in ids {
            match self.registry.take(&stream_id).await {
                Some(Claim::Won(registered)) => {
                    self.finish(&stream_id, registered, None).await;
                }
                Some(Claim::Released(entry)) => self.release(entry).await,
                None => {}
            }
        }
    }

    /// Stopped transition + teardown + notification for a claimed entry
    async fn finish(
        &self,
        stream_id: &str,
        registered: Registered,
        reason: Option<String>,
    ) -> Vec<String> {
        let (target, output_dir) = match registered {
            Registered::Live(entry) => {
                // Before the kill, so an in-flight start sees the stop and not a crash
                if let Err(e) = entry.session.set_stopped().await {
                    tracing::debug!(stream_id, "{}", e);
                }
                (Teardown::Live(entry.process), entry.session.output_dir.clone())
            }
            Registered::Detached(record) => (Teardown::Detached(record.pid), record.output_dir),
        };

        let warnings = self.teardown(stream_id, &output_dir, target).await;

        self.publisher
            .publish(stream_id, SessionStatus::Stopped, reason);
        warnings
    }

    /// Local cleanup for a stream a peer already stopped and announced
    async fn release(&self, entry: RegistryEntry) {
        let stream_id = entry.session.id.clone();
        tracing::info!(stream_id = %stream_id, "Stream was stopped by another instance");
        if let Err(e) = entry.session.set_stopped().await {
            tracing::debug!(stream_id = %stream_id, "{}", e);
        }
        self.teardown(
            &stream_id,
            &entry.session.output_dir,
            Teardown::Live(entry.process),
        )
        .await;
    }

    /// Kill if running, unregister, delete the output directory.
    ///
    /// Every step tolerates "already gone" and runs regardless of earlier
    /// failures; failures come back as warnings.
    async fn teardown(&self, stream_id: &str, output_dir: &Path, target: Teardown) -> Vec<String> {
        let mut warnings = Vec::new();

        let killed = match target {
            Teardown::Live(process) => process.kill().await,
            Teardown::Detached(pid) => kill_pid(pid),
            Teardown::Nothing => Ok(()),
        };
        if let Err(e) = killed {
            tracing::warn!(stream_id, "{}", e);
            warnings.push(e.to_string());
        }

        self.registry.remove(stream_id).await;

        match tokio::fs::remove_dir_all(output_dir).await {
            Ok(()) => {
                tracing::debug!(stream_id, path = %output_dir.display(), "Removed output directory")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                let err = StreamError::Directory {
                    path: output_dir.to_path_buf(),
                    reason: format!("cleanup failed: {}", e),
                };
                tracing::warn!(stream_id, "{}", err);
                warnings.push(err.to_string());
            }
        }

        warnings
    }

    /// Mark a starting session failed and publish the failure.
    ///
    /// A session that a stop request already ended is reported as such and
    /// gets no second notification.
    async fn fail(&self, session: &Session, error: StreamError) -> StreamError {
        if session.set_failed().await.is_err() {
            tracing::info!(stream_id = %session.id, "Stream was stopped while starting: {}", error);
            return StreamError::StoppedDuringStart(session.id.clone());
        }

        tracing::warn!(stream_id = %session.id, "Stream failed: {}", error);
        self.publisher
            .publish(&session.id, SessionStatus::Failed, Some(error.to_string()));
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(base_url: &str) -> SessionController {
        let mut config = Config::default();
        config.server.public_base_url = base_url.to_string();
        config.storage.root = PathBuf::from("/srv/streams");
        SessionController::new(
            Arc::new(config),
            Arc::new(ProcessRegistry::new()),
            NotificationPublisher::new("streams", 8),
        )
    }

    #[test]
    fn test_stream_url_is_deterministic() {
        let controller = controller("https://cdn.example.com/live/");
        let id = "6f1c1a9e-9a43-4a53-9d3b-3a0f1b9a6b11";
        assert_eq!(
            controller.stream_url(id),
            "https://cdn.example.com/live/6f1c1a9e-9a43-4a53-9d3b-3a0f1b9a6b11/index.m3u8"
        );
        assert_eq!(controller.stream_url(id), controller.stream_url(id));
        assert_eq!(
            controller.output_dir(id),
            PathBuf::from("/srv/streams/6f1c1a9e-9a43-4a53-9d3b-3a0f1b9a6b11")
        );
    }

    #[tokio::test]
    async fn test_start_rejects_missing_url() {
        let controller = controller("http://localhost/streams");
        let mut rx = controller.publisher().subscribe();

        for url in [None, Some(""), Some("  ")] {
            assert!(matches!(
                controller.start(url).await,
                Err(StreamError::Validation(_))
            ));
        }
        assert!(controller.registry().is_empty().await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_validation_and_unknown_ids() {
        let controller = controller("http://localhost/streams");
        let mut rx = controller.publisher().subscribe();

        assert!(matches!(
            controller.stop(Some(" ")).await,
            Err(StreamError::Validation(_))
        ));
        assert!(matches!(
            controller.stop(Some("../../etc")).await,
            Err(StreamError::NotFound(_))
        ));
        assert!(matches!(
            controller.stop(Some(&new_session_id())).await,
            Err(StreamError::NotFound(_))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_status_unknown() {
        let controller = controller("http://localhost/streams");
        assert!(matches!(
            controller.status(&new_session_id()).await,
            Err(StreamError::NotFound(_))
        ));
        assert!(controller.list().await.is_empty());
        assert_eq!(controller.reap_expired().await, 0);
    }
}
