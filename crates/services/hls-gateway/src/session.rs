//! Stream sessions
//!
//! A session is one start → (connected) → stop/failure lifecycle for a single
//! source URL. Process state is not kept here; the registry owns it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, StreamError};

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Probed, launched or waiting for first output
    Starting,
    /// Transcoder is producing HLS output
    Connected,
    /// Probe, launch or readiness failed
    Failed,
    /// Torn down by a stop request, expiry or shutdown
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Connected => "connected",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        }
    }

    /// Whether `next` is a legal successor of this status.
    ///
    /// `Starting → Stopped` covers a stop request that lands while the
    /// readiness poll is still running.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Starting, SessionStatus::Connected)
                | (SessionStatus::Starting, SessionStatus::Failed)
                | (SessionStatus::Starting, SessionStatus::Stopped)
                | (SessionStatus::Connected, SessionStatus::Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Failed | SessionStatus::Stopped)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single transcoding session
#[derive(Debug)]
pub struct Session {
    /// Unique session ID (UUID v4)
    pub id: String,

    /// Source URL as supplied by the client
    pub source_url: String,

    /// `<storage root>/<id>`
    pub output_dir: PathBuf,

    /// When the start request was accepted
    pub created_at: DateTime<Utc>,

    status: RwLock<SessionStatus>,
}

impl Session {
    pub fn new(id: String, source_url: String, output_dir: PathBuf) -> Self {
        Self {
            id,
            source_url,
            output_dir,
            created_at: Utc::now(),
            status: RwLock::new(SessionStatus::Starting),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    pub async fn set_connected(&self) -> Result<()> {
        self.transition(SessionStatus::Connected).await
    }

    pub async fn set_failed(&self) -> Result<()> {
        self.transition(SessionStatus::Failed).await
    }

    pub async fn set_stopped(&self) -> Result<()> {
        self.transition(SessionStatus::Stopped).await
    }

    async fn transition(&self, next: SessionStatus) -> Result<()> {
        let mut status = self.status.write().await;
        if !status.can_transition_to(next) {
            return Err(StreamError::InvalidStateTransition {
                from: *status,
                to: next,
            });
        }
        tracing::debug!(stream_id = %self.id, from = %*status, to = %next, "Session transition");
        *status = next;
        Ok(())
    }
}

/// Generate a fresh session identifier
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Canonicalise a client-supplied session id.
///
/// Returns `None` for anything that is not a UUID, so ids that could escape
/// the storage root never reach the filesystem.
pub fn parse_session_id(raw: &str) -> Option<String> {
    Uuid::parse_str(raw.trim()).ok().map(|id| id.to_string())
}
