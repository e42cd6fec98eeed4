//! Gateway error types

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionStatus;

/// Why a pre-flight probe could not reach the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    /// DNS lookup of the RTSP host failed
    HostUnresolvable,
    /// The host answered but refused the connection
    ConnectionRefused,
    /// Any other transcoder error
    Generic,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::HostUnresolvable => write!(f, "Failed to resolve RTSP server hostname"),
            ProbeFailure::ConnectionRefused => write!(f, "RTSP server refused the connection"),
            ProbeFailure::Generic => write!(f, "Failed to open RTSP stream"),
        }
    }
}

/// Errors raised by the session orchestration layer
#[derive(Debug, Error)]
pub enum StreamError {
    /// Bad or missing input
    #[error("{0}")]
    Validation(String),

    /// Pre-flight probe reached a verdict: the source is unusable
    #[error("{kind}: {detail}")]
    Probe { kind: ProbeFailure, detail: String },

    /// Pre-flight probe did not finish in time
    #[error("Timed out after {secs}s while connecting to RTSP stream")]
    ProbeTimeout { secs: u64 },

    /// The transcoder subprocess could not be spawned
    #[error("Failed to start transcoder: {0}")]
    Launch(String),

    /// The session output directory could not be created or written
    #[error("Output directory {} is not usable: {reason}", .path.display())]
    Directory { path: PathBuf, reason: String },

    /// The transcoder never produced output
    #[error("Transcoder produced no output within {secs}s")]
    ReadinessTimeout { secs: u64 },

    /// The transcoder exited before producing output
    #[error("Transcoder exited before producing output ({status}): {diagnostics}")]
    PrematureExit { status: String, diagnostics: String },

    /// A stop request named an unknown stream
    #[error("Stream {0} not found")]
    NotFound(String),

    /// Delivering the kill signal failed; cleanup continues regardless
    #[error("Failed to signal transcoder process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    /// A registry entry already exists for this id
    #[error("Stream {0} is already registered")]
    DuplicateSession(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// A stop request tore the session down while it was still starting
    #[error("Stream {0} was stopped before it became ready")]
    StoppedDuringStart(String),

    /// Server shutdown interrupted an in-flight start
    #[error("Stream start cancelled: server is shutting down")]
    Cancelled,
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_messages_name_the_failure() {
        let err = StreamError::Probe {
            kind: ProbeFailure::HostUnresolvable,
            detail: "bad.invalid: Name or service not known".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to resolve RTSP server hostname: bad.invalid: Name or service not known"
        );

        let err = StreamError::Probe {
            kind: ProbeFailure::ConnectionRefused,
            detail: "Connection refused".to_string(),
        };
        assert!(err.to_string().starts_with("RTSP server refused the connection"));
    }

    #[test]
    fn test_premature_exit_carries_diagnostics() {
        let err = StreamError::PrematureExit {
            status: "exit status: 1".to_string(),
            diagnostics: "rtsp://cam/stream: Invalid data found when processing input".to_string(),
        };
        assert!(err.to_string().contains("Invalid data found"));
    }
}
