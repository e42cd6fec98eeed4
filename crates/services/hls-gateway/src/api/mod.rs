//! HTTP API for the RTSP → HLS gateway
//!
//! - `POST /stream/start` - Probe a source and start transcoding it
//! - `GET /test-rtsp` - Probe a source without starting anything
//! - `POST /stream/stop` - Stop a stream and delete its output
//! - `GET /streams` / `GET /streams/:id` - Registered streams
//! - `GET /stream/events` - SSE feed of stream status updates
//! - `GET /health`, `GET /`

pub mod events;
pub mod streams;

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::controller::SessionController;
use crate::error::StreamError;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<SessionController>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(controller: Arc<SessionController>, config: Arc<Config>) -> Self {
        Self { controller, config }
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    // The browser player lives on another origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/stream/start", post(streams::start_stream))
        .route("/stream/stop", post(streams::stop_stream))
        .route("/test-rtsp", get(streams::test_rtsp))
        .route("/streams", get(streams::list_streams))
        .route("/streams/:id", get(streams::stream_status))
        .route("/stream/events", get(events::events_stream))
        .route("/health", get(health_check))
        .route("/", get(home))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// HTTP status for each error kind
pub fn status_code(err: &StreamError) -> StatusCode {
    match err {
        StreamError::Validation(_) | StreamError::Probe { .. } => StatusCode::BAD_REQUEST,
        StreamError::ProbeTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
        StreamError::NotFound(_) => StatusCode::NOT_FOUND,
        StreamError::StoppedDuringStart(_) => StatusCode::CONFLICT,
        StreamError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

/// Unparseable request bodies get the same `{error}` shape as everything else
pub(crate) fn json_rejection(rejection: JsonRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new(rejection.body_text())),
    )
        .into_response()
}

pub(crate) fn query_rejection(rejection: QueryRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new(rejection.body_text())),
    )
        .into_response()
}

async fn health_check() -> &'static str {
    "OK"
}

async fn home() -> &'static str {
    "Welcome to the RTSP Stream Viewer API"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeFailure;
    use crate::events::NotificationPublisher;
    use crate::registry::ProcessRegistry;

    #[test]
    fn test_app_state_creation() {
        let config = Arc::new(Config::default());
        let controller = Arc::new(SessionController::new(
            config.clone(),
            Arc::new(ProcessRegistry::new()),
            NotificationPublisher::new("streams", 8),
        ));
        let state = AppState::new(controller, config);

        assert_eq!(state.config.server.http_port, 8000);
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (StreamError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (
                StreamError::Probe {
                    kind: ProbeFailure::ConnectionRefused,
                    detail: "x".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (StreamError::ProbeTimeout { secs: 10 }, StatusCode::REQUEST_TIMEOUT),
            (StreamError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (StreamError::StoppedDuringStart("x".into()), StatusCode::CONFLICT),
            (StreamError::Cancelled, StatusCode::SERVICE_UNAVAILABLE),
            (StreamError::Launch("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                StreamError::ReadinessTimeout { secs: 30 },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                StreamError::PrematureExit {
                    status: "exit status: 1".into(),
                    diagnostics: "x".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(status_code(&err), expected, "{}", err);
        }
    }
}
