//! Stream endpoints
//!
//! Start, probe, stop and inspect transcoding sessions.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{json_rejection, query_rejection, AppState};
use crate::controller::{StartedStream, StreamStatus};

/// Request body for starting a stream
#[derive(Debug, Default, Deserialize)]
pub struct StartStreamRequest {
    #[serde(default)]
    pub rtsp_url: Option<String>,
}

/// Query for probing a source
#[derive(Debug, Default, Deserialize)]
pub struct TestRtspQuery {
    #[serde(default)]
    pub rtsp_url: Option<String>,
}

/// Request body for stopping a stream
#[derive(Debug, Default, Deserialize)]
pub struct StopStreamRequest {
    #[serde(default)]
    pub stream_id: Option<String>,
}

/// Response body for a successful probe
#[derive(Debug, Serialize, Deserialize)]
pub struct TestRtspResponse {
    pub status: String,
}

/// Response body for a stop
#[derive(Debug, Serialize, Deserialize)]
pub struct StopStreamResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StreamListResponse {
    pub streams: Vec<StreamStatus>,
}

/// Start a stream
///
/// POST /stream/start
///
/// Holds the request open until the transcoder has produced output or the
/// start has failed.
pub async fn start_stream(
    State(state): State<AppState>,
    body: Result<Json<StartStreamRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return json_rejection(rejection),
    };

    match state.controller.start(req.rtsp_url.as_deref()).await {
        Ok(started) => (StatusCode::OK, Json::<StartedStream>(started)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Probe a source without starting a session
///
/// GET /test-rtsp?rtsp_url=...
pub async fn test_rtsp(
    State(state): State<AppState>,
    query: Result<Query<TestRtspQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return query_rejection(rejection),
    };

    match state.controller.test_source(query.rtsp_url.as_deref()).await {
        Ok(()) => Json(TestRtspResponse {
            status: "success".to_string(),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Stop a stream
///
/// POST /stream/stop
pub async fn stop_stream(
    State(state): State<AppState>,
    body: Result<Json<StopStreamRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return json_rejection(rejection),
    };

    match state.controller.stop(req.stream_id.as_deref()).await {
        Ok(outcome) => Json(StopStreamResponse {
            message: format!("Stream {} stopped", outcome.stream_id),
            warnings: outcome.warnings,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Get stream status
///
/// GET /streams/:id
pub async fn stream_status(State(state): State<AppState>, Path(stream_id): Path<String>) -> Response {
    match state.controller.status(&stream_id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => e.into_response(),
    }
}

/// List streams owned by this instance
///
/// GET /streams
pub async fn list_streams(State(state): State<AppState>) -> impl IntoResponse {
    Json(StreamListResponse {
        streams: state.controller.list().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_fields_are_optional() {
        let req: StartStreamRequest = serde_json::from_str("{}").unwrap();
        assert!(req.rtsp_url.is_none());

        let req: StopStreamRequest =
            serde_json::from_str(r#"{"stream_id": "abc", "extra": 1}"#).unwrap();
        assert_eq!(req.stream_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_stop_response_omits_empty_warnings() {
        let json = serde_json::to_string(&StopStreamResponse {
            message: "Stream abc stopped".into(),
            warnings: Vec::new(),
        })
        .unwrap();
        assert_eq!(json, r#"{"message":"Stream abc stopped"}"#);
    }
}
