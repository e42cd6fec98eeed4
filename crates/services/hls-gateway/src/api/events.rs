//! SSE events endpoint
//!
//! Streams every [`StreamUpdate`] published on the gateway's topic to the
//! client via Server-Sent Events.

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::AppState;
use crate::events::{StreamUpdate, STREAM_UPDATE};

/// SSE feed of stream status updates
///
/// GET /stream/events
pub async fn events_stream(State(state): State<AppState>) -> impl IntoResponse {
    let publisher = state.controller.publisher();
    let receiver = publisher.subscribe();
    tracing::debug!(
        topic = publisher.topic(),
        subscribers = publisher.subscriber_count(),
        "SSE subscriber connected"
    );

    Sse::new(EventStream::new(receiver)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// Wrapper around BroadcastStream that converts StreamUpdates to SSE Events
struct EventStream {
    inner: BroadcastStream<StreamUpdate>,
}

impl EventStream {
    fn new(receiver: broadcast::Receiver<StreamUpdate>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
        }
    }
}

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(update))) => match serde_json::to_string(&update) {
                    Ok(json) => {
                        let event = Event::default().event(STREAM_UPDATE).data(json);
                        return Poll::Ready(Some(Ok(event)));
                    }
                    Err(e) => {
                        tracing::error!("Failed to serialize stream update: {}", e);
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    // Subscriber fell behind; skip what it missed
                    tracing::warn!("Broadcast lagged: {}", e);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
