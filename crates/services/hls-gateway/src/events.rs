//! Stream status notifications
//!
//! Status changes are broadcast on a single topic to every subscriber that is
//! connected at the time. Publishing never fails from the caller's point of
//! view, nothing is persisted and late subscribers get no replay.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::session::SessionStatus;

/// Message type tag carried by every update
pub const STREAM_UPDATE: &str = "stream_update";

/// Payload pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    pub stream_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamUpdate {
    pub fn new(stream_id: impl Into<String>, status: SessionStatus, error: Option<String>) -> Self {
        Self {
            kind: STREAM_UPDATE.to_string(),
            stream_id: stream_id.into(),
            status,
            error,
        }
    }
}

/// Fire-and-forget broadcaster for [`StreamUpdate`]s
#[derive(Clone)]
pub struct NotificationPublisher {
    topic: Arc<str>,
    tx: broadcast::Sender<StreamUpdate>,
}

impl NotificationPublisher {
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            topic: Arc::from(topic.into()),
            tx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive every update published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StreamUpdate> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Broadcast one update; returns how many subscribers it reached
    pub fn publish(&self, stream_id: &str, status: SessionStatus, error: Option<String>) -> usize {
        let update = StreamUpdate::new(stream_id, status, error);
        match self.tx.send(update) {
            Ok(receivers) => {
                tracing::info!(
                    topic = %self.topic,
                    stream_id,
                    %status,
                    receivers,
                    "Published stream update"
                );
                receivers
            }
            Err(_) => {
                tracing::debug!(
                    topic = %self.topic,
                    stream_id,
                    %status,
                    "No subscribers for stream update"
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_wire_format() {
        let update = StreamUpdate::new("abc", SessionStatus::Failed, Some("boom".to_string()));
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "stream_update",
                "stream_id": "abc",
                "status": "failed",
                "error": "boom"
            })
        );

        let update = StreamUpdate::new("abc", SessionStatus::Connected, None);
        let json = serde_json::to_string(&update).unwrap();
        assert!(!json.contains("error"));
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let publisher = NotificationPublisher::new("streams", 16);
        let mut rx1 = publisher.subscribe();
        let mut rx2 = publisher.subscribe();

        assert_eq!(publisher.publish("abc", SessionStatus::Connected, None), 2);

        assert_eq!(rx1.recv().await.unwrap().status, SessionStatus::Connected);
        assert_eq!(rx2.recv().await.unwrap().stream_id, "abc");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let publisher = NotificationPublisher::new("streams", 16);
        assert_eq!(publisher.publish("abc", SessionStatus::Stopped, None), 0);
    }

    #[test]
    fn test_late_subscriber_gets_no_replay() {
        let publisher = NotificationPublisher::new("streams", 16);
        let _early = publisher.subscribe();
        publisher.publish("abc", SessionStatus::Connected, None);

        let mut late = publisher.subscribe();
        assert!(late.try_recv().is_err());
        assert_eq!(publisher.subscriber_count(), 2);
    }
}
