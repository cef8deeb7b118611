//! Best-effort fan-out of record summaries to live subscribers
//!
//! The WebSocket endpoint itself is an external collaborator; the core only
//! maintains the subscriber list and pushes one JSON summary per finished
//! interaction. A failed send drops that subscriber under the same lock.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::store::RecordSummary;

const SUBSCRIBER_BUFFER: usize = 64;

/// Mutex-guarded subscriber list, cheap to clone
#[derive(Clone, Default)]
pub struct RecordBroadcaster {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<String>>>>,
}

impl RecordBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber; the receiver side belongs to the caller
    #[allow(dead_code)] // Handed to the external WebSocket layer
    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Push a record summary to every subscriber; any send failure removes
    /// that subscriber
    pub fn broadcast(&self, summary: &RecordSummary) {
        let message = match serde_json::to_string(&serde_json::json!({
            "type": "record_created",
            "record": summary,
        })) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("Failed to serialize record summary: {}", e);
                return;
            }
        };

        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.try_send(message.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> RecordSummary {
        RecordSummary {
            id: 1,
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            timestamp: "2026-08-01T00:00:00Z".to_string(),
            response_status: 200,
            duration_ms: 10,
            target_platform: Some("openrouter".to_string()),
            target_model: Some("openai/gpt-4o-mini".to_string()),
            user_key_id: None,
            input_tokens: 5,
            output_tokens: 2,
            total_tokens: 7,
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_summary() {
        let broadcaster = RecordBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast(&summary());

        let message = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(parsed["type"], "record_created");
        assert_eq!(parsed["record"]["id"], 1);
        assert_eq!(parsed["record"]["total_tokens"], 7);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_removed() {
        let broadcaster = RecordBroadcaster::new();
        let rx = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        drop(rx);
        broadcaster.broadcast(&summary());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
