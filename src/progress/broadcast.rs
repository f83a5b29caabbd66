//! Progress event fan-out
//!
//! Per-scan broadcast channels decouple progress mutations from their
//! subscribers (the web layer's websocket handlers). Messages from one scan
//! reach each subscriber in commit order; nothing is guaranteed across
//! scans. With no subscribers a publish is a no-op, and a subscriber that
//! falls behind the bounded buffer loses the oldest events rather than
//! stalling the pipeline.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// Buffered events per scan before slow subscribers start losing the oldest.
const CHANNEL_CAPACITY: usize = 256;

/// Typed progress messages, serialized with a `type` tag for the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseStart {
        scan_id: i64,
        phase: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        scan_status: Option<String>,
    },
    ProgressUpdate {
        scan_id: i64,
        phase: String,
        items_processed: i64,
        items_total: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_item: Option<String>,
        progress_percentage: f64,
        overall_progress: f64,
        total_pages_found: i64,
        pages_processed: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_completion: Option<String>,
    },
    PhaseComplete {
        scan_id: i64,
        phase: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<serde_json::Value>,
    },
    Error {
        scan_id: i64,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    PageResult {
        scan_id: i64,
        page_url: String,
        has_bias: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        bias_details: Option<serde_json::Value>,
    },
    InitialProgress {
        scan_id: i64,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_phase: Option<String>,
        overall_progress: f64,
        total_pages_found: i64,
        pages_processed: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_page_url: Option<String>,
    },
}

/// Registry of per-scan broadcast channels.
#[derive(Clone, Default)]
pub struct ProgressBroadcaster {
    channels: Arc<Mutex<HashMap<i64, broadcast::Sender<ProgressEvent>>>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a scan's progress stream.
    pub async fn subscribe(&self, scan_id: i64) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(scan_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to a scan's subscribers; a no-op without any.
    pub async fn publish(&self, scan_id: i64, event: ProgressEvent) {
        let mut channels = self.channels.lock().await;
        let stale = match channels.get(&scan_id) {
            None => return,
            // Last subscriber went away; drop the channel below.
            Some(sender) if sender.receiver_count() == 0 => true,
            Some(sender) => {
                if let Ok(delivered) = sender.send(event) {
                    debug!(scan_id, subscribers = delivered, "progress event broadcast");
                }
                false
            }
        };
        if stale {
            channels.remove(&scan_id);
        }
    }

    /// Drop a scan's channel once the scan reaches a terminal state.
    pub async fn remove(&self, scan_id: i64) {
        self.channels.lock().await.remove(&scan_id);
    }

    pub async fn subscriber_count(&self, scan_id: i64) -> usize {
        self.channels
            .lock()
            .await
            .get(&scan_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_result(scan_id: i64, url: &str) -> ProgressEvent {
        ProgressEvent::PageResult {
            scan_id,
            page_url: url.to_string(),
            has_bias: true,
            bias_details: None,
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.publish(1, page_result(1, "https://a")).await;
        assert_eq!(broadcaster.subscriber_count(1).await, 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let broadcaster = ProgressBroadcaster::new();
        let mut rx = broadcaster.subscribe(1).await;

        broadcaster.publish(1, page_result(1, "https://first")).await;
        broadcaster.publish(1, page_result(1, "https://second")).await;

        match rx.recv().await.unwrap() {
            ProgressEvent::PageResult { page_url, .. } => assert_eq!(page_url, "https://first"),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ProgressEvent::PageResult { page_url, .. } => assert_eq!(page_url, "https://second"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scans_are_isolated() {
        let broadcaster = ProgressBroadcaster::new();
        let mut rx1 = broadcaster.subscribe(1).await;
        let _rx2 = broadcaster.subscribe(2).await;

        broadcaster.publish(2, page_result(2, "https://other")).await;
        broadcaster.publish(1, page_result(1, "https://mine")).await;

        match rx1.recv().await.unwrap() {
            ProgressEvent::PageResult { scan_id, .. } => assert_eq!(scan_id, 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ProgressEvent::PhaseStart {
            scan_id: 9,
            phase: "discovery".into(),
            details: None,
            scan_status: Some("in_progress".into()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "phase_start");
        assert_eq!(value["phase"], "discovery");
    }
}
