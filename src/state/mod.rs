//! State publisher: a JSON snapshot file for external observers.
//!
//! After every queue transition the full state is rewritten via
//! write-to-temp-then-rename, so a concurrent reader always sees one
//! consistent snapshot and never a partial write. Snapshots carry a
//! sequence number assigned at the transition; the publisher writes
//! them under its own lock and discards any snapshot older than what is
//! already on disk, so racing publishers can never persist events out
//! of order. Each persisted snapshot also fans out to broadcast
//! subscribers.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::debug;

use crate::subscribers::SubscriberManager;

/// Compact view of one queue item as it appears in the state file.
#[derive(Debug, Clone, Serialize)]
pub struct ItemView {
    pub id: u64,
    pub caller: String,
    pub voice: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
struct StateFile<'a> {
    seq: u64,
    event: &'a str,
    playing: &'a Option<ItemView>,
    pending: usize,
    queue: &'a [ItemView],
    timestamp: f64,
}

/// Writes queue snapshots to a well-known path.
pub struct StatePublisher {
    path: PathBuf,
    /// Highest sequence persisted so far. Held across the write and
    /// rename so publishers serialize without touching the queue lock.
    last_written: Mutex<u64>,
    subscribers: Arc<SubscriberManager>,
}

impl StatePublisher {
    pub fn new(path: PathBuf) -> Self {
        Self::with_subscribers(path, Arc::new(SubscriberManager::default()))
    }

    pub fn with_subscribers(path: PathBuf, subscribers: Arc<SubscriberManager>) -> Self {
        Self {
            path,
            last_written: Mutex::new(0),
            subscribers,
        }
    }

    /// Atomically rewrite the state file with snapshot `seq`, assigned by
    /// the queue at the transition. A snapshot older than the one already
    /// persisted is dropped whole. Publishing is best-effort: a failed
    /// write is logged and dropped, never surfaced to playback.
    pub fn publish(&self, seq: u64, event: &str, playing: &Option<ItemView>, queue: &[ItemView]) {
        let state = StateFile {
            seq,
            event,
            playing,
            pending: queue.len(),
            queue,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        let Ok(json) = serde_json::to_vec(&state) else {
            return;
        };

        let mut last = self.last_written.lock().unwrap();
        if seq <= *last {
            return;
        }
        *last = seq;
        self.subscribers.broadcast_event(&json);
        let tmp = self.path.with_extension("tmp");
        let result = std::fs::write(&tmp, &json).and_then(|()| std::fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            debug!("State publish failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: u64, text: &str) -> ItemView {
        ItemView {
            id,
            caller: "ops".to_string(),
            voice: "af_heart".to_string(),
            text: text.to_string(),
        }
    }

    fn read_state(path: &std::path::Path) -> serde_json::Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn publishes_full_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speakd.state.json");
        let publisher = StatePublisher::new(path.clone());

        publisher.publish(1, "playing", &Some(item(1, "now")), &[item(2, "next")]);

        let value = read_state(&path);
        assert_eq!(value["event"], "playing");
        assert_eq!(value["seq"], 1);
        assert_eq!(value["playing"]["id"], 1);
        assert_eq!(value["pending"], 1);
        assert_eq!(value["queue"][0]["text"], "next");
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
        // No temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn idle_snapshot_has_null_playing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speakd.state.json");
        let publisher = StatePublisher::new(path.clone());

        publisher.publish(1, "idle", &None, &[]);

        let value = read_state(&path);
        assert!(value["playing"].is_null());
        assert_eq!(value["pending"], 0);
    }

    #[test]
    fn each_publish_overwrites_the_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speakd.state.json");
        let publisher = StatePublisher::new(path.clone());

        publisher.publish(1, "enqueued", &None, &[item(1, "a")]);
        publisher.publish(2, "idle", &None, &[]);

        let value = read_state(&path);
        assert_eq!(value["event"], "idle");
        assert_eq!(value["queue"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn stale_snapshot_never_overwrites_a_newer_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speakd.state.json");
        let publisher = StatePublisher::new(path.clone());

        // A publisher that built its snapshot first can lose the race
        // and write last; the older sequence must be discarded.
        publisher.publish(2, "playing", &Some(item(7, "current")), &[]);
        publisher.publish(1, "enqueued", &None, &[item(7, "current")]);

        let value = read_state(&path);
        assert_eq!(value["seq"], 2);
        assert_eq!(value["event"], "playing");
        assert_eq!(value["playing"]["id"], 7);
    }

    #[tokio::test]
    async fn snapshots_are_broadcast_in_order_without_stale_events() {
        let dir = tempfile::tempdir().unwrap();
        let subscribers = Arc::new(SubscriberManager::default());
        let publisher = StatePublisher::with_subscribers(
            dir.path().join("state.json"),
            Arc::clone(&subscribers),
        );
        let mut feed = subscribers.add(true);

        publisher.publish(1, "enqueued", &None, &[item(1, "a")]);
        publisher.publish(3, "playing", &Some(item(1, "a")), &[]);
        // Superseded by seq 3; must not reach subscribers either.
        publisher.publish(2, "enqueued", &None, &[item(1, "a")]);

        let first: serde_json::Value =
            serde_json::from_slice(&feed.rx.recv().await.unwrap().payload).unwrap();
        assert_eq!(first["seq"], 1);
        let second: serde_json::Value =
            serde_json::from_slice(&feed.rx.recv().await.unwrap().payload).unwrap();
        assert_eq!(second["seq"], 3);
        assert!(feed.rx.try_recv().is_err());
    }
}
