//! Broadcast subscribers: live audio and state-event streaming.
//!
//! A client that sends the `subscribe` command keeps its connection open
//! and receives a copy of every PCM chunk written to the sink, plus state
//! events unless it opted out. Each subscriber gets a bounded queue
//! drained by its own connection task, so a slow client drops frames
//! instead of ever blocking playback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

/// Broadcast frame kinds, the first payload byte on the wire.
pub const FRAME_AUDIO: u8 = 1;
pub const FRAME_METADATA: u8 = 2;

/// Frames a lagging subscriber may buffer before new ones are dropped.
const QUEUE_DEPTH: usize = 64;

/// One broadcast frame. The payload is shared, not copied per subscriber.
#[derive(Clone)]
pub struct Frame {
    pub kind: u8,
    pub payload: Arc<[u8]>,
}

struct Subscriber {
    tx: mpsc::Sender<Frame>,
    include_metadata: bool,
    connected_at: Instant,
    bytes_sent: Arc<AtomicU64>,
    dropped_frames: Arc<AtomicU64>,
}

/// The receiving end handed to the subscriber's connection task.
pub struct SubscriberFeed {
    pub id: u64,
    pub rx: mpsc::Receiver<Frame>,
    /// Bumped by the connection task as frames go out, so `status`
    /// reports real delivery, not enqueue counts.
    pub bytes_sent: Arc<AtomicU64>,
}

#[derive(Debug, Serialize)]
pub struct SubscriberDetail {
    pub connected_secs: u64,
    pub bytes_sent: u64,
    pub dropped_frames: u64,
    pub include_metadata: bool,
}

#[derive(Debug, Serialize)]
pub struct SubscriberStatus {
    pub subscribers: usize,
    pub details: Vec<SubscriberDetail>,
}

/// Registry of live subscribers with non-blocking fan-out.
#[derive(Default)]
pub struct SubscriberManager {
    inner: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl SubscriberManager {
    pub fn add(&self, include_metadata: bool) -> SubscriberFeed {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let bytes_sent = Arc::new(AtomicU64::new(0));
        let subscriber = Subscriber {
            tx,
            include_metadata,
            connected_at: Instant::now(),
            bytes_sent: Arc::clone(&bytes_sent),
            dropped_frames: Arc::new(AtomicU64::new(0)),
        };
        let total = {
            let mut inner = self.inner.lock().unwrap();
            inner.insert(id, subscriber);
            inner.len()
        };
        info!(total, "Subscriber added");
        SubscriberFeed { id, rx, bytes_sent }
    }

    pub fn remove(&self, id: u64) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            inner.remove(&id).map(|s| (inner.len(), s))
        };
        if let Some((total, subscriber)) = removed {
            info!(
                total,
                sent = subscriber.bytes_sent.load(Ordering::Relaxed),
                dropped = subscriber.dropped_frames.load(Ordering::Relaxed),
                "Subscriber removed"
            );
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Fan a PCM chunk out to every subscriber. Never blocks.
    pub fn broadcast_audio(&self, pcm: &[u8]) {
        self.broadcast(FRAME_AUDIO, pcm, false);
    }

    /// Fan a state event out to subscribers that asked for metadata.
    pub fn broadcast_event(&self, payload: &[u8]) {
        self.broadcast(FRAME_METADATA, payload, true);
    }

    fn broadcast(&self, kind: u8, payload: &[u8], metadata_only: bool) {
        let inner = self.inner.lock().unwrap();
        if inner.is_empty() {
            return;
        }
        let payload: Arc<[u8]> = Arc::from(payload);
        for subscriber in inner.values() {
            if metadata_only && !subscriber.include_metadata {
                continue;
            }
            let frame = Frame {
                kind,
                payload: Arc::clone(&payload),
            };
            // Full queue means the client is lagging; the frame is
            // dropped and counted rather than stalling the broadcaster.
            if subscriber.tx.try_send(frame).is_err() {
                subscriber.dropped_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop every subscriber's sender; their feeds end and the
    /// connection tasks write the terminator on the way out.
    pub fn close_all(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn status(&self) -> SubscriberStatus {
        let inner = self.inner.lock().unwrap();
        SubscriberStatus {
            subscribers: inner.len(),
            details: inner
                .values()
                .map(|s| SubscriberDetail {
                    connected_secs: s.connected_at.elapsed().as_secs(),
                    bytes_sent: s.bytes_sent.load(Ordering::Relaxed),
                    dropped_frames: s.dropped_frames.load(Ordering::Relaxed),
                    include_metadata: s.include_metadata,
                })
                .collect(),
        }
    }
}
