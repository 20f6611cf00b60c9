//! Playback queue: an ordered FIFO of speech items with a single worker.
//!
//! Items move `pending -> playing -> {done, skipped}`. Every mutation —
//! the worker's own transitions and control operations arriving on other
//! connections — goes through one mutex, held only for the data change
//! itself, never across synthesis or sink I/O. The single worker loop
//! (see [`worker`]) is what guarantees at most one `playing` item and
//! FIFO play order without cross-item locking in the writer.

pub mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::audio::tones::CallerProfiles;
use crate::error::DaemonError;
use crate::protocol::SpeakRequest;
use crate::state::{ItemView, StatePublisher};
use crate::text;
use crate::writer::SkipFlag;

const HISTORY_CAP: usize = 100;

/// Overall item state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Playing,
    Done,
    Skipped,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Playing => write!(f, "playing"),
            Self::Done => write!(f, "done"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// How each clause of an item was (or will be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseResolution {
    Pending,
    ClauseCache,
    WordCache,
    Synthesized,
}

impl From<crate::synth::Resolution> for ClauseResolution {
    fn from(r: crate::synth::Resolution) -> Self {
        match r {
            crate::synth::Resolution::ClauseCache => Self::ClauseCache,
            crate::synth::Resolution::WordCache => Self::WordCache,
            crate::synth::Resolution::Synthesized => Self::Synthesized,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Clause {
    pub text: String,
    pub resolution: ClauseResolution,
}

/// One queued speech request. Exclusively owned by the queue for its
/// whole life.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: u64,
    pub caller: Option<String>,
    pub voice: String,
    /// Voice after caller-profile resolution, filled at play start.
    pub resolved_voice: String,
    pub gain: f32,
    pub speed: f64,
    pub text: String,
    pub clauses: Vec<Clause>,
    pub status: ItemStatus,
    pub error: Option<String>,
}

impl QueueItem {
    fn new(id: u64, req: &SpeakRequest) -> Self {
        let clauses = text::split_clauses(&req.text)
            .into_iter()
            .map(|text| Clause {
                text,
                resolution: ClauseResolution::Pending,
            })
            .collect();
        Self {
            id,
            caller: req.caller.clone(),
            voice: req.voice.clone(),
            resolved_voice: req.voice.clone(),
            gain: 1.0,
            speed: req.speed,
            text: req.text.clone(),
            clauses,
            status: ItemStatus::Pending,
            error: None,
        }
    }

    fn view(&self) -> ItemView {
        ItemView {
            id: self.id,
            caller: self.caller.clone().unwrap_or_default(),
            voice: self.resolved_voice.clone(),
            text: truncate(&self.text, 120),
        }
    }

    fn snapshot(&self) -> ItemSnapshot {
        ItemSnapshot {
            id: self.id,
            caller: self.caller.clone().unwrap_or_default(),
            voice: self.resolved_voice.clone(),
            text: truncate(&self.text, 80),
            status: self.status.to_string(),
            error: self.error.clone(),
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Point-in-time view answered to `queue_status`.
#[derive(Debug, Clone, Serialize)]
pub struct ItemSnapshot {
    pub id: u64,
    pub caller: String,
    pub voice: String,
    pub text: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub playing: Option<ItemSnapshot>,
    pub pending: Vec<ItemSnapshot>,
}

/// Cumulative counters for the `stats` command.
#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_skipped: u64,
    pub pending: usize,
    pub playing: Option<String>,
    pub uptime_secs: u64,
}

/// Seed for `replay`: what it takes to re-enqueue the last completed item.
#[derive(Debug, Clone)]
struct ReplaySeed {
    text: String,
    voice: String,
    speed: f64,
    caller: Option<String>,
}

#[derive(Default)]
struct Inner {
    pending: VecDeque<QueueItem>,
    current: Option<QueueItem>,
    next_id: u64,
    last_completed: Option<ReplaySeed>,
    last_caller: Option<String>,
    /// Items played since the queue last drained; spacing tones only go
    /// between items of the same batch.
    batch_items: u64,
    history: VecDeque<String>,
    /// Sequence assigned to each state event under this lock, so the
    /// publisher can order snapshots built by concurrent callers.
    event_seq: u64,
}

pub struct PlaybackQueue {
    inner: Mutex<Inner>,
    notify: tokio::sync::Notify,
    skip: SkipFlag,
    publisher: StatePublisher,
    started_at: Instant,
    total_enqueued: AtomicU64,
    total_completed: AtomicU64,
    total_skipped: AtomicU64,
}

impl PlaybackQueue {
    pub fn new(publisher: StatePublisher) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            notify: tokio::sync::Notify::new(),
            skip: Arc::new(AtomicBool::new(false)),
            publisher,
            started_at: Instant::now(),
            total_enqueued: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            total_skipped: AtomicU64::new(0),
        })
    }

    /// Append an item. Returns its 1-based position counting everything
    /// ahead of it, including a currently playing item.
    pub fn enqueue(&self, req: &SpeakRequest) -> u64 {
        let position = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let item = QueueItem::new(inner.next_id, req);
            inner.pending.push_back(item);
            inner.pending.len() as u64 + u64::from(inner.current.is_some())
        };
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        self.publish("enqueued");
        position
    }

    /// Skip the currently playing item at the next clause/chunk boundary.
    /// Returns the skipped item's text, or `None` when nothing plays.
    pub fn skip(&self) -> Option<String> {
        let skipped = {
            let mut inner = self.inner.lock().unwrap();
            let current = inner.current.as_mut()?;
            current.status = ItemStatus::Skipped;
            Some(truncate(&current.text, 80))
        };
        self.skip.store(true, Ordering::SeqCst);
        self.total_skipped.fetch_add(1, Ordering::Relaxed);
        self.publish("skipped");
        skipped
    }

    /// Remove every pending item, leaving the playing one untouched.
    /// Idempotent; returns the number removed.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let n = inner.pending.len();
            inner.pending.clear();
            n
        };
        self.publish("cleared");
        removed
    }

    /// Re-enqueue a copy of the most recently completed item so it plays
    /// next, behind the current item if one is playing.
    pub fn replay(&self) -> Result<(u64, String), DaemonError> {
        let (position, text) = {
            let mut inner = self.inner.lock().unwrap();
            let seed = inner.last_completed.clone().ok_or(DaemonError::NoPriorItem)?;
            inner.next_id += 1;
            let req = SpeakRequest {
                text: seed.text.clone(),
                voice: seed.voice,
                speed: seed.speed,
                lang: String::new(),
                caller: seed.caller,
            };
            let item = QueueItem::new(inner.next_id, &req);
            inner.pending.push_front(item);
            (
                1 + u64::from(inner.current.is_some()),
                truncate(&seed.text, 80),
            )
        };
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        self.publish("enqueued");
        Ok((position, text))
    }

    pub fn status(&self) -> QueueSnapshot {
        let inner = self.inner.lock().unwrap();
        QueueSnapshot {
            playing: inner.current.as_ref().map(QueueItem::snapshot),
            pending: inner.pending.iter().map(QueueItem::snapshot).collect(),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        QueueStats {
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_completed: self.total_completed.load(Ordering::Relaxed),
            total_skipped: self.total_skipped.load(Ordering::Relaxed),
            pending: inner.pending.len(),
            playing: inner.current.as_ref().map(|c| truncate(&c.text, 80)),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Last `n` spoken texts, oldest first. In-memory, this daemon
    /// lifetime only.
    pub fn history(&self, n: usize) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.history.iter().rev().take(n).rev().cloned().collect()
    }

    /// True when nothing is playing and nothing is pending — the idle
    /// signal the lifecycle watchdog queries.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.current.is_none() && inner.pending.is_empty()
    }

    // --- worker-side helpers ---

    fn has_pending(&self) -> bool {
        !self.inner.lock().unwrap().pending.is_empty()
    }

    /// Pull the head item into `playing` and plan its rendering. Resolves
    /// the caller profile and decides inter-item spacing. `None` when the
    /// queue is empty.
    fn take_next(&self, profiles: &CallerProfiles) -> Option<worker::PlayPlan> {
        let mut inner = self.inner.lock().unwrap();
        let mut item = inner.pending.pop_front()?;
        item.status = ItemStatus::Playing;
        let (voice, gain) = match &item.caller {
            Some(caller) => profiles.resolve(caller, &item.voice),
            None => (item.voice.clone(), 1.0),
        };
        item.resolved_voice = voice;
        item.gain = gain;

        let spacing = if inner.batch_items == 0 {
            worker::Spacing::None
        } else {
            match (&item.caller, &inner.last_caller) {
                (Some(caller), Some(last)) if caller != last => worker::Spacing::CallerGap,
                _ => worker::Spacing::Separator,
            }
        };

        self.skip.store(false, Ordering::SeqCst);
        let plan = worker::PlayPlan::from_item(&item, spacing);
        inner.current = Some(item);
        Some(plan)
    }

    fn set_clause_resolution(&self, index: usize, resolution: ClauseResolution) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(current) = inner.current.as_mut() {
            if let Some(clause) = current.clauses.get_mut(index) {
                clause.resolution = resolution;
            }
        }
    }

    fn annotate_error(&self, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(current) = inner.current.as_mut() {
            current.error = Some(message.to_string());
        }
    }

    /// Retire the current item. Returns `(status, queue_drained)`.
    fn finish_current(&self) -> (ItemStatus, bool) {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut item) = inner.current.take() else {
            return (ItemStatus::Done, inner.pending.is_empty());
        };
        if item.status == ItemStatus::Playing {
            item.status = ItemStatus::Done;
        }
        // Error-annotated items never feed replay, history, or the
        // completed counter.
        if item.status == ItemStatus::Done && item.error.is_none() {
            self.total_completed.fetch_add(1, Ordering::Relaxed);
            inner.last_completed = Some(ReplaySeed {
                text: item.text.clone(),
                voice: item.voice.clone(),
                speed: item.speed,
                caller: item.caller.clone(),
            });
            inner.history.push_back(item.text.clone());
            while inner.history.len() > HISTORY_CAP {
                inner.history.pop_front();
            }
        }
        inner.last_caller = item.caller.clone();
        inner.batch_items += 1;
        let drained = inner.pending.is_empty();
        if drained {
            inner.batch_items = 0;
        }
        (item.status, drained)
    }

    /// Sink death: fail every pending item fast instead of hanging.
    fn fail_pending(&self, reason: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.pending.len();
        for item in inner.pending.drain(..) {
            tracing::warn!(id = item.id, "Dropping pending item, sink unavailable: {}", reason);
        }
        n
    }

    fn skip_flag(&self) -> SkipFlag {
        Arc::clone(&self.skip)
    }

    /// Emit a state event reflecting the queue right now. The snapshot
    /// and its sequence are taken under the lock; file I/O happens after
    /// it is released, and the publisher drops any snapshot a newer
    /// sequence has already superseded.
    fn publish(&self, event: &str) {
        let (seq, playing, queue) = {
            let mut inner = self.inner.lock().unwrap();
            inner.event_seq += 1;
            (
                inner.event_seq,
                inner.current.as_ref().map(QueueItem::view),
                inner
                    .pending
                    .iter()
                    .map(QueueItem::view)
                    .collect::<Vec<_>>(),
            )
        };
        self.publisher.publish(seq, event, &playing, &queue);
    }
}
