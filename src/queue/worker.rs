//! The queue worker: the single task that turns queued items into audio.
//!
//! For each item it inserts the inter-item spacing, brackets the speech
//! with the caller's tone, and renders clauses through a depth-bounded
//! producer/consumer pipeline so synthesis of the next clause overlaps
//! playback of the current one. Synthesis failures end the item with an
//! error annotation; a dead sink fails the item and everything pending.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{ClauseResolution, ItemStatus, PlaybackQueue};
use crate::audio::{self, tones};
use crate::config::PIPELINE_DEPTH;
use crate::error::DaemonError;
use crate::synth::{Resolution, Synthesizer};
use crate::writer::{SkipFlag, StreamWriter};

/// What plays between the previous item and this one.
#[derive(Debug, Clone, Copy)]
pub enum Spacing {
    /// First item of a batch: nothing.
    None,
    /// Same (or no) caller as the previous item: short chime.
    Separator,
    /// Caller changed: one second of silence before the lead-in tone.
    CallerGap,
}

/// Everything the worker needs to render one item, snapshotted out of the
/// queue so no lock is held during synthesis or playback.
#[derive(Debug, Clone)]
pub struct PlayPlan {
    pub id: u64,
    pub text: String,
    pub clauses: Vec<String>,
    pub voice: String,
    pub gain: f32,
    pub speed: f64,
    pub caller: Option<String>,
    pub spacing: Spacing,
}

impl PlayPlan {
    pub(super) fn from_item(item: &super::QueueItem, spacing: Spacing) -> Self {
        Self {
            id: item.id,
            text: item.text.clone(),
            clauses: item.clauses.iter().map(|c| c.text.clone()).collect(),
            voice: item.resolved_voice.clone(),
            gain: item.gain,
            speed: item.speed,
            caller: item.caller.clone(),
            spacing,
        }
    }
}

struct RenderedClause {
    index: usize,
    pcm: Vec<u8>,
    resolution: Resolution,
    synth_ms: f64,
}

/// Run the worker until the daemon shuts down. There is exactly one of
/// these per daemon; that is what serializes playback.
pub async fn run(
    queue: Arc<PlaybackQueue>,
    synth: Arc<Synthesizer>,
    profiles: Arc<tones::CallerProfiles>,
    mut writer: StreamWriter,
    on_activity: Box<dyn Fn() + Send + Sync>,
) {
    loop {
        while !queue.has_pending() {
            queue.notify.notified().await;
        }
        let Some(plan) = queue.take_next(&profiles) else {
            continue;
        };
        on_activity();
        queue.publish("playing");
        info!(
            id = plan.id,
            caller = plan.caller.as_deref().unwrap_or("-"),
            voice = %plan.voice,
            clauses = plan.clauses.len(),
            "Playing \"{}\"",
            truncate_log(&plan.text),
        );

        let skip = queue.skip_flag();
        let result = play_item(&queue, &synth, &mut writer, &plan, &skip).await;

        if skip.load(Ordering::SeqCst) {
            // Discard whatever the sink had buffered; it respawns lazily.
            writer.abort().await;
        }

        if let Err(DaemonError::SinkUnavailable(reason)) = &result {
            error!(id = plan.id, "Audio sink unavailable: {}", reason);
            queue.annotate_error(reason);
            let dropped = queue.fail_pending(reason);
            if dropped > 0 {
                warn!(dropped, "Failed pending items after sink loss");
            }
            writer.reset_pacing();
        }

        let (status, drained) = queue.finish_current();
        on_activity();
        let event = match status {
            ItemStatus::Skipped => "item_skipped",
            _ => "item_done",
        };
        if drained {
            writer.close().await;
            queue.publish("idle");
            debug!("Queue drained, sink closed");
        } else {
            queue.publish(event);
        }
    }
}

/// Render one item end to end. Only a sink failure is an `Err`; synthesis
/// failures are absorbed into the item's error annotation so the queue
/// keeps moving.
async fn play_item(
    queue: &PlaybackQueue,
    synth: &Arc<Synthesizer>,
    writer: &mut StreamWriter,
    plan: &PlayPlan,
    skip: &SkipFlag,
) -> Result<(), DaemonError> {
    match plan.spacing {
        Spacing::None => {}
        Spacing::Separator => {
            writer.deliver(&tones::separator_tone(), 1.0, 0.0, skip).await?;
        }
        Spacing::CallerGap => {
            writer.deliver(&tones::caller_gap(), 1.0, 0.0, skip).await?;
        }
    }
    if let Some(caller) = &plan.caller {
        writer.deliver(&tones::caller_tone(caller), 1.0, 0.0, skip).await?;
    }

    // Producer: resolve clauses ahead of playback, at most PIPELINE_DEPTH
    // in flight. A word-tier assembly schedules its background upgrade
    // here, as soon as the resolution is known.
    let (tx, mut rx) = mpsc::channel::<Result<RenderedClause, DaemonError>>(PIPELINE_DEPTH);
    let producer = tokio::spawn({
        let synth = Arc::clone(synth);
        let clauses = plan.clauses.clone();
        let voice = plan.voice.clone();
        let speed = plan.speed;
        let skip = Arc::clone(skip);
        async move {
            for (index, clause) in clauses.into_iter().enumerate() {
                if skip.load(Ordering::SeqCst) {
                    break;
                }
                let t0 = Instant::now();
                let message = match synth.synthesize_clause(&clause, &voice, speed).await {
                    Ok((pcm, resolution)) => {
                        if resolution == Resolution::WordCache {
                            synth.spawn_upgrade(clause, voice.clone(), speed);
                        }
                        Ok(RenderedClause {
                            index,
                            pcm,
                            resolution,
                            synth_ms: t0.elapsed().as_secs_f64() * 1000.0,
                        })
                    }
                    Err(e) => Err(e),
                };
                let failed = message.is_err();
                if tx.send(message).await.is_err() || failed {
                    break;
                }
            }
        }
    });

    let total = plan.clauses.len();
    let mut outcome = Ok(());
    while let Some(message) = rx.recv().await {
        if skip.load(Ordering::SeqCst) {
            break;
        }
        let rendered = match message {
            Ok(r) => r,
            Err(e) => {
                warn!(id = plan.id, "Synthesis failed: {}", e);
                queue.annotate_error(&e.to_string());
                break;
            }
        };
        queue.set_clause_resolution(rendered.index, ClauseResolution::from(rendered.resolution));

        let pcm = audio::apply_gain(&rendered.pcm, plan.gain);
        match writer.deliver(&pcm, plan.speed, rendered.synth_ms, skip).await {
            Ok(t) => info!(
                "  [{}] {}/{} {} synth={:.0}ms wait={:.0}ms write={:.0}ms audio={:.2}s x{}",
                plan.id,
                rendered.index + 1,
                total,
                rendered.resolution.tag(),
                t.synth_ms,
                t.wait_ms,
                t.write_ms,
                t.audio_sec,
                t.speed,
            ),
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }
    drop(rx);
    producer.abort();
    let _ = producer.await;

    // Closing tone brackets the item, skipped or failed items go silent.
    if outcome.is_ok() && !skip.load(Ordering::SeqCst) {
        if let Some(caller) = &plan.caller {
            writer.deliver(&tones::caller_tone(caller), 1.0, 0.0, skip).await?;
        }
    }
    outcome
}

fn truncate_log(text: &str) -> String {
    if text.chars().count() <= 60 {
        text.to_string()
    } else {
        let head: String = text.chars().take(60).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    use crate::cache::CacheKey;
    use crate::protocol::SpeakRequest;
    use crate::state::StatePublisher;
    use crate::synth::tests::{test_cache, FakeEngine};
    use crate::writer::tests::FakeSink;
    use crate::writer::PcmSink;

    fn queue_in(dir: &tempfile::TempDir) -> Arc<PlaybackQueue> {
        PlaybackQueue::new(StatePublisher::new(dir.path().join("state.json")))
    }

    fn spawn_worker(
        queue: &Arc<PlaybackQueue>,
        synth: Arc<Synthesizer>,
        sink: Box<dyn PcmSink>,
        activity: Arc<AtomicU64>,
    ) {
        tokio::spawn(run(
            Arc::clone(queue),
            synth,
            Arc::new(tones::CallerProfiles::default()),
            StreamWriter::new(sink),
            Box::new(move || {
                activity.fetch_add(1, Ordering::Relaxed);
            }),
        ));
    }

    fn req(text: &str, caller: Option<&str>) -> SpeakRequest {
        SpeakRequest {
            text: text.to_string(),
            voice: "af_heart".to_string(),
            speed: 1.0,
            lang: "en-us".to_string(),
            caller: caller.map(str::to_string),
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn pcm(n: usize) -> Vec<u8> {
        vec![0x11; n]
    }

    #[tokio::test]
    async fn items_play_in_order_and_land_in_history() {
        let dir = tempfile::tempdir().unwrap();
        let (_cache_dir, cache) = test_cache();
        let queue = queue_in(&dir);
        let synth = Arc::new(Synthesizer::new(
            Box::new(FakeEngine::ok(pcm(4_800))),
            None,
            cache,
        ));
        let sink = FakeSink::instant();
        let writes = Arc::clone(&sink.writes);
        let activity = Arc::new(AtomicU64::new(0));
        spawn_worker(&queue, synth, Box::new(sink), Arc::clone(&activity));

        queue.enqueue(&req("first item", Some("ops")));
        queue.enqueue(&req("second item", Some("ops")));
        wait_for(|| queue.stats().total_completed == 2).await;
        wait_for(|| queue.is_idle()).await;

        assert_eq!(
            queue.history(10),
            vec!["first item".to_string(), "second item".to_string()]
        );
        assert!(!writes.lock().unwrap().is_empty());
        assert!(activity.load(Ordering::Relaxed) >= 4);
    }

    #[tokio::test]
    async fn skip_aborts_the_sink_and_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        let (_cache_dir, cache) = test_cache();
        let queue = queue_in(&dir);
        // 4 s of audio so the item is mid-flight when the skip arrives.
        let synth = Arc::new(Synthesizer::new(
            Box::new(FakeEngine::ok(pcm(24_000 * 2 * 4))),
            None,
            cache,
        ));
        let sink = FakeSink::with_latency(Duration::from_millis(100));
        let aborted = Arc::clone(&sink.aborted);
        let activity = Arc::new(AtomicU64::new(0));
        spawn_worker(&queue, synth, Box::new(sink), activity);

        queue.enqueue(&req("a very long speech", None));
        wait_for(|| queue.status().playing.is_some()).await;
        assert!(queue.skip().is_some());
        wait_for(|| queue.is_idle()).await;

        assert!(aborted.load(Ordering::SeqCst));
        let stats = queue.stats();
        assert_eq!(stats.total_skipped, 1);
        assert_eq!(stats.total_completed, 0);
        assert!(queue.history(10).is_empty());
    }

    #[tokio::test]
    async fn synthesis_failure_annotates_and_moves_on() {
        let dir = tempfile::tempdir().unwrap();
        let (_cache_dir, cache) = test_cache();
        // The engine always fails; the second item is pre-cached so it
        // still plays, proving the worker survived the first failure.
        cache.put(&CacheKey::clause("already cached", "af_heart", 1.0), pcm(2_400));
        let queue = queue_in(&dir);
        let synth = Arc::new(Synthesizer::new(
            Box::new(FakeEngine::failing()),
            None,
            cache,
        ));
        let sink = FakeSink::instant();
        let writes = Arc::clone(&sink.writes);
        let activity = Arc::new(AtomicU64::new(0));
        spawn_worker(&queue, synth, Box::new(sink), activity);

        queue.enqueue(&req("doomed item", None));
        queue.enqueue(&req("already cached", None));
        wait_for(|| queue.is_idle()).await;

        // Only the cached item made it into history.
        assert_eq!(queue.history(10), vec!["already cached".to_string()]);
        assert!(!writes.lock().unwrap().is_empty());
    }

    struct FailSink;

    impl PcmSink for FailSink {
        fn write<'a>(
            &'a mut self,
            _chunk: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = Result<tokio::time::Duration, DaemonError>> + Send + 'a>>
        {
            Box::pin(async { Err(DaemonError::SinkUnavailable("player gone".into())) })
        }

        fn abort(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async {})
        }

        fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn sink_death_fails_current_and_pending_fast() {
        let dir = tempfile::tempdir().unwrap();
        let (_cache_dir, cache) = test_cache();
        let queue = queue_in(&dir);
        let synth = Arc::new(Synthesizer::new(
            Box::new(FakeEngine::ok(pcm(4_800))),
            None,
            cache,
        ));
        let activity = Arc::new(AtomicU64::new(0));
        spawn_worker(&queue, synth, Box::new(FailSink), activity);

        queue.enqueue(&req("one", None));
        queue.enqueue(&req("two", None));
        queue.enqueue(&req("three", None));
        wait_for(|| queue.is_idle()).await;

        // Nothing hung waiting on a dead player; nothing succeeded either.
        assert!(queue.history(10).is_empty());
    }

    #[tokio::test]
    async fn caller_tone_brackets_the_speech() {
        let dir = tempfile::tempdir().unwrap();
        let (_cache_dir, cache) = test_cache();
        let queue = queue_in(&dir);
        // Exactly one chunk of speech audio.
        let speech_len = crate::config::WRITE_CHUNK_BYTES;
        let synth = Arc::new(Synthesizer::new(
            Box::new(FakeEngine::ok(pcm(speech_len))),
            None,
            cache,
        ));
        let sink = FakeSink::instant();
        let writes = Arc::clone(&sink.writes);
        let activity = Arc::new(AtomicU64::new(0));
        spawn_worker(&queue, synth, Box::new(sink), activity);

        queue.enqueue(&req("hello", Some("ops")));
        wait_for(|| queue.is_idle()).await;

        let tone_len = tones::caller_tone("ops").len();
        let written: usize = writes.lock().unwrap().iter().sum();
        // Lead-in tone + one chunk of speech + closing tone.
        assert_eq!(written, 2 * tone_len + speech_len);
    }
}
