//! Streaming writer: paced, chunked PCM delivery into the audio sink.
//!
//! The sink is a capability: something that accepts raw PCM and plays it,
//! exposing backpressure through write blocking. `ProcessSink` implements
//! it over a persistent player process fed on stdin. Writes go out in
//! 0.25 s chunks so a skip takes effect between chunks, and the writer
//! paces itself off the surplus of audio-seconds written over wall-clock
//! elapsed, so clauses never pile up in the sink's buffer faster than it
//! plays them.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::audio::pcm_duration_secs;
use crate::config::{SAMPLE_RATE, WRITE_CHUNK_BYTES};
use crate::error::DaemonError;
use crate::subscribers::SubscriberManager;

/// Cooperative cancellation for the clause currently being written.
/// Checked at chunk boundaries, never mid-sample.
pub type SkipFlag = Arc<AtomicBool>;

/// The downstream playback capability.
pub trait PcmSink: Send {
    /// Write one chunk, returning the observed write latency. A slow
    /// write means the sink's buffer was nearly full — backpressure.
    fn write<'a>(
        &'a mut self,
        chunk: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Duration, DaemonError>> + Send + 'a>>;

    /// Discard any buffered-but-unplayed audio immediately (skip path).
    fn abort(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Let buffered audio drain, then shut down.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

// ---------------------------------------------------------------------------
// ProcessSink
// ---------------------------------------------------------------------------

/// Sink backed by a persistent player subprocess (ffplay by default)
/// reading s16le mono PCM on stdin. Spawned lazily on first write and
/// respawned after an abort or a death.
pub struct ProcessSink {
    cmd: Vec<String>,
    proc: Option<(Child, ChildStdin)>,
}

impl ProcessSink {
    pub fn new(cmd: Vec<String>) -> Self {
        Self { cmd, proc: None }
    }

    async fn ensure_running(&mut self) -> Result<&mut ChildStdin, DaemonError> {
        if let Some((child, _)) = &mut self.proc {
            if child.try_wait().ok().flatten().is_some() {
                // Player exited on its own.
                self.proc = None;
            }
        }
        if self.proc.is_none() {
            let program = self
                .cmd
                .first()
                .ok_or_else(|| DaemonError::SinkUnavailable("empty player command".into()))?;
            let mut child = Command::new(program)
                .args(&self.cmd[1..])
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| DaemonError::SinkUnavailable(format!("{program}: {e}")))?;
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| DaemonError::SinkUnavailable("player has no stdin".into()))?;
            // Prime with 100 ms of silence so the player finishes format
            // probing before real audio arrives.
            let prime = vec![0u8; SAMPLE_RATE as usize * 2 / 10];
            stdin
                .write_all(&prime)
                .await
                .map_err(|e| DaemonError::SinkUnavailable(e.to_string()))?;
            debug!(player = %program, "Audio sink spawned");
            self.proc = Some((child, stdin));
        }
        Ok(&mut self.proc.as_mut().expect("just ensured").1)
    }
}

impl PcmSink for ProcessSink {
    fn write<'a>(
        &'a mut self,
        chunk: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Duration, DaemonError>> + Send + 'a>> {
        Box::pin(async move {
            let stdin = self.ensure_running().await?;
            let t0 = Instant::now();
            let result = stdin.write_all(chunk).await;
            match result {
                Ok(()) => Ok(t0.elapsed()),
                Err(e) => {
                    // Fail fast; lifecycle outside the daemon relaunches
                    // the player, the next write respawns it.
                    self.proc = None;
                    Err(DaemonError::SinkUnavailable(e.to_string()))
                }
            }
        })
    }

    fn abort(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Some((mut child, stdin)) = self.proc.take() {
                drop(stdin);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill audio sink: {}", e);
                }
            }
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Some((mut child, stdin)) = self.proc.take() {
                // Closing stdin lets the player drain its buffer and exit.
                drop(stdin);
                let _ = child.wait().await;
            }
        })
    }
}

// ---------------------------------------------------------------------------
// StreamWriter
// ---------------------------------------------------------------------------

/// Timing observed for one delivered clause; this is the observability
/// log's raw material.
#[derive(Debug, Clone, Copy)]
pub struct ClauseTiming {
    pub synth_ms: f64,
    pub write_ms: f64,
    pub audio_sec: f64,
    pub wait_ms: f64,
    pub speed: f64,
}

/// Paces clause-sized PCM buffers into the sink.
pub struct StreamWriter {
    sink: Box<dyn PcmSink>,
    /// Cumulative audio-seconds written since the sink's first write.
    audio_written: f64,
    stream_start: Option<Instant>,
    /// Every chunk the sink accepts is also fanned out here.
    subscribers: Arc<SubscriberManager>,
}

impl StreamWriter {
    pub fn new(sink: Box<dyn PcmSink>) -> Self {
        Self::with_broadcast(sink, Arc::new(SubscriberManager::default()))
    }

    pub fn with_broadcast(sink: Box<dyn PcmSink>, subscribers: Arc<SubscriberManager>) -> Self {
        Self {
            sink,
            audio_written: 0.0,
            stream_start: None,
            subscribers,
        }
    }

    /// Deliver one clause of PCM in bounded chunks.
    ///
    /// Before the first chunk, sleeps off any surplus of audio already
    /// written over wall-clock playback time, so the sink's buffer stays
    /// near real time and a skip never has seconds of stale audio to
    /// discard. Skip is honored at chunk boundaries. Slow writes are
    /// recorded, not acted on.
    pub async fn deliver(
        &mut self,
        pcm: &[u8],
        speed: f64,
        synth_ms: f64,
        skip: &SkipFlag,
    ) -> Result<ClauseTiming, DaemonError> {
        let wait_ms = self.pace().await;

        let mut write_ms = 0.0;
        let mut written = 0usize;
        for chunk in pcm.chunks(WRITE_CHUNK_BYTES) {
            if skip.load(Ordering::SeqCst) {
                break;
            }
            if self.stream_start.is_none() {
                self.stream_start = Some(Instant::now());
            }
            let latency = self.sink.write(chunk).await?;
            self.subscribers.broadcast_audio(chunk);
            write_ms += latency.as_secs_f64() * 1000.0;
            written += chunk.len();
        }

        let audio_sec = pcm_duration_secs(written);
        self.audio_written += audio_sec;
        Ok(ClauseTiming {
            synth_ms,
            write_ms,
            audio_sec,
            wait_ms,
            speed,
        })
    }

    /// Sleep off the sink's estimated buffer surplus. Returns the wait in
    /// milliseconds.
    async fn pace(&mut self) -> f64 {
        let Some(start) = self.stream_start else {
            return 0.0;
        };
        let surplus = self.audio_written - start.elapsed().as_secs_f64();
        if surplus <= 0.0 {
            return 0.0;
        }
        tokio::time::sleep(Duration::from_secs_f64(surplus)).await;
        surplus * 1000.0
    }

    /// Skip path: discard buffered audio and forget pacing state — the
    /// buffer estimate is meaningless once the sink dropped it.
    pub async fn abort(&mut self) {
        self.sink.abort().await;
        self.reset_pacing();
    }

    /// Drain and shut the sink down (queue went idle).
    pub async fn close(&mut self) {
        self.sink.close().await;
        self.reset_pacing();
    }

    /// Forget pacing state after a sink failure, so a later item starts
    /// from a clean estimate against the respawned player.
    pub fn reset_pacing(&mut self) {
        self.audio_written = 0.0;
        self.stream_start = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records writes and simulates a configurable per-write
    /// latency, standing in for a real player's backpressure.
    pub struct FakeSink {
        pub latency: Duration,
        pub writes: Arc<Mutex<Vec<usize>>>,
        pub aborted: Arc<AtomicBool>,
    }

    impl FakeSink {
        pub fn instant() -> Self {
            Self::with_latency(Duration::ZERO)
        }

        pub fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                writes: Arc::new(Mutex::new(Vec::new())),
                aborted: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl PcmSink for FakeSink {
        fn write<'a>(
            &'a mut self,
            chunk: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = Result<Duration, DaemonError>> + Send + 'a>> {
            Box::pin(async move {
                tokio::time::sleep(self.latency).await;
                self.writes.lock().unwrap().push(chunk.len());
                Ok(self.latency)
            })
        }

        fn abort(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.aborted.store(true, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async {})
        }
    }

    struct DeadSink;

    impl PcmSink for DeadSink {
        fn write<'a>(
            &'a mut self,
            _chunk: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = Result<Duration, DaemonError>> + Send + 'a>> {
            Box::pin(async { Err(DaemonError::SinkUnavailable("gone".into())) })
        }

        fn abort(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async {})
        }

        fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async {})
        }
    }

    fn unset_skip() -> SkipFlag {
        Arc::new(AtomicBool::new(false))
    }

    fn secs_of_pcm(secs: f64) -> Vec<u8> {
        vec![0u8; (SAMPLE_RATE as f64 * 2.0 * secs) as usize]
    }

    #[tokio::test]
    async fn writes_are_chunked() {
        let sink = FakeSink::instant();
        let writes = Arc::clone(&sink.writes);
        let mut writer = StreamWriter::new(Box::new(sink));

        // 0.625 s of audio: two full chunks plus a remainder.
        let pcm = secs_of_pcm(0.625);
        let timing = writer.deliver(&pcm, 1.0, 0.0, &unset_skip()).await.unwrap();

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0], WRITE_CHUNK_BYTES);
        assert_eq!(writes[1], WRITE_CHUNK_BYTES);
        assert!(writes[2] < WRITE_CHUNK_BYTES);
        assert!((timing.audio_sec - 0.625).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_sleeps_off_the_surplus() {
        let mut writer = StreamWriter::new(Box::new(FakeSink::instant()));
        let skip = unset_skip();

        // First clause: no pacing, nothing written yet.
        let t1 = writer.deliver(&secs_of_pcm(1.0), 1.0, 0.0, &skip).await.unwrap();
        assert_eq!(t1.wait_ms, 0.0);

        // Writes were instant, so the sink is a full second ahead; the
        // second clause must wait that surplus out.
        let t2 = writer.deliver(&secs_of_pcm(0.5), 1.0, 0.0, &skip).await.unwrap();
        assert!(t2.wait_ms > 900.0, "wait_ms = {}", t2.wait_ms);
        assert!(t2.wait_ms <= 1000.0, "wait_ms = {}", t2.wait_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn no_pacing_when_sink_consumed_in_real_time() {
        // A sink whose writes take as long as the audio lasts (perfect
        // backpressure) never accumulates surplus.
        let mut writer = StreamWriter::new(Box::new(FakeSink::with_latency(
            Duration::from_millis(250),
        )));
        let skip = unset_skip();
        writer.deliver(&secs_of_pcm(0.5), 1.0, 0.0, &skip).await.unwrap();
        let t2 = writer.deliver(&secs_of_pcm(0.25), 1.0, 0.0, &skip).await.unwrap();
        assert!(t2.wait_ms < 50.0, "wait_ms = {}", t2.wait_ms);
    }

    #[tokio::test]
    async fn skip_stops_at_chunk_boundary() {
        let sink = FakeSink::instant();
        let writes = Arc::clone(&sink.writes);
        let mut writer = StreamWriter::new(Box::new(sink));

        let skip = Arc::new(AtomicBool::new(true));
        let timing = writer.deliver(&secs_of_pcm(1.0), 1.0, 0.0, &skip).await.unwrap();
        assert!(writes.lock().unwrap().is_empty());
        assert_eq!(timing.audio_sec, 0.0);
    }

    #[tokio::test]
    async fn dead_sink_surfaces_sink_unavailable() {
        let mut writer = StreamWriter::new(Box::new(DeadSink));
        let err = writer
            .deliver(&secs_of_pcm(0.25), 1.0, 0.0, &unset_skip())
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::SinkUnavailable(_)));
    }

    #[tokio::test]
    async fn abort_resets_pacing() {
        let sink = FakeSink::instant();
        let aborted = Arc::clone(&sink.aborted);
        let mut writer = StreamWriter::new(Box::new(sink));
        let skip = unset_skip();

        writer.deliver(&secs_of_pcm(1.0), 1.0, 0.0, &skip).await.unwrap();
        writer.abort().await;
        assert!(aborted.load(Ordering::SeqCst));

        // No surplus carried over: next clause starts immediately.
        let t = writer.deliver(&secs_of_pcm(0.25), 1.0, 0.0, &skip).await.unwrap();
        assert_eq!(t.wait_ms, 0.0);
    }

    #[tokio::test]
    async fn delivered_chunks_reach_subscribers() {
        let subscribers = Arc::new(SubscriberManager::default());
        let mut feed = subscribers.add(false);
        let mut writer =
            StreamWriter::with_broadcast(Box::new(FakeSink::instant()), Arc::clone(&subscribers));

        let pcm = secs_of_pcm(0.375);
        writer.deliver(&pcm, 1.0, 0.0, &unset_skip()).await.unwrap();

        let mut received = 0usize;
        while let Ok(frame) = feed.rx.try_recv() {
            received += frame.payload.len();
        }
        assert_eq!(received, pcm.len());
    }

    #[tokio::test]
    async fn rejected_chunks_are_not_broadcast() {
        let subscribers = Arc::new(SubscriberManager::default());
        let mut feed = subscribers.add(false);
        let mut writer =
            StreamWriter::with_broadcast(Box::new(DeadSink), Arc::clone(&subscribers));

        let _ = writer.deliver(&secs_of_pcm(0.25), 1.0, 0.0, &unset_skip()).await;
        assert!(feed.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn process_sink_streams_to_a_real_child() {
        let mut sink = ProcessSink::new(vec!["cat".to_string()]);
        let latency = sink.write(&[0u8; 1024]).await.unwrap();
        assert!(latency < Duration::from_secs(1));
        sink.close().await;
    }

    #[tokio::test]
    async fn missing_player_is_sink_unavailable() {
        let mut sink = ProcessSink::new(vec!["definitely-not-a-player-2193".to_string()]);
        let err = sink.write(&[0u8; 16]).await.unwrap_err();
        assert!(matches!(err, DaemonError::SinkUnavailable(_)));
    }
}
