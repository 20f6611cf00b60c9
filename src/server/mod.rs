//! Protocol server: the Unix socket accept loop and per-connection
//! dispatch.
//!
//! Each connection carries exactly one request/response cycle. Sync
//! requests stream PCM frames back on the same connection; enqueue and
//! command requests get a single JSON frame. A maintenance task sweeps
//! the cache hourly and shuts the daemon down after a configurable idle
//! window with no playback and no connections.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::AsyncWrite;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::audio::{self, tones::CallerProfiles};
use crate::cache::AudioCache;
use crate::config::{Config, SAMPLE_RATE};
use crate::protocol::{self, Command, Request, SpeakRequest};
use crate::queue::{worker, PlaybackQueue};
use crate::state::StatePublisher;
use crate::subscribers::{SubscriberManager, FRAME_METADATA};
use crate::synth::{Resolution, Synthesizer};
use crate::text;
use crate::writer::{PcmSink, ProcessSink, StreamWriter};

/// The owning context for everything the daemon runs: queue, synthesizer,
/// caller profiles, and the activity clock the idle watchdog reads.
pub struct Daemon {
    config: Config,
    queue: Arc<PlaybackQueue>,
    synth: Arc<Synthesizer>,
    profiles: Arc<CallerProfiles>,
    subscribers: Arc<SubscriberManager>,
    last_activity: Mutex<Instant>,
    shutdown: tokio::sync::Notify,
}

impl Daemon {
    pub fn new(config: Config) -> Arc<Self> {
        let cache = Arc::new(AudioCache::new(&config.cache_dir, config.cache_ttl));
        let synth = Arc::new(Synthesizer::from_config(&config, cache));
        Self::with_synth(config, synth)
    }

    /// Assemble the daemon around an already-built synthesizer.
    pub fn with_synth(config: Config, synth: Arc<Synthesizer>) -> Arc<Self> {
        let subscribers = Arc::new(SubscriberManager::default());
        let publisher =
            StatePublisher::with_subscribers(config.state_path.clone(), Arc::clone(&subscribers));
        Arc::new(Self {
            queue: PlaybackQueue::new(publisher),
            synth,
            profiles: Arc::new(CallerProfiles::load()),
            subscribers,
            last_activity: Mutex::new(Instant::now()),
            shutdown: tokio::sync::Notify::new(),
            config,
        })
    }

    /// Request shutdown; the accept loop exits and cleans up.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Run with the configured player process as the sink.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let sink = ProcessSink::new(self.config.player_cmd.clone());
        self.run_with_sink(Box::new(sink)).await
    }

    /// Bind the socket, start the worker and maintenance tasks, and
    /// accept connections until shutdown.
    pub async fn run_with_sink(self: Arc<Self>, sink: Box<dyn PcmSink>) -> anyhow::Result<()> {
        // A stale socket from a dead daemon would make bind fail.
        match std::fs::remove_file(&self.config.socket_path) {
            Ok(()) => warn!("Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove stale socket: {}", e),
        }
        let listener = UnixListener::bind(&self.config.socket_path)
            .with_context(|| format!("binding {}", self.config.socket_path.display()))?;
        if let Err(e) = std::fs::write(&self.config.pid_path, std::process::id().to_string()) {
            warn!("Could not write pid file: {}", e);
        }

        let worker_task = {
            let daemon = Arc::clone(&self);
            tokio::spawn(worker::run(
                Arc::clone(&self.queue),
                Arc::clone(&self.synth),
                Arc::clone(&self.profiles),
                StreamWriter::with_broadcast(sink, Arc::clone(&self.subscribers)),
                Box::new(move || daemon.touch()),
            ))
        };
        let maintenance_task = tokio::spawn(Arc::clone(&self).maintenance());

        info!(socket = %self.config.socket_path.display(), "Listening");
        loop {
            tokio::select! {
                () = self.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        tokio::spawn(Arc::clone(&self).handle_connection(stream));
                    }
                    Err(e) => {
                        // Accept failing outright means the socket is gone
                        // or fds are exhausted; nothing useful survives that.
                        error!("Accept failed, shutting down: {}", e);
                        break;
                    }
                },
            }
        }

        worker_task.abort();
        maintenance_task.abort();
        // Ending the feeds lets subscriber connections terminate cleanly.
        self.subscribers.close_all();
        let _ = std::fs::remove_file(&self.config.socket_path);
        let _ = std::fs::remove_file(&self.config.pid_path);
        info!("Daemon stopped");
        Ok(())
    }

    /// Hourly cache sweep plus the idle watchdog.
    async fn maintenance(self: Arc<Self>) {
        let mut sweep = tokio::time::interval(Duration::from_secs(3600));
        let idle_period = (self.config.idle_timeout / 4)
            .clamp(Duration::from_millis(100), Duration::from_secs(30));
        let mut idle = tokio::time::interval(idle_period);
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let removed = self.synth.cache().sweep();
                    if removed > 0 {
                        info!(removed, "Swept expired cache entries");
                    }
                }
                _ = idle.tick() => {
                    if !self.config.idle_timeout.is_zero()
                        && self.queue.is_idle()
                        && self.idle_for() >= self.config.idle_timeout
                    {
                        info!(
                            idle_secs = self.idle_for().as_secs(),
                            "Idle timeout reached, shutting down"
                        );
                        self.shutdown();
                        return;
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        self.touch();
        let (mut reader, mut writer) = stream.into_split();
        let payload = match protocol::read_frame(&mut reader).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                // Oversized or truncated prefix: answer with an error
                // frame before closing, best effort.
                debug!("Dropping connection: {}", e);
                let _ = protocol::write_json(
                    &mut writer,
                    &serde_json::json!({"ok": false, "error": format!("bad frame: {e}")}),
                )
                .await;
                return;
            }
        };

        let result = match protocol::parse_request(&payload) {
            Ok(Request::Sync(req)) => self.handle_sync(req, &mut writer).await,
            Ok(Request::Enqueue(req)) => {
                let position = self.queue.enqueue(&req);
                debug!(position, "Enqueued \"{}\"", req.text.chars().take(60).collect::<String>());
                protocol::write_json(
                    &mut writer,
                    &serde_json::json!({"ok": true, "position": position}),
                )
                .await
            }
            Ok(Request::Command(Command::Subscribe { include_metadata })) => {
                self.handle_subscribe(include_metadata, &mut writer).await
            }
            Ok(Request::Command(command)) => self.handle_command(command, &mut writer).await,
            Err(e) => {
                protocol::write_json(
                    &mut writer,
                    &serde_json::json!({"ok": false, "error": e.to_string()}),
                )
                .await
            }
        };
        if let Err(e) = result {
            debug!("Connection ended early: {}", e);
        }
    }

    /// Sync path: synthesize clause by clause and stream each clause's
    /// PCM as one frame, so the caller can start playback before the
    /// whole text is rendered. Never touches the playback queue or sink.
    async fn handle_sync<W>(&self, req: SpeakRequest, writer: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let (voice, gain) = match &req.caller {
            Some(caller) => self.profiles.resolve(caller, &req.voice),
            None => (req.voice.clone(), 1.0),
        };
        debug!(voice = %voice, speed = req.speed, lang = %req.lang, "Sync request");
        let mut sent = 0usize;
        for clause in text::split_clauses(&req.text) {
            match self.synth.synthesize_clause(&clause, &voice, req.speed).await {
                Ok((pcm, resolution)) => {
                    if resolution == Resolution::WordCache {
                        self.synth.spawn_upgrade(clause, voice.clone(), req.speed);
                    }
                    protocol::write_frame(writer, &audio::apply_gain(&pcm, gain)).await?;
                    sent += 1;
                }
                Err(e) => {
                    warn!("Sync synthesis failed: {}", e);
                    if sent == 0 {
                        return protocol::write_json(
                            writer,
                            &serde_json::json!({"ok": false, "error": e.to_string()}),
                        )
                        .await;
                    }
                    break;
                }
            }
        }
        protocol::write_terminator(writer).await
    }

    /// Subscriber path: acknowledge, then hold the connection open and
    /// relay broadcast frames until the subscriber hangs up or the
    /// daemon shuts down. Subscribers do not count as activity for the
    /// idle watchdog.
    async fn handle_subscribe<W>(&self, include_metadata: bool, writer: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let ack = serde_json::json!({
            "ok": true,
            "subscribed": true,
            "sample_rate": SAMPLE_RATE,
            "channels": 1,
            "format": "s16le",
        });
        protocol::write_frame(writer, &serde_json::to_vec(&ack)?).await?;

        let mut feed = self.subscribers.add(include_metadata);

        // Late joiners get the current item up front instead of decoding
        // mid-stream audio with no context.
        if include_metadata {
            if let Some(playing) = self.queue.status().playing {
                let context = serde_json::json!({"event": "playing", "playing": playing});
                let payload = serde_json::to_vec(&context)?;
                protocol::write_broadcast_frame(writer, FRAME_METADATA, &payload).await?;
            }
        }

        let result: anyhow::Result<()> = async {
            while let Some(frame) = feed.rx.recv().await {
                protocol::write_broadcast_frame(writer, frame.kind, &frame.payload).await?;
                feed.bytes_sent
                    .fetch_add(frame.payload.len() as u64 + 1, std::sync::atomic::Ordering::Relaxed);
            }
            Ok(())
        }
        .await;
        self.subscribers.remove(feed.id);
        result?;
        protocol::write_terminator(writer).await
    }

    async fn handle_command<W>(&self, command: Command, writer: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let value = match command {
            Command::QueueStatus {} => {
                let snapshot = self.queue.status();
                serde_json::json!({
                    "ok": true,
                    "playing": snapshot.playing,
                    "pending": snapshot.pending,
                })
            }
            Command::Skip {} => serde_json::json!({"ok": true, "skipped": self.queue.skip()}),
            Command::Clear {} => serde_json::json!({"ok": true, "cleared": self.queue.clear()}),
            Command::Replay {} => match self.queue.replay() {
                Ok((position, text)) => {
                    serde_json::json!({"ok": true, "position": position, "text": text})
                }
                Err(e) => serde_json::json!({"ok": false, "error": e.to_string()}),
            },
            Command::Stats {} => serde_json::json!({
                "ok": true,
                "queue": self.queue.stats(),
                "cache": self.synth.cache().stats(),
                "subscribers": self.subscribers.status(),
            }),
            // Routed before dispatch; a second subscribe frame on the
            // same connection never reaches this point.
            Command::Subscribe { .. } => unreachable!("subscribe handled by the connection loop"),
            Command::History { n } => {
                serde_json::json!({"ok": true, "history": self.queue.history(n)})
            }
        };
        protocol::write_json(writer, &value).await
    }
}
