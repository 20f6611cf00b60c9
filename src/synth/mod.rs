//! Synthesis adapter and the cache-integrated synthesizer.
//!
//! Engines are consumed as a capability: `synthesize(text, voice, speed)`
//! returning mono i16le PCM at 24 kHz. Two implementations are provided —
//! an HTTP engine speaking the OpenAI-compatible `/v1/audio/speech` shape
//! of local model servers, and a command engine shelling out to a program
//! that writes PCM to stdout. The `Synthesizer` wraps primary + fallback
//! engines and the two-tier cache resolution order: clause hit, then word
//! assembly, then full synthesis.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{AudioCache, CacheKey};
use crate::config::Config;
use crate::error::DaemonError;
use crate::text;

/// Common trait for synthesis engines (dyn-compatible).
pub trait TtsEngine: Send + Sync {
    /// Synthesize text to raw PCM bytes (i16le, 24 kHz mono).
    fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<u8>>> + Send + '_>>;

    /// Display name for this engine.
    fn name(&self) -> String;
}

// ---------------------------------------------------------------------------
// HTTP engine (primary)
// ---------------------------------------------------------------------------

/// Engine backed by an OpenAI-compatible speech endpoint that returns raw
/// PCM (`response_format: "pcm"`), e.g. a local Kokoro server.
pub struct HttpEngine {
    url: String,
    client: reqwest::Client,
}

impl HttpEngine {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

impl TtsEngine for HttpEngine {
    fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<u8>>> + Send + '_>> {
        let text = text.to_string();
        let voice = voice.to_string();
        Box::pin(async move {
            let body = serde_json::json!({
                "input": text,
                "voice": voice,
                "speed": speed,
                "response_format": "pcm",
            });

            let resp = self
                .client
                .post(&self.url)
                .json(&body)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("TTS request failed: {}", e))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("TTS API error {}: {}", status, body);
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read TTS response: {}", e))?;
            if bytes.is_empty() {
                anyhow::bail!("TTS endpoint returned no audio");
            }
            Ok(bytes.to_vec())
        })
    }

    fn name(&self) -> String {
        format!("http ({})", self.url)
    }
}

// ---------------------------------------------------------------------------
// Command engine (fallback)
// ---------------------------------------------------------------------------

/// Engine that runs a synthesis command with the text as its final
/// argument and reads raw PCM from its stdout.
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    /// Parse a whitespace-split command line. `{voice}` and `{speed}`
    /// placeholders in arguments are substituted per call.
    pub fn new(cmdline: &str) -> Option<Self> {
        let mut parts = cmdline.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl TtsEngine for CommandEngine {
    fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<u8>>> + Send + '_>> {
        let text = text.to_string();
        let voice = voice.to_string();
        Box::pin(async move {
            let args: Vec<String> = self
                .args
                .iter()
                .map(|a| {
                    a.replace("{voice}", &voice)
                        .replace("{speed}", &format!("{speed:.2}"))
                })
                .collect();
            let output = tokio::process::Command::new(&self.program)
                .args(&args)
                .arg(&text)
                .output()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to run {}: {}", self.program, e))?;
            if !output.status.success() {
                anyhow::bail!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            if output.stdout.is_empty() {
                anyhow::bail!("{} produced no audio", self.program);
            }
            Ok(output.stdout)
        })
    }

    fn name(&self) -> String {
        format!("command ({})", self.program)
    }
}

// ---------------------------------------------------------------------------
// Cache-integrated synthesizer
// ---------------------------------------------------------------------------

/// How a clause's audio was obtained. The tag is what the per-clause log
/// line reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Exact clause-tier cache hit.
    ClauseCache,
    /// Assembled from word-tier entries; a background upgrade follows.
    WordCache,
    /// Full engine synthesis.
    Synthesized,
}

impl Resolution {
    pub fn tag(self) -> &'static str {
        match self {
            Self::ClauseCache => "HIT",
            Self::WordCache => "ASM",
            Self::Synthesized => "SYN",
        }
    }
}

/// Primary/fallback engine pair bound to the two-tier cache.
pub struct Synthesizer {
    primary: Box<dyn TtsEngine>,
    fallback: Option<Box<dyn TtsEngine>>,
    cache: Arc<AudioCache>,
}

impl Synthesizer {
    pub fn new(
        primary: Box<dyn TtsEngine>,
        fallback: Option<Box<dyn TtsEngine>>,
        cache: Arc<AudioCache>,
    ) -> Self {
        Self {
            primary,
            fallback,
            cache,
        }
    }

    pub fn from_config(config: &Config, cache: Arc<AudioCache>) -> Self {
        let primary = Box::new(HttpEngine::new(&config.engine_url));
        let fallback = CommandEngine::new(&config.fallback_cmd)
            .map(|e| Box::new(e) as Box<dyn TtsEngine>);
        Self::new(primary, fallback, cache)
    }

    pub fn cache(&self) -> &Arc<AudioCache> {
        &self.cache
    }

    /// Run the engines: primary once, then the fallback once before
    /// surfacing failure.
    async fn engine_synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f64,
    ) -> Result<Vec<u8>, DaemonError> {
        let primary_err = match self.primary.synthesize(text, voice, speed).await {
            Ok(pcm) => return Ok(pcm),
            Err(e) => {
                warn!(engine = %self.primary.name(), "Primary engine failed: {}", e);
                e
            }
        };
        match &self.fallback {
            Some(fallback) => fallback
                .synthesize(text, voice, speed)
                .await
                .map_err(|e| DaemonError::SynthesisFailure(e.to_string())),
            None => Err(DaemonError::SynthesisFailure(primary_err.to_string())),
        }
    }

    /// Full synthesis of one clause, populating both cache tiers.
    async fn synthesize_full(
        &self,
        clause: &str,
        voice: &str,
        speed: f64,
    ) -> Result<Vec<u8>, DaemonError> {
        let pcm = self.engine_synthesize(clause, voice, speed).await?;
        let words = text::clause_words(clause);
        self.cache.store_synthesis(clause, voice, speed, &words, &pcm);
        Ok(pcm)
    }

    /// Resolve one clause through the tier order: clause cache, word
    /// assembly, engine synthesis. `Resolution::WordCache` results want a
    /// background upgrade (`spawn_upgrade`).
    pub async fn synthesize_clause(
        &self,
        clause: &str,
        voice: &str,
        speed: f64,
    ) -> Result<(Vec<u8>, Resolution), DaemonError> {
        if let Some(entry) = self.cache.lookup(&CacheKey::clause(clause, voice, speed)) {
            return Ok((entry.pcm, Resolution::ClauseCache));
        }

        let words = text::clause_words(clause);
        let (assembled, coverage) = self.cache.assemble(&words, voice);
        if let Some(pcm) = assembled {
            return Ok((pcm, Resolution::WordCache));
        }
        if coverage > 0.0 {
            debug!(coverage, clause, "Partial word coverage, full synthesis");
        }

        let pcm = self.synthesize_full(clause, voice, speed).await?;
        Ok((pcm, Resolution::Synthesized))
    }

    /// Re-synthesize a word-assembled clause at full quality and replace
    /// the clause-tier entry. Dropped if the cache was cleared since
    /// `generation` was snapshotted; never blocks playback.
    pub async fn upgrade_clause(&self, clause: &str, voice: &str, speed: f64, generation: u64) {
        match self.engine_synthesize(clause, voice, speed).await {
            Ok(pcm) => {
                if self.cache.generation() != generation {
                    debug!(clause, "Cache cleared mid-upgrade, dropping result");
                    return;
                }
                let words = text::clause_words(clause);
                self.cache.store_synthesis(clause, voice, speed, &words, &pcm);
                debug!(clause, "Upgraded word-assembled clause to clause tier");
            }
            Err(e) => debug!(clause, "Background upgrade failed: {}", e),
        }
    }

    /// Fire-and-forget background upgrade after a word-tier assembly.
    pub fn spawn_upgrade(self: &Arc<Self>, clause: String, voice: String, speed: f64) {
        let synth = Arc::clone(self);
        let generation = synth.cache.generation();
        tokio::spawn(async move {
            synth.upgrade_clause(&clause, &voice, speed, generation).await;
        });
    }
}
