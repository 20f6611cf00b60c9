//! Daemon configuration: audio constants, tunables, and path resolution.

pub mod paths;

use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::warn;

// --- Audio format (fixed end to end) ---

/// Output sample rate in Hz. All cached and streamed PCM is mono i16le
/// at this rate.
pub const SAMPLE_RATE: u32 = 24_000;

/// Bytes per sample (i16le mono).
pub const BYTES_PER_SAMPLE: usize = 2;

/// PCM written to the sink in chunks of this many bytes (0.25 s of audio)
/// so a skip can take effect between chunks and sink backpressure paces us.
pub const WRITE_CHUNK_BYTES: usize = SAMPLE_RATE as usize * BYTES_PER_SAMPLE / 4;

// --- Word assembly ---

/// Crossfade ramp at word joins, avoids clicks.
pub const CROSSFADE_MS: u32 = 5;

/// Silence inserted between assembled words.
pub const WORD_GAP_MS: u32 = 30;

/// Energy threshold for silence detection, relative to peak.
pub const SILENCE_THRESHOLD: f32 = 0.02;

/// Minimum silent stretch that counts as a word boundary (20 ms).
pub const SILENCE_MIN_SAMPLES: usize = SAMPLE_RATE as usize / 50;

// --- Queue pacing ---

/// Silence between items from different callers.
pub const CALLER_GAP: Duration = Duration::from_secs(1);

/// How many clauses synthesis may run ahead of playback.
pub const PIPELINE_DEPTH: usize = 2;

/// Runtime configuration resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: PathBuf,
    pub state_path: PathBuf,
    pub pid_path: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
    pub idle_timeout: Duration,
    /// OpenAI-compatible speech endpoint of the primary engine.
    pub engine_url: String,
    /// Fallback synthesis command, receives text on argv and writes
    /// raw PCM to stdout. Empty string disables the fallback.
    pub fallback_cmd: String,
    /// Audio player command fed raw PCM on stdin.
    pub player_cmd: Vec<String>,
}

impl Config {
    /// Resolve configuration from the environment with built-in defaults.
    pub fn load() -> Self {
        let ttl_days: u64 = env_parse("SPEAKD_CACHE_TTL_DAYS", 3);
        let idle_secs: u64 = env_parse("SPEAKD_IDLE_TIMEOUT", 300);
        Self {
            socket_path: paths::socket_path(),
            state_path: paths::state_path(),
            pid_path: paths::pid_path(),
            cache_dir: paths::cache_dir(),
            cache_ttl: Duration::from_secs(ttl_days * 86_400),
            idle_timeout: Duration::from_secs(idle_secs),
            engine_url: std::env::var("SPEAKD_TTS_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8880/v1/audio/speech".to_string()),
            fallback_cmd: std::env::var("SPEAKD_TTS_FALLBACK").unwrap_or_default(),
            player_cmd: player_cmd_from_env(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            warn!("Ignoring unparsable {}={}", key, v);
            default
        }),
        Err(_) => default,
    }
}

/// Player command line. `SPEAKD_PLAYER` overrides as a whitespace-split
/// command; the default pipes s16le mono PCM into ffplay.
fn player_cmd_from_env() -> Vec<String> {
    if let Ok(cmd) = std::env::var("SPEAKD_PLAYER") {
        let parts: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
        if !parts.is_empty() {
            return parts;
        }
    }
    [
        "ffplay",
        "-nodisp",
        "-autoexit",
        "-probesize",
        "32",
        "-f",
        "s16le",
        "-ar",
        "24000",
        "-ch_layout",
        "mono",
        "-i",
        "pipe:0",
        "-loglevel",
        "quiet",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Generic helper: read a JSON file and deserialize it.
pub fn read_json_file<T: DeserializeOwned>(path: &PathBuf) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}
