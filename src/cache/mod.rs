//! Two-tier content-addressed audio cache.
//!
//! Tier 1 keys a full clause (text + voice + speed) to its synthesized PCM,
//! best quality. Tier 2 keys individual normalized words (word + voice) so
//! novel clauses can be assembled from previously heard words. Each entry
//! is a pair of files:
//!
//!   `<hash>`       raw PCM bytes (i16le, 24 kHz mono)
//!   `<hash>.meta`  JSON metadata: voice, speed, hits, created_at, label
//!
//! Expiry is TTL-based and lazy: an expired entry is deleted when a lookup
//! touches it, and a periodic sweep catches the rest. Disk write failures
//! downgrade the entry to an in-memory overlay; read failures are misses.
//! Neither is surfaced to callers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::audio;
use crate::config::SAMPLE_RATE;

/// Cache granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    Clause,
    Word,
}

/// Typed cache key. Equality and hashing cover tier, fingerprint, voice
/// and quantized speed, so float jitter can never split entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tier: CacheTier,
    fingerprint: String,
    voice: String,
    /// Speed in hundredths. Zero for word-tier keys: identical
    /// (word, voice) pairs must collide regardless of requested speed.
    speed_centi: u16,
}

impl CacheKey {
    pub fn clause(text: &str, voice: &str, speed: f64) -> Self {
        Self {
            tier: CacheTier::Clause,
            fingerprint: text.trim().to_string(),
            voice: voice.to_string(),
            speed_centi: quantize_speed(speed),
        }
    }

    pub fn word(word: &str, voice: &str) -> Self {
        Self {
            tier: CacheTier::Word,
            fingerprint: word.to_string(),
            voice: voice.to_string(),
            speed_centi: 0,
        }
    }

    /// On-disk address: truncated SHA-256 of the canonical key string.
    fn address(&self) -> String {
        let canon = format!("{}|{}|{}", self.fingerprint, self.voice, self.speed_centi);
        let digest = Sha256::digest(canon.as_bytes());
        hex::encode(digest)[..24].to_string()
    }

    fn label(&self) -> String {
        self.fingerprint.chars().take(200).collect()
    }
}

fn quantize_speed(speed: f64) -> u16 {
    (speed.clamp(0.0, 600.0) * 100.0).round() as u16
}

/// A cached audio payload.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub created_at: SystemTime,
    pub tier: CacheTier,
}

impl CacheEntry {
    fn new(pcm: Vec<u8>, tier: CacheTier) -> Self {
        Self {
            pcm,
            sample_rate: SAMPLE_RATE,
            created_at: SystemTime::now(),
            tier,
        }
    }
}

/// Sidecar metadata, one JSON file per entry.
#[derive(Debug, Default, Serialize, Deserialize)]
struct EntryMeta {
    voice: String,
    speed: f64,
    #[serde(default)]
    hits: u64,
    created_at: f64,
    #[serde(default)]
    label: String,
}

/// Aggregate cache statistics for the `stats` command.
#[derive(Debug, Default, Serialize)]
pub struct CacheStats {
    pub clauses: u64,
    pub words: u64,
    pub clause_hits: u64,
    pub word_hits: u64,
    pub lookup_hits: u64,
    pub lookup_misses: u64,
    pub disk_bytes: u64,
    pub voices: HashMap<String, VoiceStats>,
}

#[derive(Debug, Default, Serialize)]
pub struct VoiceStats {
    pub clauses: u64,
    pub words: u64,
    pub hits: u64,
}

pub struct AudioCache {
    clause_dir: PathBuf,
    word_dir: PathBuf,
    ttl: Duration,
    /// Entries whose disk write failed, served from memory until expiry.
    memory: Mutex<HashMap<CacheKey, CacheEntry>>,
    /// Bumped on `clear` so in-flight background upgrades targeting the
    /// old contents are dropped instead of resurrecting them.
    generation: AtomicU64,
    lookup_hits: AtomicU64,
    lookup_misses: AtomicU64,
}

impl AudioCache {
    pub fn new(cache_dir: &Path, ttl: Duration) -> Self {
        let clause_dir = cache_dir.join("clauses");
        let word_dir = cache_dir.join("words");
        for dir in [&clause_dir, &word_dir] {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Cannot create cache dir {}: {}", dir.display(), e);
            }
        }
        Self {
            clause_dir,
            word_dir,
            ttl,
            memory: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            lookup_hits: AtomicU64::new(0),
            lookup_misses: AtomicU64::new(0),
        }
    }

    fn tier_dir(&self, tier: CacheTier) -> &Path {
        match tier {
            CacheTier::Clause => &self.clause_dir,
            CacheTier::Word => &self.word_dir,
        }
    }

    fn entry_paths(&self, key: &CacheKey) -> (PathBuf, PathBuf) {
        let dir = self.tier_dir(key.tier);
        let addr = key.address();
        (dir.join(&addr), dir.join(format!("{addr}.meta")))
    }

    /// Look up an entry. Expired entries are deleted and reported as
    /// misses; a hit bumps the sidecar hit counter.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        if let Some(entry) = self.lookup_memory(key) {
            self.lookup_hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry);
        }

        let (pcm_path, meta_path) = self.entry_paths(key);
        let age = match entry_age(&pcm_path) {
            Some(age) => age,
            None => {
                self.lookup_misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if age > self.ttl {
            remove_entry(&pcm_path, &meta_path);
            self.lookup_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        match std::fs::read(&pcm_path) {
            Ok(pcm) => {
                bump_hits(&meta_path);
                self.lookup_hits.fetch_add(1, Ordering::Relaxed);
                Some(CacheEntry {
                    pcm,
                    sample_rate: SAMPLE_RATE,
                    created_at: SystemTime::now() - age,
                    tier: key.tier,
                })
            }
            Err(e) => {
                // Read failure is a miss.
                debug!("Cache read failed for {}: {}", pcm_path.display(), e);
                self.lookup_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn lookup_memory(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut memory = self.memory.lock().unwrap();
        if let Some(entry) = memory.get(key) {
            let expired = entry
                .created_at
                .elapsed()
                .map(|age| age > self.ttl)
                .unwrap_or(false);
            if expired {
                memory.remove(key);
                return None;
            }
            return Some(entry.clone());
        }
        None
    }

    /// Whether an unexpired entry exists, without touching hit counters.
    pub fn contains(&self, key: &CacheKey) -> bool {
        if self.lookup_memory(key).is_some() {
            return true;
        }
        let (pcm_path, _) = self.entry_paths(key);
        matches!(entry_age(&pcm_path), Some(age) if age <= self.ttl)
    }

    /// Store an entry. Disk failures keep the entry in memory only.
    pub fn put(&self, key: &CacheKey, pcm: Vec<u8>) {
        let (pcm_path, meta_path) = self.entry_paths(key);
        if let Err(e) = write_atomic(&pcm_path, &pcm) {
            warn!(
                "Cache write failed for {}, keeping in memory: {}",
                pcm_path.display(),
                e
            );
            self.memory
                .lock()
                .unwrap()
                .insert(key.clone(), CacheEntry::new(pcm, key.tier));
            return;
        }
        // Entry made it to disk; drop any stale memory copy.
        self.memory.lock().unwrap().remove(key);

        let existing: EntryMeta = read_meta(&meta_path).unwrap_or_default();
        let meta = EntryMeta {
            voice: key.voice.clone(),
            speed: f64::from(key.speed_centi) / 100.0,
            hits: existing.hits,
            created_at: if existing.created_at > 0.0 {
                existing.created_at
            } else {
                unix_now()
            },
            label: key.label(),
        };
        if let Err(e) = write_meta(&meta_path, &meta) {
            debug!("Cache meta write failed for {}: {}", meta_path.display(), e);
        }
    }

    /// Try to assemble a clause from word-tier entries.
    ///
    /// Returns the joined audio only at full coverage; any missing word
    /// makes the whole clause a miss (no partial audio is fabricated).
    /// Coverage is reported either way for observability.
    pub fn assemble(&self, words: &[String], voice: &str) -> (Option<Vec<u8>>, f64) {
        if words.is_empty() {
            return (None, 0.0);
        }
        let mut pcms = Vec::with_capacity(words.len());
        let mut found = 0usize;
        for word in words {
            if let Some(entry) = self.lookup(&CacheKey::word(word, voice)) {
                found += 1;
                pcms.push(entry.pcm);
            }
        }
        let coverage = found as f64 / words.len() as f64;
        if found < words.len() {
            return (None, coverage);
        }
        (Some(audio::assemble_word_audio(&pcms)), coverage)
    }

    /// Decompose a full clause synthesis into per-word entries, writing
    /// any not already present so future unrelated clauses benefit.
    pub fn extract_and_cache_words(&self, words: &[String], pcm: &[u8], voice: &str) {
        match words {
            [] => {}
            [word] => {
                let key = CacheKey::word(word, voice);
                if !self.contains(&key) {
                    self.put(&key, pcm.to_vec());
                }
            }
            _ => {
                let samples = audio::samples_from_pcm(pcm);
                let segments = audio::detect_word_boundaries(&samples, words.len());
                for (word, (start, end)) in words.iter().zip(segments) {
                    if end <= start {
                        continue;
                    }
                    let key = CacheKey::word(word, voice);
                    if !self.contains(&key) {
                        self.put(&key, audio::pcm_from_samples(&samples[start..end]));
                    }
                }
            }
        }
    }

    /// Store a full clause synthesis: clause tier plus word decomposition.
    pub fn store_synthesis(&self, text: &str, voice: &str, speed: f64, words: &[String], pcm: &[u8]) {
        self.put(&CacheKey::clause(text, voice, speed), pcm.to_vec());
        self.extract_and_cache_words(words, pcm, voice);
    }

    /// Remove all TTL-expired entries across both tiers. Returns the
    /// number of entries removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        for tier in [CacheTier::Clause, CacheTier::Word] {
            let dir = self.tier_dir(tier);
            let Ok(read) = std::fs::read_dir(dir) else {
                continue;
            };
            for path in read.flatten().map(|e| e.path()) {
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    // Orphan from an interrupted atomic write; never an
                    // entry, so not counted.
                    let _ = std::fs::remove_file(&path);
                    continue;
                }
                if path.extension().is_some_and(|ext| ext == "meta") {
                    continue; // cleaned up with its PCM file
                }
                if matches!(entry_age(&path), Some(age) if age > self.ttl) {
                    let meta = meta_path_of(&path);
                    remove_entry(&path, &meta);
                    removed += 1;
                }
            }
        }
        self.memory.lock().unwrap().retain(|_, entry| {
            entry
                .created_at
                .elapsed()
                .map(|age| age <= self.ttl)
                .unwrap_or(true)
        });
        removed
    }

    /// Drop every entry in both tiers and bump the generation so racing
    /// background upgrades are discarded. Returns the number removed.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for tier in [CacheTier::Clause, CacheTier::Word] {
            let Ok(read) = std::fs::read_dir(self.tier_dir(tier)) else {
                continue;
            };
            for path in read.flatten().map(|e| e.path()) {
                if path.is_file() && std::fs::remove_file(&path).is_ok() {
                    if path.extension().is_none() {
                        removed += 1;
                    }
                }
            }
        }
        self.memory.lock().unwrap().clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
        removed
    }

    /// Current clear-generation. Background upgrades snapshot this before
    /// synthesizing and drop their result if it moved.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Aggregate statistics: entry and hit counts per tier and per voice,
    /// runtime lookup counters, disk usage.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            lookup_hits: self.lookup_hits.load(Ordering::Relaxed),
            lookup_misses: self.lookup_misses.load(Ordering::Relaxed),
            ..Default::default()
        };
        for tier in [CacheTier::Clause, CacheTier::Word] {
            let Ok(read) = std::fs::read_dir(self.tier_dir(tier)) else {
                continue;
            };
            for path in read.flatten().map(|e| e.path()) {
                if let Ok(md) = path.metadata() {
                    stats.disk_bytes += md.len();
                }
                if !path.extension().is_some_and(|ext| ext == "meta") {
                    continue;
                }
                let Some(meta) = read_meta(&path) else {
                    continue;
                };
                let voice = stats.voices.entry(meta.voice.clone()).or_default();
                match tier {
                    CacheTier::Clause => {
                        stats.clauses += 1;
                        stats.clause_hits += meta.hits;
                        voice.clauses += 1;
                    }
                    CacheTier::Word => {
                        stats.words += 1;
                        stats.word_hits += meta.hits;
                        voice.words += 1;
                    }
                }
                voice.hits += meta.hits;
            }
        }
        stats
    }
}

// --- file helpers ---

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn entry_age(path: &Path) -> Option<Duration> {
    let modified = path.metadata().ok()?.modified().ok()?;
    Some(modified.elapsed().unwrap_or(Duration::ZERO))
}

fn meta_path_of(pcm_path: &Path) -> PathBuf {
    let mut os = pcm_path.as_os_str().to_owned();
    os.push(".meta");
    PathBuf::from(os)
}

fn remove_entry(pcm_path: &Path, meta_path: &Path) {
    let _ = std::fs::remove_file(pcm_path);
    let _ = std::fs::remove_file(meta_path);
}

/// Write via temp-file-then-rename so a concurrent reader (or a racing
/// writer of the same key) never observes a partial entry.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    let tmp = PathBuf::from(os);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn read_meta(path: &Path) -> Option<EntryMeta> {
    serde_json::from_str(&std::fs::read_to_string(path).ok()?).ok()
}

fn write_meta(path: &Path, meta: &EntryMeta) -> std::io::Result<()> {
    write_atomic(path, serde_json::to_string(meta).unwrap_or_default().as_bytes())
}

fn bump_hits(meta_path: &Path) {
    let Some(mut meta) = read_meta(meta_path) else {
        return;
    };
    meta.hits += 1;
    let _ = write_meta(meta_path, &meta);
}
