//! Separator chime, caller identification tones, and caller profiles.
//!
//! Every caller gets a deterministic tone derived from its name: a beep
//! count of 1-3 and pitches drawn from a fixed pentatonic table, so agents
//! heard in sequence stay aurally distinct without any registry.

use std::collections::HashMap;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::pcm_from_f32;
use crate::config::{self, SAMPLE_RATE};

/// Pentatonic beep patterns, wide spread for maximum distinctness.
/// 1-beep: single pitch; 2-beep: intervals; 3-beep: melodic fragments.
const TONE_SETS: [&[f32]; 9] = [
    &[523.25],                 // C5
    &[440.00],                 // A4
    &[659.25],                 // E5
    &[329.63, 523.25],         // E4 -> C5 (ascending 4th)
    &[783.99, 440.00],         // G5 -> A4 (descending)
    &[293.66, 587.33],         // D4 -> D5 (octave leap)
    &[392.00, 523.25, 659.25], // G4 -> C5 -> E5 (major arpeggio)
    &[880.00, 659.25, 523.25], // A5 -> E5 -> C5 (descending)
    &[329.63, 440.00, 587.33], // E4 -> A4 -> D5 (rising)
];

/// Hash a caller name into its tone pattern index.
fn tone_index(caller: &str) -> usize {
    let digest = Sha256::digest(caller.as_bytes());
    let h = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    h as usize % TONE_SETS.len()
}

/// The beep pattern (frequencies in Hz) assigned to a caller.
pub fn caller_pattern(caller: &str) -> &'static [f32] {
    TONE_SETS[tone_index(caller)]
}

fn sine_note(freq: f32, duration_secs: f32, volume: f32) -> Vec<f32> {
    let n = (SAMPLE_RATE as f32 * duration_secs) as usize;
    let fade_len = (SAMPLE_RATE as f32 * 0.015) as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let mut s = (2.0 * std::f32::consts::PI * freq * t).sin() * volume;
            if i < fade_len {
                s *= i as f32 / fade_len as f32;
            }
            if i >= n - fade_len.min(n) {
                s *= (n - i) as f32 / fade_len as f32;
            }
            s
        })
        .collect()
}

/// Generate a caller's identification tone as PCM.
///
/// Fewer beeps get longer notes so every pattern lands in roughly the
/// same time envelope.
pub fn caller_tone(caller: &str) -> Vec<u8> {
    let freqs = caller_pattern(caller);
    let duration = match freqs.len() {
        1 => 0.16,
        2 => 0.12,
        _ => 0.08,
    };
    let gap = vec![0.0f32; SAMPLE_RATE as usize * 4 / 100]; // 40 ms between beeps

    let mut samples = vec![0.0f32; SAMPLE_RATE as usize * 4 / 100]; // leading silence
    for (i, &freq) in freqs.iter().enumerate() {
        samples.extend(sine_note(freq, duration, 0.10));
        if i < freqs.len() - 1 {
            samples.extend_from_slice(&gap);
        }
    }
    samples.extend(vec![0.0f32; SAMPLE_RATE as usize * 6 / 100]); // trailing silence
    pcm_from_f32(&samples)
}

/// Gentle two-note chime (E5 -> G5) separating consecutive items from the
/// same caller, ~300 ms total.
pub fn separator_tone() -> Vec<u8> {
    let mut samples = vec![0.0f32; SAMPLE_RATE as usize * 5 / 100]; // 50 ms lead-in
    samples.extend(sine_note(659.0, 0.15, 0.08));
    samples.extend(vec![0.0f32; SAMPLE_RATE as usize * 3 / 100]); // 30 ms gap
    samples.extend(sine_note(784.0, 0.15, 0.08));
    samples.extend(vec![0.0f32; SAMPLE_RATE as usize * 8 / 100]); // 80 ms tail
    pcm_from_f32(&samples)
}

/// One second of silence between items from different callers.
pub fn caller_gap() -> Vec<u8> {
    super::silence(config::CALLER_GAP.as_millis() as u32)
}

// ---------------------------------------------------------------------------
// Caller profiles
// ---------------------------------------------------------------------------

/// Voice and gain assigned to one caller. Read-only at runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct CallerProfile {
    pub voice: String,
    #[serde(default = "default_gain")]
    pub gain: f32,
}

fn default_gain() -> f32 {
    1.0
}

#[derive(Debug, Default, Deserialize)]
struct CallersFile {
    #[serde(default)]
    callers: HashMap<String, CallerProfile>,
}

/// Caller name -> profile lookup with a fixed fallback for unknown callers.
#[derive(Debug, Default)]
pub struct CallerProfiles {
    profiles: HashMap<String, CallerProfile>,
}

impl CallerProfiles {
    /// Load profile overrides from `callers.json`; missing or unparsable
    /// files mean an empty table.
    pub fn load() -> Self {
        let file: CallersFile =
            config::read_json_file(&config::paths::callers_config_path()).unwrap_or_default();
        Self {
            profiles: file.callers,
        }
    }

    #[cfg(test)]
    pub fn from_map(profiles: HashMap<String, CallerProfile>) -> Self {
        Self { profiles }
    }

    /// Resolve `(voice, gain)` for a caller, falling back to the request's
    /// own voice at unity gain when the caller is unknown.
    pub fn resolve(&self, caller: &str, default_voice: &str) -> (String, f32) {
        match self.profiles.get(caller) {
            Some(p) => (p.voice.clone(), p.gain),
            None => (default_voice.to_string(), 1.0),
        }
    }
}
