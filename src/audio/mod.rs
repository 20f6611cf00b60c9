//! PCM helpers: format conversion, gain, word boundary detection, and
//! crossfaded word assembly.
//!
//! All audio in the daemon is mono i16le at 24 kHz, carried as raw bytes
//! so cache entries and sink writes need no further conversion.

pub mod tones;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::{
    BYTES_PER_SAMPLE, CROSSFADE_MS, SAMPLE_RATE, SILENCE_MIN_SAMPLES, SILENCE_THRESHOLD,
    WORD_GAP_MS,
};

const CROSSFADE_SAMPLES: usize = (SAMPLE_RATE as usize * CROSSFADE_MS as usize) / 1000;
const WORD_GAP_SAMPLES: usize = (SAMPLE_RATE as usize * WORD_GAP_MS as usize) / 1000;

/// Duration in seconds of a raw PCM buffer.
pub fn pcm_duration_secs(pcm_len: usize) -> f64 {
    (pcm_len / BYTES_PER_SAMPLE) as f64 / SAMPLE_RATE as f64
}

/// Decode i16le bytes into samples.
pub fn samples_from_pcm(pcm: &[u8]) -> Vec<i16> {
    let mut samples = vec![0i16; pcm.len() / BYTES_PER_SAMPLE];
    LittleEndian::read_i16_into(&pcm[..samples.len() * BYTES_PER_SAMPLE], &mut samples);
    samples
}

/// Encode samples into i16le bytes.
pub fn pcm_from_samples(samples: &[i16]) -> Vec<u8> {
    let mut pcm = vec![0u8; samples.len() * BYTES_PER_SAMPLE];
    LittleEndian::write_i16_into(samples, &mut pcm);
    pcm
}

/// Encode f32 samples in [-1, 1] into i16le bytes.
pub fn pcm_from_f32(samples: &[f32]) -> Vec<u8> {
    let scaled: Vec<i16> = samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * 32_767.0) as i16)
        .collect();
    pcm_from_samples(&scaled)
}

/// Apply a volume gain to PCM, clipping at full scale. Gain 1.0 is a no-op.
pub fn apply_gain(pcm: &[u8], gain: f32) -> Vec<u8> {
    if (gain - 1.0).abs() < f32::EPSILON {
        return pcm.to_vec();
    }
    let samples: Vec<i16> = samples_from_pcm(pcm)
        .into_iter()
        .map(|s| (f32::from(s) * gain).clamp(-32_767.0, 32_767.0) as i16)
        .collect();
    pcm_from_samples(&samples)
}

/// A run of silence of the given duration.
pub fn silence(ms: u32) -> Vec<u8> {
    vec![0u8; (SAMPLE_RATE as usize * ms as usize / 1000) * BYTES_PER_SAMPLE]
}

/// Find word boundaries in synthesized audio using energy-based silence
/// detection over 5 ms frames.
///
/// Returns `(start, end)` sample ranges for each of `n_words` segments,
/// falling back to equal division when not enough silent gaps are found.
pub fn detect_word_boundaries(samples: &[i16], n_words: usize) -> Vec<(usize, usize)> {
    let frame_len = SAMPLE_RATE as usize / 200; // 5 ms
    let n_frames = samples.len() / frame_len;
    if n_frames == 0 || n_words == 0 {
        return vec![(0, samples.len())];
    }

    let energy: Vec<f32> = (0..n_frames)
        .map(|i| {
            let frame = &samples[i * frame_len..(i + 1) * frame_len];
            frame
                .iter()
                .map(|&s| {
                    let v = f32::from(s) / 32_768.0;
                    v * v
                })
                .sum::<f32>()
                / frame_len as f32
        })
        .collect();
    let peak = energy.iter().cloned().fold(0.0f32, f32::max).max(f32::MIN_POSITIVE);

    // Midpoints of silent stretches long enough to be word gaps.
    let mut boundaries = Vec::new();
    let mut silence_start: Option<usize> = None;
    for (i, &e) in energy.iter().enumerate() {
        let silent = e < peak * SILENCE_THRESHOLD;
        match (silent, silence_start) {
            (true, None) => silence_start = Some(i),
            (false, Some(start)) => {
                if (i - start) * frame_len >= SILENCE_MIN_SAMPLES {
                    boundaries.push(((start + i) / 2) * frame_len);
                }
                silence_start = None;
            }
            _ => {}
        }
    }

    if boundaries.len() < n_words - 1 {
        // Not enough silent gaps found, fall back to equal division.
        let segment_len = samples.len() / n_words;
        return (0..n_words)
            .map(|i| (i * segment_len, (i + 1) * segment_len))
            .collect();
    }

    boundaries.truncate(n_words - 1);
    let mut segments = Vec::with_capacity(n_words);
    let mut prev = 0;
    for b in boundaries {
        segments.push((prev, b));
        prev = b;
    }
    segments.push((prev, samples.len()));
    segments
}

/// Join word PCM segments with short silence gaps, crossfading the joins
/// to avoid clicks.
pub fn assemble_word_audio(word_pcms: &[Vec<u8>]) -> Vec<u8> {
    match word_pcms {
        [] => return Vec::new(),
        [only] => return only.clone(),
        _ => {}
    }

    let gap = vec![0i16; WORD_GAP_SAMPLES];
    let mut out: Vec<i16> = Vec::new();
    let last = word_pcms.len() - 1;
    for (i, pcm) in word_pcms.iter().enumerate() {
        let mut samples = samples_from_pcm(pcm);
        if samples.len() > CROSSFADE_SAMPLES {
            if i < last {
                fade(&mut samples, CROSSFADE_SAMPLES, false);
            }
            if i > 0 {
                fade(&mut samples, CROSSFADE_SAMPLES, true);
            }
        }
        out.extend_from_slice(&samples);
        if i < last {
            out.extend_from_slice(&gap);
        }
    }
    pcm_from_samples(&out)
}

/// Linear fade over `len` samples at the start (`fade_in`) or end of a buffer.
fn fade(samples: &mut [i16], len: usize, fade_in: bool) {
    let n = len.min(samples.len());
    for i in 0..n {
        let ramp = i as f32 / len as f32;
        if fade_in {
            samples[i] = (f32::from(samples[i]) * ramp) as i16;
        } else {
            let j = samples.len() - n + i;
            samples[j] = (f32::from(samples[j]) * (1.0 - ramp)) as i16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_round_trip() {
        let samples = vec![0i16, 1000, -1000, i16::MAX, i16::MIN];
        assert_eq!(samples_from_pcm(&pcm_from_samples(&samples)), samples);
    }

    #[test]
    fn duration_of_one_second() {
        let pcm = vec![0u8; SAMPLE_RATE as usize * BYTES_PER_SAMPLE];
        assert!((pcm_duration_secs(pcm.len()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn gain_doubles_and_clips() {
        let pcm = pcm_from_samples(&[100, -100, 30_000]);
        let boosted = samples_from_pcm(&apply_gain(&pcm, 2.0));
        assert_eq!(boosted[0], 200);
        assert_eq!(boosted[1], -200);
        assert_eq!(boosted[2], 32_767); // clipped
    }

    #[test]
    fn unity_gain_is_identity() {
        let pcm = pcm_from_samples(&[1, 2, 3]);
        assert_eq!(apply_gain(&pcm, 1.0), pcm);
    }

    #[test]
    fn boundaries_split_tone_silence_tone() {
        // 200ms tone, 100ms silence, 200ms tone.
        let tone_len = SAMPLE_RATE as usize / 5;
        let gap_len = SAMPLE_RATE as usize / 10;
        let mut samples = Vec::new();
        for i in 0..tone_len {
            samples.push(((i as f32 * 0.05).sin() * 20_000.0) as i16);
        }
        samples.extend(std::iter::repeat(0i16).take(gap_len));
        for i in 0..tone_len {
            samples.push(((i as f32 * 0.05).sin() * 20_000.0) as i16);
        }

        let segments = detect_word_boundaries(&samples, 2);
        assert_eq!(segments.len(), 2);
        // The boundary must fall inside the silent gap.
        let boundary = segments[0].1;
        assert!(boundary > tone_len && boundary < tone_len + gap_len + 1000);
    }

    #[test]
    fn equal_division_fallback() {
        // Constant loud signal has no silent gap.
        let samples = vec![20_000i16; SAMPLE_RATE as usize];
        let segments = detect_word_boundaries(&samples, 4);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0], (0, samples.len() / 4));
    }

    #[test]
    fn assembly_inserts_gaps() {
        let word = pcm_from_samples(&vec![5_000i16; 2_000]);
        let joined = assemble_word_audio(&[word.clone(), word.clone()]);
        let expected_samples = 2_000 * 2 + WORD_GAP_SAMPLES;
        assert_eq!(joined.len(), expected_samples * BYTES_PER_SAMPLE);
    }

    #[test]
    fn assembly_of_single_word_is_identity() {
        let word = pcm_from_samples(&[1, 2, 3, 4]);
        assert_eq!(assemble_word_audio(std::slice::from_ref(&word)), word);
    }
}
