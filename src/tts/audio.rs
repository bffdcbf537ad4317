//! Audio post-processing for synthesized sentences
//!
//! Everything here operates on float32 samples; quantization to 16-bit PCM
//! happens exactly once per sentence chunk, after fades and silence have been
//! applied, so boundary samples are never rounded twice.

use std::f32::consts::PI;

use crate::tts::SAMPLE_RATE;

/// Default raised-cosine fade length at sentence edges.
pub const DEFAULT_FADE_MS: u32 = 6;

/// Trailing pause after a sentence, keyed by its trimmed terminator.
#[derive(Debug, Clone, Copy)]
pub struct PausePolicy {
    pub sentence_ms: u32,
    pub period_ms: u32,
    pub exclaim_ms: u32,
    pub question_ms: u32,
    pub paragraph_extra_ms: u32,
}

impl Default for PausePolicy {
    fn default() -> Self {
        Self {
            sentence_ms: 120,
            period_ms: 180,
            exclaim_ms: 200,
            question_ms: 260,
            paragraph_extra_ms: 240,
        }
    }
}

impl PausePolicy {
    /// Pause duration for a sentence, in milliseconds.
    pub fn pause_ms(&self, sentence: &str, is_last_in_paragraph: bool) -> u32 {
        let trimmed = sentence.trim_end();
        let mut base = match trimmed.chars().last() {
            Some('?') => self.question_ms,
            Some('!') => self.exclaim_ms,
            Some('.') => self.period_ms,
            _ => self.sentence_ms,
        };
        if is_last_in_paragraph {
            base += self.paragraph_extra_ms;
        }
        base
    }

    /// Pause duration converted to samples at the pipeline rate.
    pub fn pause_samples(&self, sentence: &str, is_last_in_paragraph: bool) -> usize {
        let ms = self.pause_ms(sentence, is_last_in_paragraph);
        (SAMPLE_RATE as u64 * ms as u64 / 1000) as usize
    }
}

/// Apply a raised-cosine fade-in and fade-out in place.
///
/// The ramp is `0.5 * (1 - cos(pi * i / n))`; the fade-out multiplies the
/// tail by the reversed ramp. Fades shorter than two samples are skipped, and
/// the fade never covers more than half the sentence.
pub fn apply_edge_fade(samples: &mut [f32], fade_ms: u32) {
    if samples.is_empty() || fade_ms == 0 {
        return;
    }
    let requested = (SAMPLE_RATE as u64 * fade_ms as u64 / 1000) as usize;
    let fade = requested.min(samples.len() / 2);
    if fade < 2 {
        return;
    }

    for i in 0..fade {
        let gain = 0.5 * (1.0 - (PI * i as f32 / fade as f32).cos());
        samples[i] *= gain;
    }
    let len = samples.len();
    for i in 0..fade {
        let gain = 0.5 * (1.0 - (PI * i as f32 / fade as f32).cos());
        samples[len - 1 - i] *= gain;
    }
}

/// Quantize float samples to little-endian signed 16-bit PCM bytes.
pub fn to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let q = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&q.to_le_bytes());
    }
    out
}

/// Bytes per frame for a given frame duration: two bytes per sample, sample
/// count rounded to the nearest whole sample.
pub fn frame_bytes(frame_ms: u32) -> usize {
    2 * ((SAMPLE_RATE as u64 * frame_ms as u64 + 500) / 1000) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_durations_by_terminator() {
        let policy = PausePolicy::default();
        assert_eq!(policy.pause_ms("Really?", false), 260);
        assert_eq!(policy.pause_ms("Go!", false), 200);
        assert_eq!(policy.pause_ms("Done.", false), 180);
        assert_eq!(policy.pause_ms("unterminated", false), 120);
    }

    #[test]
    fn test_paragraph_end_adds_extra_pause() {
        let policy = PausePolicy::default();
        assert_eq!(policy.pause_ms("Done.", true), 180 + 240);
        assert_eq!(policy.pause_ms("unterminated", true), 120 + 240);
    }

    #[test]
    fn test_pause_ignores_trailing_whitespace() {
        let policy = PausePolicy::default();
        assert_eq!(policy.pause_ms("Really?  ", false), 260);
    }

    #[test]
    fn test_pause_samples_at_24khz() {
        let policy = PausePolicy::default();
        // 180 ms at 24 kHz.
        assert_eq!(policy.pause_samples("Done.", false), 4320);
    }

    #[test]
    fn test_fade_tapers_edges() {
        let mut samples = vec![1.0f32; 24_000];
        apply_edge_fade(&mut samples, 6);
        let fade = 144; // 6 ms at 24 kHz

        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[24_000 - 1], 0.0);
        // Ramp is monotonic on the way in and symmetric on the way out.
        for i in 1..fade {
            assert!(samples[i] > samples[i - 1]);
            assert!((samples[i] - samples[24_000 - 1 - i]).abs() < 1e-6);
        }
        // Interior untouched.
        assert_eq!(samples[12_000], 1.0);
    }

    #[test]
    fn test_fade_skipped_for_tiny_input() {
        let mut samples = vec![1.0f32; 3];
        apply_edge_fade(&mut samples, 6);
        assert_eq!(samples, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_fade_clamped_to_half_length() {
        let mut samples = vec![1.0f32; 100];
        apply_edge_fade(&mut samples, 1000);
        // Fade covers exactly half; the midpoint boundary samples were scaled.
        assert!(samples[49] < 1.0);
        assert!(samples[50] < 1.0);
    }

    #[test]
    fn test_quantization_clamps_overrange() {
        let bytes = to_pcm16_bytes(&[0.0, 1.0, -1.0, 2.0, -2.0]);
        let decoded: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(decoded, vec![0, 32767, -32767, 32767, -32768]);
    }

    #[test]
    fn test_frame_bytes_for_200ms() {
        assert_eq!(frame_bytes(200), 9600);
    }
}
