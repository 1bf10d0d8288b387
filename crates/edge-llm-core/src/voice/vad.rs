//! Voice Activity Detector (C8).
//!
//! Streaming energy-based VAD at 16 kHz mono. Grounded on
//! `saorsa-labs-fae`'s RMS-energy detector (`vad/mod.rs`): the same
//! above-threshold/in-speech state machine and a lower "content present"
//! threshold that keeps low-energy trailing audio attached to an
//! already-started segment rather than chopping it off. The documented
//! default constants (100 ms frame, 0.025/0.005 RMS thresholds, 1.0 s
//! minimum speech) are this crate's own ([`VadConfig::default`]) rather
//! than fae's own tuning, which targets a different microphone chain.

use crate::config::VadConfig;
use crate::voice::messages::AudioChunk;

/// Per-frame VAD result. The VAD does not buffer audio; that is the
/// pipeline's responsibility.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadFrame {
    pub is_speech: bool,
    pub speech_started: bool,
    pub speech_ended: bool,
    pub rms: f32,
}

/// Streaming RMS-energy voice activity detector.
pub struct VoiceActivityDetector {
    config: VadConfig,
    in_speech: bool,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            in_speech: false,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Samples per configured frame, for callers that chunk audio to match.
    pub fn frame_samples(&self) -> usize {
        (self.config.frame_length_seconds * self.config.sample_rate as f64) as usize
    }

    /// Process one frame's worth of audio and report the edge transitions
    /// observed on this call. A transition only fires across a full frame
    /// boundary, so a single noisy sample cannot flap the state within one
    /// call.
    pub fn process_frame(&mut self, chunk: &AudioChunk) -> VadFrame {
        let rms = rms_energy(&chunk.samples);

        let candidate_speech = if rms > self.config.energy_threshold {
            true
        } else if self.in_speech {
            rms > self.config.content_present_threshold
        } else {
            false
        };

        let speech_started = candidate_speech && !self.in_speech;
        let speech_ended = !candidate_speech && self.in_speech;

        self.in_speech = candidate_speech;

        VadFrame {
            is_speech: candidate_speech,
            speech_started,
            speech_ended,
            rms,
        }
    }

    pub fn reset(&mut self) {
        self.in_speech = false;
    }
}

fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn chunk(samples: Vec<f32>) -> AudioChunk {
        AudioChunk {
            samples,
            sample_rate: 16_000,
            captured_at: Instant::now(),
        }
    }

    fn loud(n: usize) -> Vec<f32> {
        vec![0.5; n]
    }

    fn silent(n: usize) -> Vec<f32> {
        vec![0.0; n]
    }

    #[test]
    fn silence_never_flags_speech() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        let result = vad.process_frame(&chunk(silent(1600)));
        assert!(!result.is_speech);
        assert!(!result.speech_started);
    }

    #[test]
    fn loud_frame_after_silence_starts_speech() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.process_frame(&chunk(silent(1600)));
        let result = vad.process_frame(&chunk(loud(1600)));
        assert!(result.is_speech);
        assert!(result.speech_started);
    }

    #[test]
    fn trailing_low_energy_frame_stays_in_speech_via_content_present_threshold() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.process_frame(&chunk(loud(1600)));
        // Below the main threshold but above content-present: should not end.
        let trailing = vec![0.01; 1600];
        let result = vad.process_frame(&chunk(trailing));
        assert!(result.is_speech);
        assert!(!result.speech_ended);
    }

    #[test]
    fn true_silence_after_speech_ends_the_segment() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.process_frame(&chunk(loud(1600)));
        let result = vad.process_frame(&chunk(silent(1600)));
        assert!(!result.is_speech);
        assert!(result.speech_ended);
    }

    #[test]
    fn no_single_frame_flap_without_a_transition() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.process_frame(&chunk(loud(1600)));
        let steady = vad.process_frame(&chunk(loud(1600)));
        assert!(!steady.speech_started);
        assert!(!steady.speech_ended);
    }
}
