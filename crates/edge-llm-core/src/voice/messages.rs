//! Message types passed between voice pipeline stages.
//!
//! Shapes grounded in `saorsa-labs-fae`'s `pipeline/messages.rs`.

use std::time::Instant;

/// A chunk of raw audio samples from the capture source.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples at the configured input sample rate.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub captured_at: Instant,
}

/// A complete speech segment detected by VAD, ready for STT.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub started_at: Instant,
}

impl SpeechSegment {
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// A transcription result from the STT stage.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub is_final: bool,
    pub audio_captured_at: Instant,
    pub transcribed_at: Instant,
}

/// A single token emitted by the LLM during streaming generation.
#[derive(Debug, Clone)]
pub struct LlmToken {
    pub text: String,
    pub is_end: bool,
}

/// A sentence accumulated from LLM tokens, ready for TTS.
#[derive(Debug, Clone)]
pub struct SentenceChunk {
    pub text: String,
    pub is_final: bool,
}

/// Synthesized audio from TTS, ready for playback.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub is_final: bool,
}

/// Events a pipeline or session emits as a segment moves through its stages.
/// Ordering within one segment is strict: `SegmentStarted` before any
/// `Partial*`, before the matching `*Final`/`SegmentCompleted`. `SpeechStarted`
/// and `SpeechEnded` are VAD-level and fire independently of whether the
/// buffered audio is long enough to become a segment; a short utterance
/// produces `SpeechStarted` then `SpeechEnded { had_transcript: false }` with
/// no `SegmentStarted` at all.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    ComponentInitStarted { component: &'static str },
    ComponentInitOk { component: &'static str },
    ComponentInitFailed { component: &'static str, message: String },
    PipelineStarted,
    SpeechStarted,
    SpeechEnded { had_transcript: bool },
    SegmentStarted { segment_id: u64 },
    Transcribed { segment_id: u64, transcription: Transcription },
    LlmToken { segment_id: u64, token: LlmToken },
    SentenceReady { segment_id: u64, sentence: SentenceChunk },
    AudioReady { segment_id: u64, audio: SynthesizedAudio },
    SegmentCompleted { segment_id: u64 },
    SegmentFailed { segment_id: u64, stage: crate::error::PipelineStage, message: String },
    PipelineCompleted,
    PipelineError { message: String },
}
