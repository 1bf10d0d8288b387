//! Real-time voice pipeline: activity detection, staged STT/LLM/TTS
//! composition, and session lifecycle management.

pub mod messages;
pub mod pipeline;
pub mod session;
pub mod vad;

pub use messages::{
    AudioChunk, LlmToken, PipelineEvent, SentenceChunk, SpeechSegment, SynthesizedAudio,
    Transcription,
};
pub use pipeline::{PipelineComponents, VoicePipeline};
pub use session::{PipelineFactory, SessionState, VoiceSession};
pub use vad::{VadFrame, VoiceActivityDetector};
