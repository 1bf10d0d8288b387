//! UniFFI bindings for edge-llm-core.
//!
//! This crate provides cross-language bindings for the edge-llm-core
//! library, enabling native access from Python, C#, Swift, Kotlin, Go, and
//! Ruby to on-device model management, download, inference and voice
//! pipelines.
//!
//! # Supported Languages
//!
//! - **Python** - Official UniFFI support
//! - **C#** - Via uniffi-bindgen-cs
//! - **Kotlin** - Official UniFFI support
//! - **Swift** - Official UniFFI support
//! - **Ruby** - Official UniFFI support
//! - **Go** - Via uniffi-bindgen-go
//!
//! # Usage
//!
//! Generate bindings using `--library` mode:
//!
//! ```bash
//! # Build the cdylib
//! cargo build -p edge-llm-uniffi --release
//!
//! # Generate Python bindings
//! edge-llm-uniffi-bindgen generate --library --language python \
//!     --out-dir ./bindings/python target/release/libedge_llm_uniffi.so
//!
//! # Generate C# bindings
//! uniffi-bindgen-cs --library --config crates/edge-llm-uniffi/uniffi.toml \
//!     --out-dir ./bindings/csharp target/release/libedge_llm_uniffi.so
//! ```

use edge_llm_core::adapters::{FinishReason, GenerationOptions, GenerationResult};
use edge_llm_core::format::{DetectionResult, ModelFormat};
use edge_llm_core::registry::{FrameworkTag, ModelDescriptor};
use edge_llm_core::voice::{
    AudioChunk, LlmToken, PipelineComponents, PipelineEvent, PipelineFactory, SentenceChunk,
    SessionState, SynthesizedAudio, Transcription, VoiceActivityDetector, VoiceSession,
};
use edge_llm_core::{DownloadStatistics, EdgeLlmCore, RuntimeError};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;

/// FFI-friendly error type.
///
/// This is a simplified view of `RuntimeError` that can cross the FFI
/// boundary. Variants that carry a `std::io::Error`/`reqwest::Error` source
/// are converted to their string representation.
#[derive(Debug, Clone, uniffi::Error, thiserror::Error)]
pub enum FfiError {
    #[error("invalid URL: {message}")]
    InvalidUrl { message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("request timed out: {message}")]
    Timeout { message: String },

    #[error("partial download: {message}")]
    PartialDownload { message: String },

    #[error("checksum mismatch: {message}")]
    ChecksumMismatch { message: String },

    #[error("archive extraction failed: {message}")]
    ExtractionFailed { message: String },

    #[error("unsupported archive extension: {message}")]
    UnsupportedArchive { message: String },

    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("HTTP error: {message}")]
    Http { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("insufficient space: {message}")]
    InsufficientSpace { message: String },

    #[error("model not found: {id}")]
    ModelNotFound { id: String },

    #[error("unsupported format: {message}")]
    UnsupportedFormat { message: String },

    #[error("not initialized")]
    NotInitialized,

    #[error("no compatible backend for model {model_id}")]
    NoCompatibleBackend { model_id: String },

    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{stage} error: {message}")]
    Pipeline { stage: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl From<RuntimeError> for FfiError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::InvalidUrl(message) => FfiError::InvalidUrl { message },
            RuntimeError::Network { message, .. } => FfiError::Network { message },
            RuntimeError::Timeout(duration) => FfiError::Timeout {
                message: format!("timed out after {:?}", duration),
            },
            RuntimeError::PartialDownload { got, expected } => FfiError::PartialDownload {
                message: format!("got {} of {:?} bytes", got, expected),
            },
            RuntimeError::ChecksumMismatch { expected, actual } => FfiError::ChecksumMismatch {
                message: format!("expected {}, got {}", expected, actual),
            },
            RuntimeError::ExtractionFailed { reason } => {
                FfiError::ExtractionFailed { message: reason }
            }
            RuntimeError::UnsupportedArchive { extension } => {
                FfiError::UnsupportedArchive { message: extension }
            }
            RuntimeError::InvalidResponse { url, message } => FfiError::InvalidResponse {
                message: format!("{}: {}", url, message),
            },
            RuntimeError::Http { status } => FfiError::Http {
                message: format!("HTTP {}", status),
            },
            RuntimeError::Cancelled => FfiError::Cancelled,
            RuntimeError::InsufficientSpace { needed, available } => FfiError::InsufficientSpace {
                message: format!("need {} bytes, {} available", needed, available),
            },
            RuntimeError::ModelNotFound { id } => FfiError::ModelNotFound { id },
            RuntimeError::UnsupportedFormat(message) => FfiError::UnsupportedFormat { message },
            RuntimeError::NotInitialized => FfiError::NotInitialized,
            RuntimeError::NoCompatibleBackend { model_id } => {
                FfiError::NoCompatibleBackend { model_id }
            }
            RuntimeError::ResourceExhausted(message) => FfiError::ResourceExhausted { message },
            RuntimeError::Io { message, path, .. } => FfiError::Io {
                message: match path {
                    Some(p) => format!("{}: {}", p.display(), message),
                    None => message,
                },
            },
            RuntimeError::Config { message } => FfiError::Config { message },
            RuntimeError::Validation { field, message } => FfiError::Validation { field, message },
            RuntimeError::Pipeline { stage, message } => FfiError::Pipeline {
                stage: stage.to_string(),
                message,
            },
            RuntimeError::Unknown(message) => FfiError::Other(message),
        }
    }
}

/// Result type for FFI operations.
pub type FfiResult<T> = Result<T, FfiError>;

// UniFFI scaffolding - this generates the FFI glue code
uniffi::setup_scaffolding!();

/// Get the version of the edge-llm-uniffi bindings.
#[uniffi::export]
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

// =============================================================================
// FFI Wrapper Types
//
// Wrap edge-llm-core types that contain FFI-incompatible fields
// (HashMap, std::time::Instant, trait objects). HashMaps become a Vec of
// key-value records; framework/format tags get a local FFI-safe enum mirror.
// =============================================================================

/// A metadata key-value pair for a model descriptor.
///
/// Used instead of `HashMap<String, String>` which can't cross the FFI
/// boundary.
#[derive(uniffi::Record)]
pub struct FfiMetadataEntry {
    pub key: String,
    pub value: String,
}

/// Mirror of `edge_llm_core::registry::FrameworkTag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiFrameworkTag {
    CoreMlClass,
    TfliteClass,
    OnnxClass,
    LlamaCppClass,
    ExecuTorchClass,
    MlxClass,
    MediaPipeClass,
    PicoLlmClass,
    PlatformFoundationClass,
    WhisperKitClass,
    SystemTtsClass,
}

impl From<FrameworkTag> for FfiFrameworkTag {
    fn from(tag: FrameworkTag) -> Self {
        match tag {
            FrameworkTag::CoreMlClass => FfiFrameworkTag::CoreMlClass,
            FrameworkTag::TfliteClass => FfiFrameworkTag::TfliteClass,
            FrameworkTag::OnnxClass => FfiFrameworkTag::OnnxClass,
            FrameworkTag::LlamaCppClass => FfiFrameworkTag::LlamaCppClass,
            FrameworkTag::ExecuTorchClass => FfiFrameworkTag::ExecuTorchClass,
            FrameworkTag::MlxClass => FfiFrameworkTag::MlxClass,
            FrameworkTag::MediaPipeClass => FfiFrameworkTag::MediaPipeClass,
            FrameworkTag::PicoLlmClass => FfiFrameworkTag::PicoLlmClass,
            FrameworkTag::PlatformFoundationClass => FfiFrameworkTag::PlatformFoundationClass,
            FrameworkTag::WhisperKitClass => FfiFrameworkTag::WhisperKitClass,
            FrameworkTag::SystemTtsClass => FfiFrameworkTag::SystemTtsClass,
        }
    }
}

impl From<FfiFrameworkTag> for FrameworkTag {
    fn from(tag: FfiFrameworkTag) -> Self {
        match tag {
            FfiFrameworkTag::CoreMlClass => FrameworkTag::CoreMlClass,
            FfiFrameworkTag::TfliteClass => FrameworkTag::TfliteClass,
            FfiFrameworkTag::OnnxClass => FrameworkTag::OnnxClass,
            FfiFrameworkTag::LlamaCppClass => FrameworkTag::LlamaCppClass,
            FfiFrameworkTag::ExecuTorchClass => FrameworkTag::ExecuTorchClass,
            FfiFrameworkTag::MlxClass => FrameworkTag::MlxClass,
            FfiFrameworkTag::MediaPipeClass => FrameworkTag::MediaPipeClass,
            FfiFrameworkTag::PicoLlmClass => FrameworkTag::PicoLlmClass,
            FfiFrameworkTag::PlatformFoundationClass => FrameworkTag::PlatformFoundationClass,
            FfiFrameworkTag::WhisperKitClass => FrameworkTag::WhisperKitClass,
            FfiFrameworkTag::SystemTtsClass => FrameworkTag::SystemTtsClass,
        }
    }
}

/// Mirror of `edge_llm_core::format::ModelFormat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiModelFormat {
    Mlmodel,
    Mlpackage,
    Tflite,
    Onnx,
    Ort,
    Safetensors,
    Gguf,
    Ggml,
    Pte,
    Bin,
    Unknown,
}

impl From<ModelFormat> for FfiModelFormat {
    fn from(format: ModelFormat) -> Self {
        match format {
            ModelFormat::Mlmodel => FfiModelFormat::Mlmodel,
            ModelFormat::Mlpackage => FfiModelFormat::Mlpackage,
            ModelFormat::Tflite => FfiModelFormat::Tflite,
            ModelFormat::Onnx => FfiModelFormat::Onnx,
            ModelFormat::Ort => FfiModelFormat::Ort,
            ModelFormat::Safetensors => FfiModelFormat::Safetensors,
            ModelFormat::Gguf => FfiModelFormat::Gguf,
            ModelFormat::Ggml => FfiModelFormat::Ggml,
            ModelFormat::Pte => FfiModelFormat::Pte,
            ModelFormat::Bin => FfiModelFormat::Bin,
            ModelFormat::Unknown => FfiModelFormat::Unknown,
        }
    }
}

/// FFI-safe wrapper for `ModelDescriptor`.
///
/// `compatible_frameworks`/`preferred_framework` use `FfiFrameworkTag`;
/// `metadata` is converted from `HashMap<String, String>` to
/// `Vec<FfiMetadataEntry>`.
#[derive(uniffi::Record)]
pub struct FfiModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub format: FfiModelFormat,
    pub remote_url: Option<String>,
    pub local_path: Option<String>,
    pub checksum: Option<String>,
    pub size_bytes: Option<u64>,
    pub context_length: Option<u64>,
    pub estimated_memory_bytes: Option<u64>,
    pub compatible_frameworks: Vec<FfiFrameworkTag>,
    pub preferred_framework: Option<FfiFrameworkTag>,
    pub tokenizer_tag: Option<String>,
    pub supports_thinking: bool,
    pub metadata: Vec<FfiMetadataEntry>,
}

impl From<ModelDescriptor> for FfiModelDescriptor {
    fn from(d: ModelDescriptor) -> Self {
        Self {
            id: d.id,
            display_name: d.display_name,
            format: d.format.into(),
            remote_url: d.remote_url,
            local_path: d.local_path.map(|p| p.display().to_string()),
            checksum: d.checksum,
            size_bytes: d.size_bytes,
            context_length: d.context_length,
            estimated_memory_bytes: d.estimated_memory_bytes,
            compatible_frameworks: d.compatible_frameworks.into_iter().map(Into::into).collect(),
            preferred_framework: d.preferred_framework.map(Into::into),
            tokenizer_tag: d.tokenizer_tag,
            supports_thinking: d.supports_thinking,
            metadata: d
                .metadata
                .into_iter()
                .map(|(key, value)| FfiMetadataEntry { key, value })
                .collect(),
        }
    }
}

/// FFI-safe wrapper for `DetectionResult`, flattening `ModelMetadata`'s
/// fields directly onto the record rather than nesting a second type.
#[derive(uniffi::Record)]
pub struct FfiDetectionResult {
    pub format: FfiModelFormat,
    pub author: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub model_type: Option<String>,
    pub architecture: Option<String>,
    pub quantization: Option<String>,
    pub context_length: Option<u64>,
    pub parameter_count: Option<u64>,
    pub min_memory_bytes: Option<u64>,
    pub tokenizer: Option<String>,
}

impl From<DetectionResult> for FfiDetectionResult {
    fn from(r: DetectionResult) -> Self {
        Self {
            format: r.format.into(),
            author: r.metadata.author,
            description: r.metadata.description,
            version: r.metadata.version,
            model_type: r.metadata.model_type,
            architecture: r.metadata.architecture,
            quantization: r.metadata.quantization,
            context_length: r.metadata.context_length,
            parameter_count: r.metadata.parameter_count,
            min_memory_bytes: r.metadata.min_memory_bytes,
            tokenizer: r.metadata.tokenizer.map(|t| format!("{:?}", t)),
        }
    }
}

/// FFI-safe mirror of `GenerationOptions`.
#[derive(uniffi::Record)]
pub struct FfiGenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
}

impl Default for FfiGenerationOptions {
    fn default() -> Self {
        GenerationOptions::default().into()
    }
}

impl From<GenerationOptions> for FfiGenerationOptions {
    fn from(o: GenerationOptions) -> Self {
        Self {
            temperature: o.temperature,
            top_p: o.top_p,
            max_tokens: o.max_tokens,
            stop_sequences: o.stop_sequences,
        }
    }
}

impl From<FfiGenerationOptions> for GenerationOptions {
    fn from(o: FfiGenerationOptions) -> Self {
        Self {
            temperature: o.temperature,
            top_p: o.top_p,
            max_tokens: o.max_tokens,
            stop_sequences: o.stop_sequences,
        }
    }
}

/// Mirror of `FinishReason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiFinishReason {
    Stop,
    MaxTokens,
    StopSequence,
}

impl From<FinishReason> for FfiFinishReason {
    fn from(r: FinishReason) -> Self {
        match r {
            FinishReason::Stop => FfiFinishReason::Stop,
            FinishReason::MaxTokens => FfiFinishReason::MaxTokens,
            FinishReason::StopSequence => FfiFinishReason::StopSequence,
        }
    }
}

/// FFI-safe mirror of `GenerationResult`.
#[derive(uniffi::Record)]
pub struct FfiGenerationResult {
    pub text: String,
    pub tokens_generated: u32,
    pub tokens_per_second: f32,
    pub finish_reason: Option<FfiFinishReason>,
}

impl From<GenerationResult> for FfiGenerationResult {
    fn from(r: GenerationResult) -> Self {
        Self {
            text: r.text,
            tokens_generated: r.tokens_generated,
            tokens_per_second: r.tokens_per_second,
            finish_reason: r.finish_reason.map(Into::into),
        }
    }
}

/// FFI-safe mirror of `DownloadStatistics`.
#[derive(uniffi::Record)]
pub struct FfiDownloadStatistics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub bytes_downloaded: u64,
}

impl From<DownloadStatistics> for FfiDownloadStatistics {
    fn from(s: DownloadStatistics) -> Self {
        Self {
            submitted: s.submitted,
            completed: s.completed,
            failed: s.failed,
            cancelled: s.cancelled,
            bytes_downloaded: s.bytes_downloaded,
        }
    }
}

/// A download submitted to the engine. Progress is read back through
/// `FfiEdgeLlmCore::active_downloads`/`download_statistics` rather than by
/// draining the task's own event channel, since that channel's receiver end
/// is not FFI-safe; the task itself is dropped once its id is reported.
#[derive(uniffi::Record)]
pub struct FfiDownloadTask {
    pub task_id: String,
    pub model_id: String,
}

/// Mirror of `SessionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiSessionState {
    Disconnected,
    Connecting,
    Connected,
    Listening,
    Processing,
    Speaking,
    Error,
}

impl From<SessionState> for FfiSessionState {
    fn from(s: SessionState) -> Self {
        match s {
            SessionState::Disconnected => FfiSessionState::Disconnected,
            SessionState::Connecting => FfiSessionState::Connecting,
            SessionState::Connected => FfiSessionState::Connected,
            SessionState::Listening => FfiSessionState::Listening,
            SessionState::Processing => FfiSessionState::Processing,
            SessionState::Speaking => FfiSessionState::Speaking,
            SessionState::Error => FfiSessionState::Error,
        }
    }
}

/// FFI-safe mirror of `PipelineEvent`, flattening each stage message's own
/// few fields directly onto the matching variant and dropping the
/// `std::time::Instant` timestamps that can't cross the FFI boundary.
#[derive(Debug, Clone, uniffi::Enum)]
pub enum FfiPipelineEvent {
    ComponentInitStarted {
        component: String,
    },
    ComponentInitOk {
        component: String,
    },
    ComponentInitFailed {
        component: String,
        message: String,
    },
    PipelineStarted,
    SpeechStarted,
    SpeechEnded {
        had_transcript: bool,
    },
    SegmentStarted {
        segment_id: u64,
    },
    Transcribed {
        segment_id: u64,
        text: String,
        is_final: bool,
    },
    LlmToken {
        segment_id: u64,
        text: String,
        is_end: bool,
    },
    SentenceReady {
        segment_id: u64,
        text: String,
        is_final: bool,
    },
    AudioReady {
        segment_id: u64,
        samples: Vec<f32>,
        sample_rate: u32,
        is_final: bool,
    },
    SegmentCompleted {
        segment_id: u64,
    },
    SegmentFailed {
        segment_id: u64,
        stage: String,
        message: String,
    },
    PipelineCompleted,
    PipelineError {
        message: String,
    },
}

impl From<PipelineEvent> for FfiPipelineEvent {
    fn from(event: PipelineEvent) -> Self {
        match event {
            PipelineEvent::ComponentInitStarted { component } => {
                FfiPipelineEvent::ComponentInitStarted { component: component.to_string() }
            }
            PipelineEvent::ComponentInitOk { component } => {
                FfiPipelineEvent::ComponentInitOk { component: component.to_string() }
            }
            PipelineEvent::ComponentInitFailed { component, message } => {
                FfiPipelineEvent::ComponentInitFailed { component: component.to_string(), message }
            }
            PipelineEvent::PipelineStarted => FfiPipelineEvent::PipelineStarted,
            PipelineEvent::SpeechStarted => FfiPipelineEvent::SpeechStarted,
            PipelineEvent::SpeechEnded { had_transcript } => {
                FfiPipelineEvent::SpeechEnded { had_transcript }
            }
            PipelineEvent::SegmentStarted { segment_id } => {
                FfiPipelineEvent::SegmentStarted { segment_id }
            }
            PipelineEvent::Transcribed {
                segment_id,
                transcription: Transcription { text, is_final, .. },
            } => FfiPipelineEvent::Transcribed {
                segment_id,
                text,
                is_final,
            },
            PipelineEvent::LlmToken {
                segment_id,
                token: LlmToken { text, is_end },
            } => FfiPipelineEvent::LlmToken {
                segment_id,
                text,
                is_end,
            },
            PipelineEvent::SentenceReady {
                segment_id,
                sentence: SentenceChunk { text, is_final },
            } => FfiPipelineEvent::SentenceReady {
                segment_id,
                text,
                is_final,
            },
            PipelineEvent::AudioReady {
                segment_id,
                audio:
                    SynthesizedAudio {
                        samples,
                        sample_rate,
                        is_final,
                    },
            } => FfiPipelineEvent::AudioReady {
                segment_id,
                samples,
                sample_rate,
                is_final,
            },
            PipelineEvent::SegmentCompleted { segment_id } => {
                FfiPipelineEvent::SegmentCompleted { segment_id }
            }
            PipelineEvent::SegmentFailed {
                segment_id,
                stage,
                message,
            } => FfiPipelineEvent::SegmentFailed {
                segment_id,
                stage: stage.to_string(),
                message,
            },
            PipelineEvent::PipelineCompleted => FfiPipelineEvent::PipelineCompleted,
            PipelineEvent::PipelineError { message } => FfiPipelineEvent::PipelineError { message },
        }
    }
}

/// Builds a pipeline over the facade's own inference service with VAD
/// enabled and no STT/TTS stage; a dedicated adapter for those stages is
/// supplied by the host application rather than this binding crate.
struct LlmOnlyFactory {
    core: Arc<EdgeLlmCore>,
}

impl PipelineFactory for LlmOnlyFactory {
    fn build(&self) -> PipelineComponents {
        PipelineComponents {
            vad: Some(VoiceActivityDetector::new(self.core.config().vad.clone())),
            stt: None,
            llm: Some(self.core.inference().clone()),
            tts: None,
        }
    }
}

// =============================================================================
// FfiEdgeLlmCore — The main API object exposed to foreign languages
// =============================================================================

/// Configuration for creating an `FfiEdgeLlmCore` instance.
#[derive(uniffi::Record)]
pub struct FfiCoreConfig {
    /// Path to the app data root directory.
    pub app_data_root: String,
    /// Create the root directory (and its children) if it doesn't exist.
    pub auto_create_dirs: bool,
}

/// A live voice session. The caller holds the handle itself; there is no
/// separate id-based lookup the way the JSON-RPC server needs one.
#[derive(uniffi::Object)]
pub struct FfiVoiceSession {
    inner: VoiceSession,
}

#[uniffi::export(async_runtime = "tokio")]
impl FfiVoiceSession {
    pub async fn connect(&self) -> FfiResult<()> {
        self.inner.connect().await.map_err(Into::into)
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    pub async fn start_listening(&self) -> FfiResult<()> {
        self.inner.start_listening().await.map_err(Into::into)
    }

    pub async fn stop_listening(&self) -> FfiResult<()> {
        self.inner.stop_listening().await.map_err(Into::into)
    }

    pub async fn interrupt(&self) -> FfiResult<()> {
        self.inner.interrupt().await.map_err(Into::into)
    }

    pub async fn state(&self) -> FfiSessionState {
        self.inner.state().await.into()
    }

    /// Push a chunk of mono `f32` samples captured at `sample_rate`.
    pub async fn ingest_audio(&self, samples: Vec<f32>, sample_rate: u32) -> FfiResult<()> {
        self.inner
            .ingest_audio(AudioChunk {
                samples,
                sample_rate,
                captured_at: Instant::now(),
            })
            .await
            .map_err(Into::into)
    }

    /// Poll for the next pipeline event, or `None` if none is queued yet.
    pub async fn try_next_event(&self) -> Option<FfiPipelineEvent> {
        self.inner.try_next_event().await.map(Into::into)
    }
}

/// The main Edge LLM Core API handle.
///
/// Create an instance with `FfiEdgeLlmCore::new()` or
/// `FfiEdgeLlmCore::with_config()`, then call methods to manage models,
/// downloads, inference and voice sessions.
///
/// # Example (Python)
///
/// ```python
/// core = await FfiEdgeLlmCore.new("/path/to/app-data")
/// models = await core.list_available_models()
/// ```
#[derive(uniffi::Object)]
pub struct FfiEdgeLlmCore {
    inner: Arc<EdgeLlmCore>,
}

#[uniffi::export(async_runtime = "tokio")]
impl FfiEdgeLlmCore {
    /// Create a new API instance with default options. Fails if
    /// `app_data_root` does not already exist.
    #[uniffi::constructor]
    pub async fn new(app_data_root: String) -> FfiResult<Arc<Self>> {
        let core = EdgeLlmCore::new(app_data_root).await?;
        Ok(Arc::new(Self { inner: Arc::new(core) }))
    }

    /// Create a new API instance with a configuration record.
    #[uniffi::constructor]
    pub async fn with_config(config: FfiCoreConfig) -> FfiResult<Arc<Self>> {
        let core = EdgeLlmCore::builder(config.app_data_root)
            .auto_create_dirs(config.auto_create_dirs)
            .build()
            .await?;
        Ok(Arc::new(Self { inner: Arc::new(core) }))
    }

    // ========================================
    // Models
    // ========================================

    pub async fn list_available_models(&self) -> FfiResult<Vec<FfiModelDescriptor>> {
        let models = self.inner.list_available_models().await?;
        Ok(models.into_iter().map(Into::into).collect())
    }

    pub async fn list_downloaded_models(&self) -> FfiResult<Vec<FfiModelDescriptor>> {
        let models = self.inner.list_downloaded_models().await?;
        Ok(models.into_iter().map(Into::into).collect())
    }

    pub async fn add_model_from_url(
        &self,
        name: String,
        url: String,
        framework: FfiFrameworkTag,
        estimated_size_bytes: Option<u64>,
        supports_thinking: bool,
    ) -> FfiResult<String> {
        self.inner
            .add_model_from_url(name, url, framework.into(), estimated_size_bytes, supports_thinking)
            .await
            .map_err(Into::into)
    }

    pub async fn get_model(&self, model_id: String) -> Option<FfiModelDescriptor> {
        self.inner.get_model(&model_id).await.map(Into::into)
    }

    pub async fn delete_model(&self, model_id: String) -> FfiResult<()> {
        self.inner.delete_model(&model_id).await.map_err(Into::into)
    }

    pub fn validate_model(&self, path: String) -> FfiResult<FfiDetectionResult> {
        self.inner.validate_model(path).map(Into::into).map_err(Into::into)
    }

    // ========================================
    // Downloads
    // ========================================

    pub async fn download_model(&self, model_id: String) -> FfiResult<FfiDownloadTask> {
        let task = self.inner.download_model(&model_id).await?;
        Ok(FfiDownloadTask {
            task_id: task.id.to_string(),
            model_id: task.model_id,
        })
    }

    pub async fn cancel_download(&self, task_id: String) -> FfiResult<()> {
        let uuid = uuid::Uuid::parse_str(&task_id).map_err(|_| FfiError::Validation {
            field: "task_id".to_string(),
            message: "not a valid task id".to_string(),
        })?;
        self.inner.cancel_download(uuid).await;
        Ok(())
    }

    pub async fn active_downloads(&self) -> u64 {
        self.inner.active_downloads().await as u64
    }

    pub fn pause_all_downloads(&self) {
        self.inner.pause_all_downloads();
    }

    pub fn resume_all_downloads(&self) {
        self.inner.resume_all_downloads();
    }

    pub async fn download_statistics(&self) -> FfiDownloadStatistics {
        self.inner.download_statistics().await.into()
    }

    // ========================================
    // Inference
    // ========================================

    pub async fn load_model(&self, model_id: String) -> FfiResult<()> {
        self.inner.load_model(&model_id).await.map_err(Into::into)
    }

    pub async fn unload_model(&self) {
        self.inner.unload_model().await;
    }

    pub async fn generate(
        &self,
        prompt: String,
        options: FfiGenerationOptions,
    ) -> FfiResult<FfiGenerationResult> {
        self.inner
            .generate(&prompt, &options.into())
            .await
            .map(Into::into)
            .map_err(Into::into)
    }

    /// Runs generation to completion and returns the cumulative result.
    /// UniFFI async exports return a single value, so per-token streaming is
    /// not surfaced here; hosts that need incremental tokens should drive
    /// the Rust `InferenceService` directly from a native extension instead
    /// of through this boundary.
    pub async fn stream_generate(
        &self,
        prompt: String,
        options: FfiGenerationOptions,
    ) -> FfiResult<FfiGenerationResult> {
        // No uniffi-exposed streaming primitive exists for every target
        // language yet, so the stream is drained here and only the final
        // cumulative result crosses the FFI boundary.
        let cancel = edge_llm_core::cancel::CancellationToken::new();
        let mut stream = self
            .inner
            .stream_generate(&prompt, &options.into(), cancel)
            .await
            .map_err(Into::<FfiError>::into)?;
        let mut result = None;
        while let Some(item) = stream.next().await {
            result = Some(item.map_err(Into::<FfiError>::into)?);
        }
        result
            .map(Into::into)
            .ok_or(FfiError::Cancelled)
    }

    // ========================================
    // Voice
    // ========================================

    /// Construct a new voice session bound to this instance's own
    /// inference service and `Config`, with VAD enabled and STT/TTS left
    /// for a host-supplied adapter.
    pub fn create_voice_session(
        self: &Arc<Self>,
        sample_rate: u32,
        max_speech_duration_seconds: f64,
    ) -> Arc<FfiVoiceSession> {
        let factory = Arc::new(LlmOnlyFactory {
            core: self.inner.clone(),
        });
        let session = self
            .inner
            .create_voice_session(factory, sample_rate, max_speech_duration_seconds);
        Arc::new(FfiVoiceSession { inner: session })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffi_error_conversion_preserves_model_not_found_id() {
        let err = RuntimeError::ModelNotFound {
            id: "test-model".to_string(),
        };
        let ffi_err: FfiError = err.into();
        assert!(matches!(ffi_err, FfiError::ModelNotFound { id } if id == "test-model"));
    }

    #[test]
    fn ffi_error_conversion_maps_validation_fields() {
        let err = RuntimeError::Validation {
            field: "url".to_string(),
            message: "must not be empty".to_string(),
        };
        let ffi_err: FfiError = err.into();
        match ffi_err {
            FfiError::Validation { field, message } => {
                assert_eq!(field, "url");
                assert!(message.contains("empty"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn framework_tag_round_trips_through_the_ffi_mirror() {
        let tag = FrameworkTag::LlamaCppClass;
        let ffi: FfiFrameworkTag = tag.into();
        let back: FrameworkTag = ffi.into();
        assert_eq!(back, FrameworkTag::LlamaCppClass);
    }

    #[test]
    fn model_descriptor_conversion_flattens_metadata() {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("quant".to_string(), "Q4_K_M".to_string());

        let mut descriptor = ModelDescriptor::new("id-1", "Test Model", ModelFormat::Gguf);
        descriptor.metadata = metadata;
        descriptor.compatible_frameworks = vec![FrameworkTag::LlamaCppClass];

        let ffi = FfiModelDescriptor::from(descriptor);
        assert_eq!(ffi.id, "id-1");
        assert_eq!(ffi.metadata.len(), 1);
        assert_eq!(ffi.metadata[0].key, "quant");
        assert_eq!(ffi.compatible_frameworks.len(), 1);
    }

    #[test]
    fn pipeline_event_conversion_drops_timing_but_keeps_text() {
        let event = PipelineEvent::Transcribed {
            segment_id: 7,
            transcription: Transcription {
                text: "hello".to_string(),
                is_final: true,
                audio_captured_at: Instant::now(),
                transcribed_at: Instant::now(),
            },
        };
        let ffi: FfiPipelineEvent = event.into();
        match ffi {
            FfiPipelineEvent::Transcribed {
                segment_id,
                text,
                is_final,
            } => {
                assert_eq!(segment_id, 7);
                assert_eq!(text, "hello");
                assert!(is_final);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
