//! Unified error type for the runtime.
//!
//! Every subsystem (format detection, registry, storage, download engine,
//! adapters, inference service, voice pipeline) surfaces errors through this
//! single enum so that callers across the UniFFI and RPC boundaries see one
//! stable error shape.

use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage a voice-pipeline failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Vad,
    Stt,
    Llm,
    Tts,
    Pipeline,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineStage::Vad => "vad",
            PipelineStage::Stt => "stt",
            PipelineStage::Llm => "llm",
            PipelineStage::Tts => "tts",
            PipelineStage::Pipeline => "pipeline",
        };
        write!(f, "{s}")
    }
}

/// The runtime's single error type.
///
/// Variant names mirror the error-kind union from the error handling design:
/// `invalid-url`, `network`, `timeout`, `partial-download`, `checksum-mismatch`,
/// `extraction-failed`, `unsupported-archive`, `http(code)`, `cancelled`,
/// `insufficient-space`, `model-not-found`, `unsupported-format`,
/// `not-initialized`, `no-compatible-backend`, `resource-exhausted`,
/// `invalid-response`, `unknown`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("partial download: got {got} of {expected:?} bytes")]
    PartialDownload { got: u64, expected: Option<u64> },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("archive extraction failed: {reason}")]
    ExtractionFailed { reason: String },

    #[error("unsupported archive extension: {extension}")]
    UnsupportedArchive { extension: String },

    #[error("invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    #[error("HTTP {status}")]
    Http { status: u16 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("insufficient space: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("model not found: {id}")]
    ModelNotFound { id: String },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("adapter not initialized")]
    NotInitialized,

    #[error("no compatible backend for model {model_id}")]
    NoCompatibleBackend { model_id: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{stage} error: {message}")]
    Pipeline {
        stage: PipelineStage,
        message: String,
    },

    #[error("unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Config {
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for RuntimeError {
    fn from(err: toml::de::Error) -> Self {
        RuntimeError::Config {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for RuntimeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RuntimeError::Timeout(std::time::Duration::from_secs(0))
        } else if let Some(status) = err.status() {
            RuntimeError::Http {
                status: status.as_u16(),
            }
        } else {
            RuntimeError::Network {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }
}

impl RuntimeError {
    /// Attach a path to an IO error for nicer diagnostics.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        RuntimeError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Tag this error with the voice-pipeline stage it originated in.
    pub fn in_stage(self, stage: PipelineStage) -> Self {
        RuntimeError::Pipeline {
            stage,
            message: self.to_string(),
        }
    }

    /// Whether the Download Engine should retry an operation that failed with
    /// this error. Matches the retryable/non-retryable split in the download
    /// engine's contract: network timeouts, lost connections, partial
    /// downloads and transport I/O retry; invalid URLs, 4xx, checksum
    /// mismatches, out-of-space and cancellation do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Network { .. }
            | RuntimeError::Timeout(_)
            | RuntimeError::PartialDownload { .. } => true,
            RuntimeError::Http { status } => is_retryable_status(*status),
            _ => false,
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_not_found_displays_id() {
        let err = RuntimeError::ModelNotFound {
            id: "qwen-2.5-0.5b".into(),
        };
        assert_eq!(err.to_string(), "model not found: qwen-2.5-0.5b");
    }

    #[test]
    fn retryable_classification() {
        assert!(RuntimeError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(RuntimeError::PartialDownload {
            got: 10,
            expected: Some(20)
        }
        .is_retryable());
        assert!(RuntimeError::Http { status: 503 }.is_retryable());
        assert!(!RuntimeError::Http { status: 404 }.is_retryable());
        assert!(!RuntimeError::InvalidUrl("nope".into()).is_retryable());
        assert!(!RuntimeError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
        assert!(!RuntimeError::Cancelled.is_retryable());
    }

    #[test]
    fn in_stage_tags_pipeline_stage() {
        let err = RuntimeError::NotInitialized.in_stage(PipelineStage::Stt);
        match err {
            RuntimeError::Pipeline { stage, .. } => assert_eq!(stage, PipelineStage::Stt),
            other => panic!("expected Pipeline variant, got {other:?}"),
        }
    }

    #[test]
    fn stage_display_matches_error_taxonomy_names() {
        assert_eq!(PipelineStage::Vad.to_string(), "vad");
        assert_eq!(PipelineStage::Stt.to_string(), "stt");
        assert_eq!(PipelineStage::Llm.to_string(), "llm");
        assert_eq!(PipelineStage::Tts.to_string(), "tts");
        assert_eq!(PipelineStage::Pipeline.to_string(), "pipeline");
    }

    /// Every variant gets an explicit retryable classification and a
    /// non-empty message, so a newly added variant without a matching
    /// entry here is caught by the exhaustive match rather than by a
    /// silent `is_retryable` default.
    fn all_variants() -> Vec<(RuntimeError, bool)> {
        vec![
            (RuntimeError::InvalidUrl("bad-url".into()), false),
            (
                RuntimeError::Network {
                    message: "connection reset".into(),
                    source: None,
                },
                true,
            ),
            (RuntimeError::Timeout(std::time::Duration::from_secs(5)), true),
            (
                RuntimeError::PartialDownload {
                    got: 10,
                    expected: Some(100),
                },
                true,
            ),
            (
                RuntimeError::ChecksumMismatch {
                    expected: "a".into(),
                    actual: "b".into(),
                },
                false,
            ),
            (
                RuntimeError::ExtractionFailed {
                    reason: "corrupt archive".into(),
                },
                false,
            ),
            (
                RuntimeError::UnsupportedArchive {
                    extension: "zst".into(),
                },
                false,
            ),
            (
                RuntimeError::InvalidResponse {
                    url: "https://example.com".into(),
                    message: "not JSON".into(),
                },
                false,
            ),
            (RuntimeError::Http { status: 503 }, true),
            (RuntimeError::Http { status: 404 }, false),
            (RuntimeError::Cancelled, false),
            (
                RuntimeError::InsufficientSpace {
                    needed: 1_000,
                    available: 10,
                },
                false,
            ),
            (
                RuntimeError::ModelNotFound {
                    id: "qwen".into(),
                },
                false,
            ),
            (RuntimeError::UnsupportedFormat("gguf-v9".into()), false),
            (RuntimeError::NotInitialized, false),
            (
                RuntimeError::NoCompatibleBackend {
                    model_id: "qwen".into(),
                },
                false,
            ),
            (RuntimeError::ResourceExhausted("worker pool full".into()), false),
            (
                RuntimeError::Io {
                    message: "permission denied".into(),
                    path: Some(PathBuf::from("/tmp/model.bin")),
                    source: None,
                },
                false,
            ),
            (
                RuntimeError::Config {
                    message: "missing field".into(),
                },
                false,
            ),
            (
                RuntimeError::Validation {
                    field: "local_path".into(),
                    message: "does not exist".into(),
                },
                false,
            ),
            (
                RuntimeError::Pipeline {
                    stage: PipelineStage::Llm,
                    message: "generation failed".into(),
                },
                false,
            ),
            (RuntimeError::Unknown("unexpected state".into()), false),
        ]
    }

    #[test]
    fn every_variant_has_an_explicit_retryable_classification() {
        for (err, expected_retryable) in all_variants() {
            assert_eq!(
                err.is_retryable(),
                expected_retryable,
                "unexpected is_retryable() for {err:?}"
            );
        }
    }

    #[test]
    fn every_variant_displays_a_non_empty_message() {
        for (err, _) in all_variants() {
            assert!(!err.to_string().is_empty(), "empty Display for {err:?}");
        }
    }
}
