//! Framework Adapter Registry & Inference Adapter Contract (C5, C6).
//!
//! The registry maps a [`FrameworkTag`] to an adapter factory and applies
//! the selection policy from §4.5: a pinned backend wins outright, then the
//! model's preferred framework, then the first registered compatible
//! framework, else `no-compatible-backend`.

pub mod candle_llm;
pub mod native_seam;
pub mod onnx;

use crate::cancel::CancellationToken;
use crate::error::{Result, RuntimeError};
use crate::registry::{FrameworkTag, ModelDescriptor};
use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// How an adapter consumes audio, declared once so the voice pipeline
/// converts at most once per chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    F32Pcm,
    RawBytes,
}

/// Options threaded through to `generate`/`stream_generate`.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            max_tokens: 512,
            stop_sequences: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    StopSequence,
}

/// Result of a (possibly partial, cumulative) generation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub tokens_generated: u32,
    pub tokens_per_second: f32,
    pub finish_reason: Option<FinishReason>,
}

pub type GenerationStream = Pin<Box<dyn Stream<Item = Result<GenerationResult>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unloaded,
    Loading,
    Loaded,
}

/// Backend-neutral contract every text-generation adapter implements.
///
/// At most one model is loaded per adapter instance; `load` transitions
/// `unloaded -> loading -> loaded`, `unload` is idempotent and always
/// transitions back to `unloaded`.
#[async_trait]
pub trait InferenceAdapter: Send + Sync {
    fn framework(&self) -> FrameworkTag;

    fn state(&self) -> AdapterState;

    fn preferred_audio_format(&self) -> AudioFormat {
        AudioFormat::F32Pcm
    }

    async fn load(&self, path: &Path, descriptor: &ModelDescriptor) -> Result<()>;

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GenerationResult>;

    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: CancellationToken,
    ) -> Result<GenerationStream>;

    async fn unload(&self) -> Result<()>;

    /// Best-effort current memory footprint, for the Inference Service's
    /// peak-memory counter.
    fn describe(&self) -> AdapterDescription;

    /// Validate that a descriptor can plausibly be served by this adapter
    /// before attempting a (possibly expensive) `load`.
    fn validate(&self, descriptor: &ModelDescriptor) -> Result<()> {
        if !descriptor.compatible_frameworks.is_empty()
            && !descriptor.compatible_frameworks.contains(&self.framework())
        {
            return Err(RuntimeError::NoCompatibleBackend {
                model_id: descriptor.id.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdapterDescription {
    pub name: &'static str,
    pub memory_bytes: Option<u64>,
}

/// Narrower contract for speech-to-text backends (`WhisperKit-class`).
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn load(&self, path: &Path) -> Result<()>;
    async fn transcribe(&self, pcm_f32: &[f32]) -> Result<String>;
    async fn transcribe_streaming(
        &self,
        pcm_f32: &[f32],
        cancel: CancellationToken,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send>>>;
}

/// Narrower contract for text-to-speech backends (`system-TTS-class`).
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn load(&self, voice_id: Option<&str>) -> Result<()>;
    async fn synthesize(&self, text: &str) -> Result<Vec<f32>>;
}

/// A request's backend preference, if any.
#[derive(Debug, Clone, Default)]
pub struct BackendPreference {
    pub pinned: Option<FrameworkTag>,
}

/// Maps `FrameworkTag -> adapter` and applies the §4.5 selection policy.
pub struct AdapterRegistry {
    adapters: Mutex<HashMap<FrameworkTag, Arc<dyn InferenceAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, adapter: Arc<dyn InferenceAdapter>) {
        self.adapters.lock().await.insert(adapter.framework(), adapter);
    }

    pub async fn available_frameworks(&self) -> Vec<FrameworkTag> {
        self.adapters.lock().await.keys().copied().collect()
    }

    /// Select an adapter for `descriptor` given an optional pinned backend.
    pub async fn select(
        &self,
        descriptor: &ModelDescriptor,
        preference: &BackendPreference,
    ) -> Result<Arc<dyn InferenceAdapter>> {
        let adapters = self.adapters.lock().await;

        if let Some(pinned) = preference.pinned {
            return adapters.get(&pinned).cloned().ok_or(RuntimeError::NoCompatibleBackend {
                model_id: descriptor.id.clone(),
            });
        }

        if let Some(preferred) = descriptor.preferred_framework {
            if let Some(adapter) = adapters.get(&preferred) {
                return Ok(adapter.clone());
            }
        }

        for framework in &descriptor.compatible_frameworks {
            if let Some(adapter) = adapters.get(framework) {
                return Ok(adapter.clone());
            }
        }

        Err(RuntimeError::NoCompatibleBackend {
            model_id: descriptor.id.clone(),
        })
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ModelFormat;
    use futures::stream;

    struct StubAdapter(FrameworkTag);

    #[async_trait]
    impl InferenceAdapter for StubAdapter {
        fn framework(&self) -> FrameworkTag {
            self.0
        }
        fn state(&self) -> AdapterState {
            AdapterState::Loaded
        }
        async fn load(&self, _path: &Path, _descriptor: &ModelDescriptor) -> Result<()> {
            Ok(())
        }
        async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> Result<GenerationResult> {
            Ok(GenerationResult {
                text: prompt.to_string(),
                tokens_generated: 1,
                tokens_per_second: 0.0,
                finish_reason: Some(FinishReason::Stop),
            })
        }
        async fn stream_generate(
            &self,
            _prompt: &str,
            _options: &GenerationOptions,
            _cancel: CancellationToken,
        ) -> Result<GenerationStream> {
            Ok(Box::pin(stream::empty()))
        }
        async fn unload(&self) -> Result<()> {
            Ok(())
        }
        fn describe(&self) -> AdapterDescription {
            AdapterDescription::default()
        }
    }

    fn descriptor() -> ModelDescriptor {
        let mut d = ModelDescriptor::new("m", "m", ModelFormat::Gguf);
        d.compatible_frameworks = vec![FrameworkTag::OnnxClass, FrameworkTag::LlamaCppClass];
        d
    }

    #[tokio::test]
    async fn pinned_backend_wins_even_if_not_preferred() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(StubAdapter(FrameworkTag::OnnxClass))).await;
        registry.register(Arc::new(StubAdapter(FrameworkTag::LlamaCppClass))).await;

        let mut d = descriptor();
        d.preferred_framework = Some(FrameworkTag::OnnxClass);
        let selected = registry
            .select(&d, &BackendPreference { pinned: Some(FrameworkTag::LlamaCppClass) })
            .await
            .unwrap();
        assert_eq!(selected.framework(), FrameworkTag::LlamaCppClass);
    }

    #[tokio::test]
    async fn falls_back_to_first_compatible_when_preferred_unregistered() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(StubAdapter(FrameworkTag::LlamaCppClass))).await;

        let mut d = descriptor();
        d.preferred_framework = Some(FrameworkTag::OnnxClass);
        let selected = registry.select(&d, &BackendPreference::default()).await.unwrap();
        assert_eq!(selected.framework(), FrameworkTag::LlamaCppClass);
    }

    #[tokio::test]
    async fn no_registered_compatible_framework_fails() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(StubAdapter(FrameworkTag::MlxClass))).await;
        let result = registry.select(&descriptor(), &BackendPreference::default()).await;
        assert!(matches!(result, Err(RuntimeError::NoCompatibleBackend { .. })));
    }
}
