//! Inference Service (C7).
//!
//! Holds at most one loaded adapter at a time. `load` routes a model id
//! through the registry, the adapter registry's selection policy, and the
//! chosen adapter's own `load`; re-loading a different model first unloads
//! the current one atomically. `unload` is best-effort and never fails the
//! caller, matching the teacher's own "never let cleanup fail the request"
//! posture in its process-manager shutdown paths.

use crate::adapters::{
    AdapterRegistry, BackendPreference, GenerationOptions, GenerationResult, GenerationStream,
    InferenceAdapter,
};
use crate::cancel::CancellationToken;
use crate::error::{Result, RuntimeError};
use crate::registry::ModelRegistry;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// Best-effort resident memory of this process, sampled after a load so
/// `peak_memory_bytes` reflects the host's view rather than only the
/// adapter's self-reported estimate.
fn sample_process_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_process(pid);
    system.process(pid).map(|p| p.memory())
}

/// Lifecycle and generation events observers can subscribe to.
#[derive(Debug, Clone)]
pub enum InferenceEvent {
    ModelLoading { model_id: String },
    ModelLoaded { model_id: String },
    GenerationStarted { model_id: String },
    Token { text: String, tokens_generated: u32 },
    GenerationCompleted { model_id: String, tokens_generated: u32 },
    GenerationFailed { model_id: String, message: String },
}

#[derive(Debug, Default)]
pub struct InferenceStatistics {
    pub total_tokens: u64,
    pub successful_generations: u64,
    pub failed_generations: u64,
    pub peak_memory_bytes: u64,
}

struct ActiveModel {
    model_id: String,
    adapter: Arc<dyn InferenceAdapter>,
}

/// Orchestrates model load/unload and request routing over the adapter
/// registry. Construct once per process; shared behind an `Arc` by the
/// composition root.
pub struct InferenceService {
    registry: Arc<ModelRegistry>,
    adapters: Arc<AdapterRegistry>,
    current: RwLock<Option<ActiveModel>>,
    events: broadcast::Sender<InferenceEvent>,
    total_tokens: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    peak_memory: AtomicU64,
}

impl InferenceService {
    pub fn new(registry: Arc<ModelRegistry>, adapters: Arc<AdapterRegistry>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry,
            adapters,
            current: RwLock::new(None),
            events,
            total_tokens: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            peak_memory: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InferenceEvent> {
        self.events.subscribe()
    }

    pub fn statistics(&self) -> InferenceStatistics {
        InferenceStatistics {
            total_tokens: self.total_tokens.load(Ordering::SeqCst),
            successful_generations: self.successes.load(Ordering::SeqCst),
            failed_generations: self.failures.load(Ordering::SeqCst),
            peak_memory_bytes: self.peak_memory.load(Ordering::SeqCst),
        }
    }

    pub async fn loaded_model_id(&self) -> Option<String> {
        self.current.read().await.as_ref().map(|m| m.model_id.clone())
    }

    fn emit(&self, event: InferenceEvent) {
        let _ = self.events.send(event);
    }

    /// Load `model_id`, unloading any currently loaded model first. On
    /// failure the service remains unloaded.
    pub async fn load(&self, model_id: &str, preference: BackendPreference) -> Result<()> {
        let descriptor = self
            .registry
            .get(model_id)
            .await
            .ok_or_else(|| RuntimeError::ModelNotFound { id: model_id.to_string() })?;

        let local_path = descriptor
            .local_path
            .clone()
            .ok_or_else(|| RuntimeError::ModelNotFound { id: model_id.to_string() })?;

        self.emit(InferenceEvent::ModelLoading {
            model_id: model_id.to_string(),
        });
        info!(model_id, "loading model");

        // Unload whatever is currently resident before attempting the new
        // load, so the service never reports two models loaded at once.
        self.unload().await;

        let adapter = self.adapters.select(&descriptor, &preference).await?;
        adapter.load(&local_path, &descriptor).await.map_err(|e| {
            error!(model_id, error = %e, "model load failed");
            e
        })?;

        if let Some(mem) = adapter.describe().memory_bytes {
            self.peak_memory.fetch_max(mem, Ordering::SeqCst);
        }
        if let Some(mem) = sample_process_memory_bytes() {
            self.peak_memory.fetch_max(mem, Ordering::SeqCst);
        }

        *self.current.write().await = Some(ActiveModel {
            model_id: model_id.to_string(),
            adapter,
        });

        self.emit(InferenceEvent::ModelLoaded {
            model_id: model_id.to_string(),
        });
        info!(model_id, "model loaded");
        Ok(())
    }

    /// Best-effort unload of the current model. Never fails the caller: a
    /// failure from the adapter's own `unload` is logged and swallowed.
    pub async fn unload(&self) {
        let previous = self.current.write().await.take();
        if let Some(active) = previous {
            if let Err(e) = active.adapter.unload().await {
                warn!(model_id = %active.model_id, error = %e, "adapter unload failed, discarding handle anyway");
            } else {
                debug!(model_id = %active.model_id, "model unloaded");
            }
        }
    }

    async fn current_adapter(&self) -> Result<(String, Arc<dyn InferenceAdapter>)> {
        let guard = self.current.read().await;
        let active = guard.as_ref().ok_or(RuntimeError::NotInitialized)?;
        Ok((active.model_id.clone(), active.adapter.clone()))
    }

    pub async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GenerationResult> {
        let (model_id, adapter) = self.current_adapter().await?;
        self.emit(InferenceEvent::GenerationStarted {
            model_id: model_id.clone(),
        });

        match adapter.generate(prompt, options).await {
            Ok(result) => {
                self.total_tokens
                    .fetch_add(result.tokens_generated as u64, Ordering::SeqCst);
                self.successes.fetch_add(1, Ordering::SeqCst);
                self.emit(InferenceEvent::GenerationCompleted {
                    model_id,
                    tokens_generated: result.tokens_generated,
                });
                Ok(result)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                self.emit(InferenceEvent::GenerationFailed {
                    model_id,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Stream generation lazily: each item pulled from the returned stream
    /// emits a `Token` event for its cumulative partial result, and the
    /// stream's exhaustion emits a terminal `GenerationCompleted` (or
    /// `GenerationFailed`, for the item that carried the error). Unlike
    /// `generate`, nothing here is driven to completion internally - the
    /// caller controls the pace of consumption.
    pub async fn stream_generate(
        self: &Arc<Self>,
        prompt: &str,
        options: &GenerationOptions,
        cancel: CancellationToken,
    ) -> Result<GenerationStream> {
        let (model_id, adapter) = self.current_adapter().await?;
        self.emit(InferenceEvent::GenerationStarted {
            model_id: model_id.clone(),
        });

        let inner = adapter.stream_generate(prompt, options, cancel).await?;
        let state = StreamState {
            service: self.clone(),
            model_id,
            inner,
            last_tokens: 0,
            failed: false,
        };

        Ok(Box::pin(futures::stream::unfold(state, |mut state| async move {
            match state.inner.next().await {
                Some(Ok(partial)) => {
                    state.service.emit(InferenceEvent::Token {
                        text: partial.text.clone(),
                        tokens_generated: partial.tokens_generated,
                    });
                    state.last_tokens = partial.tokens_generated;
                    Some((Ok(partial), state))
                }
                Some(Err(e)) => {
                    state.service.failures.fetch_add(1, Ordering::SeqCst);
                    state.service.emit(InferenceEvent::GenerationFailed {
                        model_id: state.model_id.clone(),
                        message: e.to_string(),
                    });
                    state.failed = true;
                    Some((Err(e), state))
                }
                None => {
                    if !state.failed {
                        state
                            .service
                            .total_tokens
                            .fetch_add(state.last_tokens as u64, Ordering::SeqCst);
                        state.service.successes.fetch_add(1, Ordering::SeqCst);
                        state.service.emit(InferenceEvent::GenerationCompleted {
                            model_id: state.model_id.clone(),
                            tokens_generated: state.last_tokens,
                        });
                    }
                    None
                }
            }
        })))
    }
}

struct StreamState {
    service: Arc<InferenceService>,
    model_id: String,
    inner: GenerationStream,
    last_tokens: u32,
    failed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterDescription, AdapterState, AudioFormat, FinishReason, GenerationStream};
    use crate::format::ModelFormat;
    use crate::registry::{FrameworkTag, ModelDescriptor};
    use async_trait::async_trait;
    use futures::stream;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    struct StubAdapter {
        framework: FrameworkTag,
        state: StdMutex<AdapterState>,
        fail_load: bool,
    }

    impl StubAdapter {
        fn new(framework: FrameworkTag) -> Self {
            Self {
                framework,
                state: StdMutex::new(AdapterState::Unloaded),
                fail_load: false,
            }
        }
        fn failing(framework: FrameworkTag) -> Self {
            Self {
                framework,
                state: StdMutex::new(AdapterState::Unloaded),
                fail_load: true,
            }
        }
    }

    #[async_trait]
    impl InferenceAdapter for StubAdapter {
        fn framework(&self) -> FrameworkTag {
            self.framework
        }
        fn state(&self) -> AdapterState {
            *self.state.lock().unwrap()
        }
        fn preferred_audio_format(&self) -> AudioFormat {
            AudioFormat::F32Pcm
        }
        async fn load(&self, _path: &Path, _descriptor: &ModelDescriptor) -> Result<()> {
            if self.fail_load {
                return Err(RuntimeError::UnsupportedFormat("nope".into()));
            }
            *self.state.lock().unwrap() = AdapterState::Loaded;
            Ok(())
        }
        async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> Result<GenerationResult> {
            Ok(GenerationResult {
                text: prompt.to_string(),
                tokens_generated: 3,
                tokens_per_second: 10.0,
                finish_reason: Some(FinishReason::Stop),
            })
        }
        async fn stream_generate(
            &self,
            prompt: &str,
            _options: &GenerationOptions,
            _cancel: CancellationToken,
        ) -> Result<GenerationStream> {
            let partials = vec![
                GenerationResult {
                    text: prompt.chars().take(1).collect(),
                    tokens_generated: 1,
                    tokens_per_second: 5.0,
                    finish_reason: None,
                },
                GenerationResult {
                    text: prompt.to_string(),
                    tokens_generated: 2,
                    tokens_per_second: 8.0,
                    finish_reason: Some(FinishReason::Stop),
                },
            ];
            Ok(Box::pin(stream::iter(partials.into_iter().map(Ok))))
        }
        async fn unload(&self) -> Result<()> {
            *self.state.lock().unwrap() = AdapterState::Unloaded;
            Ok(())
        }
        fn describe(&self) -> AdapterDescription {
            AdapterDescription {
                name: "stub",
                memory_bytes: Some(1024),
            }
        }
    }

    async fn setup(framework: FrameworkTag, fail_load: bool) -> (InferenceService, String) {
        let registry = Arc::new(ModelRegistry::new());
        let mut descriptor = ModelDescriptor::new("m1", "Model One", ModelFormat::Gguf);
        descriptor.compatible_frameworks = vec![framework];
        descriptor.preferred_framework = Some(framework);
        descriptor.local_path = Some(std::env::temp_dir().join("m1.gguf"));
        std::fs::write(descriptor.local_path.as_ref().unwrap(), b"stub").unwrap();
        registry.register(descriptor).await.unwrap();

        let adapters = Arc::new(AdapterRegistry::new());
        let adapter: Arc<dyn InferenceAdapter> = if fail_load {
            Arc::new(StubAdapter::failing(framework))
        } else {
            Arc::new(StubAdapter::new(framework))
        };
        adapters.register(adapter).await;

        (InferenceService::new(registry, adapters), "m1".to_string())
    }

    #[tokio::test]
    async fn load_then_generate_tracks_token_counter() {
        let (service, model_id) = setup(FrameworkTag::LlamaCppClass, false).await;
        service.load(&model_id, BackendPreference::default()).await.unwrap();

        let result = service.generate("hello", &GenerationOptions::default()).await.unwrap();
        assert_eq!(result.tokens_generated, 3);
        assert_eq!(service.statistics().total_tokens, 3);
        assert_eq!(service.statistics().successful_generations, 1);
    }

    #[tokio::test]
    async fn generate_before_load_fails_not_initialized() {
        let (service, _model_id) = setup(FrameworkTag::LlamaCppClass, false).await;
        let err = service.generate("hi", &GenerationOptions::default()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotInitialized));
    }

    #[tokio::test]
    async fn failed_load_leaves_service_unloaded() {
        let (service, model_id) = setup(FrameworkTag::LlamaCppClass, true).await;
        let err = service.load(&model_id, BackendPreference::default()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::UnsupportedFormat(_)));
        assert!(service.loaded_model_id().await.is_none());
    }

    #[tokio::test]
    async fn stream_generate_emits_cumulative_tokens_and_final_result() {
        let (service, model_id) = setup(FrameworkTag::LlamaCppClass, false).await;
        let service = Arc::new(service);
        service.load(&model_id, BackendPreference::default()).await.unwrap();

        let mut rx = service.subscribe();
        let mut stream = service
            .stream_generate("hi", &GenerationOptions::default(), CancellationToken::new())
            .await
            .unwrap();

        let mut last = None;
        while let Some(item) = stream.next().await {
            last = Some(item.unwrap());
        }
        assert_eq!(last.unwrap().tokens_generated, 2);

        let mut tokens_seen = 0;
        while let Ok(event) = rx.try_recv() {
            if let InferenceEvent::Token { .. } = event {
                tokens_seen += 1;
            }
        }
        assert_eq!(tokens_seen, 2);
    }

    #[tokio::test]
    async fn unload_is_idempotent_and_infallible() {
        let (service, _model_id) = setup(FrameworkTag::LlamaCppClass, false).await;
        service.unload().await;
        service.unload().await;
    }
}
