//! Edge LLM Core - headless library for on-device model management,
//! download, inference and real-time voice pipelines.
//!
//! This crate provides the core functionality without any HTTP/RPC layer;
//! it can be embedded directly by a host application.
//!
//! # Example
//!
//! ```rust,no_run
//! use edge_llm_core::EdgeLlmCore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let core = EdgeLlmCore::new("/path/to/app-data").await?;
//!
//!     let models = core.list_available_models().await?;
//!     println!("Found {} models", models.len());
//!
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod cancel;
pub mod config;
pub mod download;
pub mod error;
pub mod format;
pub mod inference;
pub mod progress;
pub mod registry;
pub mod storage;
pub mod voice;

pub use adapters::{AdapterRegistry, BackendPreference, GenerationOptions, GenerationResult, GenerationStream};
pub use config::Config;
pub use download::{DownloadEngine, DownloadStatistics, DownloadTask, Transport};
pub use error::{Result, RuntimeError};
pub use format::DetectionResult;
pub use inference::{InferenceEvent, InferenceService, InferenceStatistics};
pub use progress::{AggregateSnapshot, ProgressAggregator};
pub use registry::{FilterCriteria, FrameworkTag, ModelDescriptor, ModelRegistry};
pub use storage::StorageManager;
pub use voice::{PipelineComponents, PipelineFactory, SessionState, VoicePipeline, VoiceSession};

use config::DownloadPriority;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Builder for [`EdgeLlmCore`], mirroring the teacher's own
/// `builder(...)`/`new(...)` pair: `new` is the non-builder convenience
/// equivalent of `builder(root).build()`.
pub struct EdgeLlmCoreBuilder {
    root: PathBuf,
    config: Config,
    auto_create_dirs: bool,
    transport: Option<Arc<dyn Transport>>,
    max_concurrent_downloads: Option<usize>,
}

impl EdgeLlmCoreBuilder {
    fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: Config::default(),
            auto_create_dirs: false,
            transport: None,
            max_concurrent_downloads: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn auto_create_dirs(mut self, auto_create: bool) -> Self {
        self.auto_create_dirs = auto_create;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = Some(max);
        self
    }

    /// Construct the facade. Every collaborator is built independently;
    /// the Storage Manager's root-directory precondition is the only hard
    /// failure, mirroring the teacher's own `launcher_root.exists()` check.
    pub async fn build(self) -> Result<EdgeLlmCore> {
        if !self.root.exists() {
            if self.auto_create_dirs {
                std::fs::create_dir_all(&self.root).map_err(|e| RuntimeError::io_with_path(e, &self.root))?;
            } else {
                return Err(RuntimeError::Config {
                    message: format!("app data root does not exist: {}", self.root.display()),
                });
            }
        }

        let storage = Arc::new(StorageManager::new(&self.root)?);

        let registry = Arc::new(ModelRegistry::new());

        let mut download_config = self.config.download.clone();
        if let Some(max) = self.max_concurrent_downloads {
            download_config.max_concurrent_downloads = max;
        }
        let download = Arc::new(match self.transport {
            Some(transport) => {
                DownloadEngine::with_transport(storage.clone(), registry.clone(), download_config, transport)
            }
            None => DownloadEngine::new(storage.clone(), registry.clone(), download_config),
        });

        let adapters = Arc::new(AdapterRegistry::new());
        let inference = Arc::new(InferenceService::new(registry.clone(), adapters.clone()));
        let progress = Arc::new(ProgressAggregator::new());

        Ok(EdgeLlmCore {
            root: self.root,
            config: self.config,
            registry,
            storage,
            download,
            adapters,
            inference,
            progress,
        })
    }
}

/// Single top-level entry point for Edge LLM Core. The only type
/// application code touches directly; owns every collaborator (registry,
/// storage manager, download engine, adapter registry, inference service)
/// and exposes exactly the crate's public operations.
pub struct EdgeLlmCore {
    root: PathBuf,
    config: Config,
    registry: Arc<ModelRegistry>,
    storage: Arc<StorageManager>,
    download: Arc<DownloadEngine>,
    adapters: Arc<AdapterRegistry>,
    inference: Arc<InferenceService>,
    progress: Arc<ProgressAggregator>,
}

impl EdgeLlmCore {
    pub fn builder(root: impl Into<PathBuf>) -> EdgeLlmCoreBuilder {
        EdgeLlmCoreBuilder::new(root)
    }

    /// Non-builder convenience equivalent of `builder(root).build()`.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(root).build().await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    pub fn inference(&self) -> &Arc<InferenceService> {
        &self.inference
    }

    pub fn progress(&self) -> &Arc<ProgressAggregator> {
        &self.progress
    }

    // ========================================
    // Models
    // ========================================

    /// Every model the registry knows about, including ones discovered
    /// from configured providers but not yet downloaded.
    pub async fn list_available_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.registry.discover().await
    }

    /// Only models with a local path already set.
    pub async fn list_downloaded_models(&self) -> Result<Vec<ModelDescriptor>> {
        Ok(self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|d| d.local_path.is_some())
            .collect())
    }

    /// Register a new model by remote URL. Returns the generated model id.
    pub async fn add_model_from_url(
        &self,
        name: impl Into<String>,
        url: impl Into<String>,
        framework: FrameworkTag,
        estimated_size_bytes: Option<u64>,
        supports_thinking: bool,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let name = name.into();
        let mut descriptor = ModelDescriptor::new(id.clone(), name, format::ModelFormat::Unknown);
        descriptor.remote_url = Some(url.into());
        descriptor.size_bytes = estimated_size_bytes;
        descriptor.supports_thinking = supports_thinking;
        descriptor.compatible_frameworks = vec![framework];
        descriptor.preferred_framework = Some(framework);
        self.registry.register(descriptor).await?;
        Ok(id)
    }

    pub async fn get_model(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.registry.get(model_id).await
    }

    /// Remove a model's registry entry and, if present, its on-disk files.
    pub async fn delete_model(&self, model_id: &str) -> Result<()> {
        let descriptor = self
            .registry
            .unregister(model_id)
            .await
            .ok_or_else(|| RuntimeError::ModelNotFound { id: model_id.to_string() })?;

        self.download.cancel_for_model(model_id).await;

        if descriptor.local_path.is_some() {
            if let Some(framework) = descriptor.preferred_framework.or_else(|| descriptor.compatible_frameworks.first().copied()) {
                self.storage.delete_model(model_id, framework).await?;
            }
        }
        Ok(())
    }

    pub fn validate_model(&self, path: impl AsRef<Path>) -> Result<DetectionResult> {
        format::detect(path)
    }

    // ========================================
    // Downloads
    // ========================================

    pub async fn download_model(&self, model_id: &str) -> Result<DownloadTask> {
        let descriptor = self
            .registry
            .get(model_id)
            .await
            .ok_or_else(|| RuntimeError::ModelNotFound { id: model_id.to_string() })?;
        let url = descriptor.remote_url.clone().ok_or_else(|| RuntimeError::Validation {
            field: "remote_url".into(),
            message: "model has no remote URL to download from".into(),
        })?;
        let framework = descriptor
            .preferred_framework
            .or_else(|| descriptor.compatible_frameworks.first().copied())
            .ok_or_else(|| RuntimeError::NoCompatibleBackend { model_id: model_id.to_string() })?;

        Ok(self.download.download(model_id, url, framework, DownloadPriority::Normal).await)
    }

    pub async fn cancel_download(&self, task_id: Uuid) {
        self.download.cancel(task_id).await;
    }

    pub async fn active_downloads(&self) -> usize {
        self.download.active_count().await
    }

    pub fn pause_all_downloads(&self) {
        self.download.pause_all();
    }

    pub fn resume_all_downloads(&self) {
        self.download.resume_all();
    }

    pub async fn download_statistics(&self) -> DownloadStatistics {
        self.download.statistics().await
    }

    // ========================================
    // Inference
    // ========================================

    pub async fn load_model(&self, model_id: &str) -> Result<()> {
        self.inference.load(model_id, BackendPreference::default()).await
    }

    pub async fn unload_model(&self) {
        self.inference.unload().await;
    }

    pub async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GenerationResult> {
        self.inference.generate(prompt, options).await
    }

    /// Returns a lazy sequence of cumulative partial results rather than
    /// draining it: callers that want intermediate tokens poll the stream
    /// themselves, and callers that only want the final result can drive it
    /// to completion and keep the last item.
    pub async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: cancel::CancellationToken,
    ) -> Result<GenerationStream> {
        self.inference.stream_generate(prompt, options, cancel).await
    }

    // ========================================
    // Voice
    // ========================================

    /// Build a new pipeline over the given stage components, bound to
    /// `sample_rate` and a maximum in-flight speech duration.
    pub fn create_voice_pipeline(
        &self,
        components: PipelineComponents,
        sample_rate: u32,
        max_speech_duration_seconds: f64,
    ) -> (Arc<VoicePipeline>, tokio::sync::mpsc::UnboundedReceiver<voice::PipelineEvent>) {
        VoicePipeline::new(components, &self.config, sample_rate, max_speech_duration_seconds)
    }

    /// Build a pipeline, drain `audio` into it until the source closes, and
    /// return the pipeline's event stream. The pipeline itself is dropped
    /// once `audio` is exhausted and every in-flight segment has finished.
    pub fn process_voice(
        &self,
        mut audio: impl futures::Stream<Item = voice::AudioChunk> + Unpin + Send + 'static,
        components: PipelineComponents,
        sample_rate: u32,
        max_speech_duration_seconds: f64,
    ) -> tokio::sync::mpsc::UnboundedReceiver<voice::PipelineEvent> {
        use futures::StreamExt;
        let (pipeline, events) = self.create_voice_pipeline(components, sample_rate, max_speech_duration_seconds);
        tokio::spawn(async move {
            while let Some(chunk) = audio.next().await {
                if pipeline.ingest(chunk).await.is_err() {
                    break;
                }
            }
        });
        events
    }

    /// Construct a new voice session. The session itself owns its
    /// `connect`/`disconnect`/`start_listening`/`stop_listening`/`interrupt`
    /// lifecycle; the facade only wires it to this instance's `Config`.
    pub fn create_voice_session(
        &self,
        factory: Arc<dyn PipelineFactory>,
        sample_rate: u32,
        max_speech_duration_seconds: f64,
    ) -> VoiceSession {
        VoiceSession::new(factory, self.config.clone(), sample_rate, max_speech_duration_seconds)
    }
}
