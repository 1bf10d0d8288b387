//! Model Registry (C2).
//!
//! In-process shared state mapping model id -> descriptor
//! (`Arc<RwLock<HashMap<_, _>>>`), not a durable cross-process store. Reads
//! dominate writes, so a single `tokio::sync::RwLock` is used directly
//! rather than sharding.

use crate::error::{Result, RuntimeError};
use crate::format::ModelFormat;
use mini_moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Closed enumeration of supported inference backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameworkTag {
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

impl std::fmt::Display for FrameworkTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FrameworkTag::CoreMlClass => "core-ml-class",
            FrameworkTag::TfliteClass => "tflite-class",
            FrameworkTag::OnnxClass => "onnx-class",
            FrameworkTag::LlamaCppClass => "llama-cpp-class",
            FrameworkTag::ExecuTorchClass => "executorch-class",
            FrameworkTag::MlxClass => "mlx-class",
            FrameworkTag::MediaPipeClass => "mediapipe-class",
            FrameworkTag::PicoLlmClass => "picollm-class",
            FrameworkTag::PlatformFoundationClass => "platform-foundation-class",
            FrameworkTag::WhisperKitClass => "whisperkit-class",
            FrameworkTag::SystemTtsClass => "system-tts-class",
        };
        write!(f, "{s}")
    }
}

/// Canonical identity and install state of a model known to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub format: ModelFormat,
    pub remote_url: Option<String>,
    pub local_path: Option<PathBuf>,
    pub checksum: Option<String>,
    pub size_bytes: Option<u64>,
    pub context_length: Option<u64>,
    pub estimated_memory_bytes: Option<u64>,
    pub compatible_frameworks: Vec<FrameworkTag>,
    pub preferred_framework: Option<FrameworkTag>,
    pub tokenizer_tag: Option<String>,
    pub supports_thinking: bool,
    pub metadata: HashMap<String, String>,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, format: ModelFormat) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            format,
            remote_url: None,
            local_path: None,
            checksum: None,
            size_bytes: None,
            context_length: None,
            estimated_memory_bytes: None,
            compatible_frameworks: Vec::new(),
            preferred_framework: None,
            tokenizer_tag: None,
            supports_thinking: false,
            metadata: HashMap::new(),
        }
    }

    /// Validate the descriptor's invariants (§3): local path presence implies
    /// it exists; installed models carry non-empty compatible frameworks;
    /// the preferred framework, if set, is one of the compatible ones.
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.local_path {
            if !path.exists() {
                return Err(RuntimeError::Validation {
                    field: "local_path".into(),
                    message: format!("{} does not exist", path.display()),
                });
            }
            if self.compatible_frameworks.is_empty() {
                return Err(RuntimeError::Validation {
                    field: "compatible_frameworks".into(),
                    message: "installed model must declare at least one compatible framework"
                        .into(),
                });
            }
        }
        if let Some(preferred) = self.preferred_framework {
            if !self.compatible_frameworks.contains(&preferred) {
                return Err(RuntimeError::Validation {
                    field: "preferred_framework".into(),
                    message: "preferred framework must be a member of compatible_frameworks"
                        .into(),
                });
            }
        }
        Ok(())
    }
}

/// Filter criteria for [`ModelRegistry::filter`]. All set fields combine
/// with logical AND.
#[derive(Debug, Clone, Default)]
pub struct FilterCriteria {
    pub framework: Option<FrameworkTag>,
    pub format: Option<ModelFormat>,
    pub max_memory_bytes: Option<u64>,
    pub min_context: Option<u64>,
    pub max_context: Option<u64>,
    pub requires_neural_accelerator: Option<bool>,
    pub quantization: Option<String>,
    pub search: Option<String>,
}

impl FilterCriteria {
    fn matches(&self, d: &ModelDescriptor) -> bool {
        if let Some(fw) = self.framework {
            if !d.compatible_frameworks.contains(&fw) {
                return false;
            }
        }
        if let Some(format) = self.format {
            if d.format != format {
                return false;
            }
        }
        if let Some(max_mem) = self.max_memory_bytes {
            if d.estimated_memory_bytes.is_none_or(|m| m > max_mem) {
                return false;
            }
        }
        if let Some(min_ctx) = self.min_context {
            if d.context_length.is_none_or(|c| c < min_ctx) {
                return false;
            }
        }
        if let Some(max_ctx) = self.max_context {
            if d.context_length.is_none_or(|c| c > max_ctx) {
                return false;
            }
        }
        if let Some(requires) = self.requires_neural_accelerator {
            let declared = d
                .metadata
                .get("requires_neural_accelerator")
                .map(|v| v == "true")
                .unwrap_or(false);
            if declared != requires {
                return false;
            }
        }
        if let Some(q) = &self.quantization {
            let ql = q.to_ascii_lowercase();
            let matched = d
                .metadata
                .get("quantization")
                .is_some_and(|v| v.to_ascii_lowercase().contains(&ql));
            if !matched {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let sl = search.to_ascii_lowercase();
            let haystack = format!("{} {:?}", d.display_name, d.format).to_ascii_lowercase();
            if !haystack.contains(&sl) {
                return false;
            }
        }
        true
    }
}

/// A scannable source of model descriptors consulted by [`ModelRegistry::discover`].
#[async_trait::async_trait]
pub trait DiscoveryProvider: Send + Sync {
    async fn discover(&self) -> Result<Vec<ModelDescriptor>>;
}

/// Canonical set of known models: lookup, filter, update, and remote/local
/// discovery, guarded by a single read/write lock (reads dominate writes).
pub struct ModelRegistry {
    models: RwLock<HashMap<String, ModelDescriptor>>,
    providers: Vec<Arc<dyn DiscoveryProvider>>,
    cache: Cache<(), Vec<ModelDescriptor>>,
    discovery_lock: Mutex<()>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::with_providers(Vec::new())
    }

    pub fn with_providers(providers: Vec<Arc<dyn DiscoveryProvider>>) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            providers,
            cache: Self::build_cache(crate::config::RuntimeConstants::DISCOVERY_CACHE_TTL),
            discovery_lock: Mutex::new(()),
        }
    }

    fn build_cache(ttl: Duration) -> Cache<(), Vec<ModelDescriptor>> {
        Cache::builder().max_capacity(1).time_to_live(ttl).build()
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = Self::build_cache(ttl);
        self
    }

    pub async fn register(&self, descriptor: ModelDescriptor) -> Result<()> {
        descriptor.validate()?;
        let mut models = self.models.write().await;
        models.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> Option<ModelDescriptor> {
        self.models.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<ModelDescriptor> {
        self.models.read().await.get(id).cloned()
    }

    pub async fn update(
        &self,
        id: &str,
        f: impl FnOnce(&mut ModelDescriptor),
    ) -> Result<Option<ModelDescriptor>> {
        let mut models = self.models.write().await;
        match models.get_mut(id) {
            Some(descriptor) => {
                f(descriptor);
                descriptor.validate()?;
                Ok(Some(descriptor.clone()))
            }
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Vec<ModelDescriptor> {
        self.models.read().await.values().cloned().collect()
    }

    pub async fn filter(&self, criteria: &FilterCriteria) -> Vec<ModelDescriptor> {
        self.models
            .read()
            .await
            .values()
            .filter(|d| criteria.matches(d))
            .cloned()
            .collect()
    }

    /// Scan every registered [`DiscoveryProvider`], deduplicate by id,
    /// repopulate the map and return the union. Concurrent callers within
    /// the TTL window observe the same cached result rather than
    /// re-scanning; the `discovery_lock` mutex ensures only one scan is
    /// in flight at a time. The cache itself is a single-entry
    /// time-to-live cache keyed by `()`, not a map over query parameters,
    /// since `discover` always scans every provider.
    pub async fn discover(&self) -> Result<Vec<ModelDescriptor>> {
        if let Some(result) = self.cache.get(&()) {
            return Ok(result);
        }

        let _guard = self.discovery_lock.lock().await;
        // Re-check: another caller may have refreshed the cache while we
        // waited for the discovery lock.
        if let Some(result) = self.cache.get(&()) {
            return Ok(result);
        }

        let mut by_id: HashMap<String, ModelDescriptor> = HashMap::new();
        for provider in &self.providers {
            for descriptor in provider.discover().await? {
                by_id.insert(descriptor.id.clone(), descriptor);
            }
        }

        let mut models = self.models.write().await;
        for (id, descriptor) in &by_id {
            models.insert(id.clone(), descriptor.clone());
        }
        drop(models);

        let result: Vec<ModelDescriptor> = by_id.into_values().collect();
        self.cache.insert((), result.clone());
        Ok(result)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ModelFormat;

    fn descriptor(id: &str) -> ModelDescriptor {
        let mut d = ModelDescriptor::new(id, id, ModelFormat::Gguf);
        d.compatible_frameworks = vec![FrameworkTag::LlamaCppClass];
        d
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let registry = ModelRegistry::new();
        registry.register(descriptor("qwen")).await.unwrap();
        let got = registry.get("qwen").await.unwrap();
        assert_eq!(got.id, "qwen");
    }

    #[tokio::test]
    async fn filter_combines_predicates_with_and() {
        let registry = ModelRegistry::new();
        let mut small = descriptor("small");
        small.estimated_memory_bytes = Some(100);
        small.context_length = Some(2048);
        let mut big = descriptor("big");
        big.estimated_memory_bytes = Some(100_000);
        big.context_length = Some(2048);
        registry.register(small).await.unwrap();
        registry.register(big).await.unwrap();

        let result = registry
            .filter(&FilterCriteria {
                max_memory_bytes: Some(1000),
                min_context: Some(1024),
                ..Default::default()
            })
            .await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "small");
    }

    #[tokio::test]
    async fn installed_model_without_compatible_frameworks_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        std::fs::write(&path, b"GGUF").unwrap();

        let mut d = ModelDescriptor::new("x", "x", ModelFormat::Gguf);
        d.local_path = Some(path);
        let registry = ModelRegistry::new();
        assert!(registry.register(d).await.is_err());
    }

    struct FakeProvider(Vec<ModelDescriptor>);

    #[async_trait::async_trait]
    impl DiscoveryProvider for FakeProvider {
        async fn discover(&self) -> Result<Vec<ModelDescriptor>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn discover_deduplicates_by_id_and_populates_registry() {
        let provider = Arc::new(FakeProvider(vec![descriptor("a"), descriptor("a"), descriptor("b")]));
        let registry = ModelRegistry::with_providers(vec![provider]);
        let result = registry.discover().await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn discover_serves_cached_result_within_ttl() {
        let provider = Arc::new(FakeProvider(vec![descriptor("a")]));
        let registry =
            ModelRegistry::with_providers(vec![provider]).with_cache_ttl(Duration::from_secs(60));
        let first = registry.discover().await.unwrap();
        registry.unregister("a").await;
        let second = registry.discover().await.unwrap();
        assert_eq!(first.len(), second.len());
        // Cached result did not re-scan, so the unregistered model was not
        // re-populated from the registry map, but the returned union is
        // still the cached snapshot.
        assert_eq!(second[0].id, "a");
    }
}
