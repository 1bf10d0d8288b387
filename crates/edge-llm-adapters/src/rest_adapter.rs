//! REST-backed inference adapter talking to a local Ollama-compatible
//! `/api/generate` endpoint.
//!
//! Grounded on [`crate::ollama_client`]'s HTTP client shape: a `reqwest`
//! client pinned to a base URL, JSON request bodies, and the
//! `keep_alive: -1`/`keep_alive: 0` probe `ollama_client` already uses to
//! load/unload a model in the remote process's memory. That client only
//! manages models; this adapter reuses the same request shape to drive
//! actual text generation through `InferenceAdapter`.

use async_trait::async_trait;
use edge_llm_core::adapters::{
    AdapterDescription, AdapterState, FinishReason, GenerationOptions, GenerationResult,
    GenerationStream, InferenceAdapter,
};
use edge_llm_core::cancel::CancellationToken;
use edge_llm_core::error::{Result, RuntimeError};
use edge_llm_core::registry::{FrameworkTag, ModelDescriptor};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);

/// One line of an Ollama-shaped `/api/generate` response, streamed or not.
#[derive(Debug, Default, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

struct LoadedModel {
    name: String,
}

/// Talks to a local Ollama-compatible server over `/api/generate`. One
/// instance serves exactly one loaded model name at a time, matching the
/// at-most-one-model-per-adapter contract every other adapter follows.
pub struct RestInferenceAdapter {
    base_url: String,
    client: reqwest::Client,
    framework: FrameworkTag,
    loaded: Mutex<Option<LoadedModel>>,
    state: StdMutex<AdapterState>,
}

impl RestInferenceAdapter {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:11434`.
    /// `framework` is the tag this instance registers under — the wire
    /// protocol here happens to be Ollama's, but the same REST shape backs
    /// more than one `llama.cpp`-server-compatible framework tag.
    pub fn new(base_url: impl Into<String>, framework: FrameworkTag) -> Self {
        let client = reqwest::Client::builder()
            .timeout(GENERATE_TIMEOUT)
            .user_agent("edge-llm-core")
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            framework,
            loaded: Mutex::new(None),
            state: StdMutex::new(AdapterState::Unloaded),
        }
    }

    fn set_state(&self, s: AdapterState) {
        *self.state.lock().expect("adapter state mutex poisoned") = s;
    }

    fn net_err(&self, message: String) -> RuntimeError {
        RuntimeError::Network { message, source: None }
    }

    async fn call_generate(
        &self,
        name: &str,
        prompt: &str,
        options: &GenerationOptions,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/api/generate", self.base_url);
        let body = serde_json::json!({
            "model": name,
            "prompt": prompt,
            "stream": stream,
            "options": {
                "temperature": options.temperature,
                "top_p": options.top_p,
                "num_predict": options.max_tokens,
                "stop": options.stop_sequences,
            },
        });

        debug!("POST {} stream={}", url, stream);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.net_err(format!("failed to reach {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(RuntimeError::Http { status: response.status().as_u16() });
        }
        Ok(response)
    }
}

#[async_trait]
impl InferenceAdapter for RestInferenceAdapter {
    fn framework(&self) -> FrameworkTag {
        self.framework
    }

    fn state(&self) -> AdapterState {
        *self.state.lock().expect("adapter state mutex poisoned")
    }

    async fn load(&self, path: &Path, descriptor: &ModelDescriptor) -> Result<()> {
        self.validate(descriptor)?;
        self.set_state(AdapterState::Loading);

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&descriptor.id)
            .to_string();

        let url = format!("{}/api/generate", self.base_url);
        let body = serde_json::json!({ "model": name, "prompt": "", "stream": false, "keep_alive": -1 });
        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            self.set_state(AdapterState::Unloaded);
            self.net_err(format!("failed to warm model into server memory: {e}"))
        })?;

        if !response.status().is_success() {
            self.set_state(AdapterState::Unloaded);
            return Err(RuntimeError::Http { status: response.status().as_u16() });
        }

        *self.loaded.lock().await = Some(LoadedModel { name });
        self.set_state(AdapterState::Loaded);
        info!("REST adapter loaded model for {}", descriptor.id);
        Ok(())
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GenerationResult> {
        let guard = self.loaded.lock().await;
        let loaded = guard.as_ref().ok_or(RuntimeError::NotInitialized)?;

        let start = Instant::now();
        let response = self.call_generate(&loaded.name, prompt, options, false).await?;
        let chunk: GenerateChunk = response
            .json()
            .await
            .map_err(|e| RuntimeError::InvalidResponse {
                url: format!("{}/api/generate", self.base_url),
                message: e.to_string(),
            })?;

        let tokens_generated = chunk.eval_count.unwrap_or(0);
        let elapsed = chunk
            .eval_duration
            .map(|ns| ns as f32 / 1_000_000_000.0)
            .unwrap_or_else(|| start.elapsed().as_secs_f32())
            .max(f32::EPSILON);

        Ok(GenerationResult {
            text: chunk.response,
            tokens_generated,
            tokens_per_second: tokens_generated as f32 / elapsed,
            finish_reason: Some(FinishReason::Stop),
        })
    }

    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: CancellationToken,
    ) -> Result<GenerationStream> {
        let guard = self.loaded.lock().await;
        let loaded = guard.as_ref().ok_or(RuntimeError::NotInitialized)?;
        let name = loaded.name.clone();
        drop(guard);

        let response = self.call_generate(&name, prompt, options, true).await?;
        let byte_stream = response.bytes_stream();

        let generated = stream::unfold(
            (byte_stream, String::new(), cancel),
            |(mut bytes, mut cumulative, cancel)| async move {
                loop {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(raw)) => {
                            let line = String::from_utf8_lossy(&raw);
                            let parsed: std::result::Result<GenerateChunk, _> =
                                serde_json::from_str(line.trim());
                            let Ok(parsed) = parsed else { continue };

                            cumulative.push_str(&parsed.response);
                            let tokens_generated = parsed.eval_count.unwrap_or(0);
                            let tokens_per_second = parsed
                                .eval_duration
                                .filter(|d| *d > 0)
                                .map(|d| tokens_generated as f32 / (d as f32 / 1_000_000_000.0))
                                .unwrap_or(0.0);
                            let result = GenerationResult {
                                text: cumulative.clone(),
                                tokens_generated,
                                tokens_per_second,
                                finish_reason: parsed.done.then_some(FinishReason::Stop),
                            };
                            return Some((Ok(result), (bytes, cumulative, cancel)));
                        }
                        Some(Err(e)) => {
                            let err = RuntimeError::Network { message: e.to_string(), source: None };
                            return Some((Err(err), (bytes, cumulative, cancel)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(generated))
    }

    async fn unload(&self) -> Result<()> {
        if let Some(loaded) = self.loaded.lock().await.take() {
            let url = format!("{}/api/generate", self.base_url);
            let body = serde_json::json!({ "model": loaded.name, "prompt": "", "stream": false, "keep_alive": 0 });
            // Best-effort: the adapter still reports unloaded even if the
            // remote server is unreachable, mirroring `unload`'s
            // always-succeeds contract on every other adapter.
            let _ = self.client.post(&url).json(&body).send().await;
        }
        self.set_state(AdapterState::Unloaded);
        Ok(())
    }

    fn describe(&self) -> AdapterDescription {
        AdapterDescription {
            name: "REST (Ollama-compatible /api/generate)",
            memory_bytes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_llm_core::format::ModelFormat;

    fn descriptor() -> ModelDescriptor {
        let mut d = ModelDescriptor::new("m1", "tiny", ModelFormat::Gguf);
        d.compatible_frameworks = vec![FrameworkTag::LlamaCppClass];
        d
    }

    #[tokio::test]
    async fn generate_before_load_fails_not_initialized() {
        let adapter = RestInferenceAdapter::new("http://127.0.0.1:1", FrameworkTag::LlamaCppClass);
        let err = adapter.generate("hi", &GenerationOptions::default()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotInitialized));
    }

    #[tokio::test]
    async fn load_rejects_a_descriptor_with_no_matching_framework() {
        let adapter = RestInferenceAdapter::new("http://127.0.0.1:1", FrameworkTag::OnnxClass);
        let err = adapter
            .load(Path::new("/tmp/tiny.gguf"), &descriptor())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NoCompatibleBackend { .. }));
    }

    #[tokio::test]
    async fn fresh_adapter_reports_unloaded() {
        let adapter = RestInferenceAdapter::new("http://127.0.0.1:1", FrameworkTag::LlamaCppClass);
        assert_eq!(adapter.state(), AdapterState::Unloaded);
    }

    #[tokio::test]
    async fn unload_with_nothing_loaded_is_a_harmless_no_op() {
        let adapter = RestInferenceAdapter::new("http://127.0.0.1:1", FrameworkTag::LlamaCppClass);
        adapter.unload().await.unwrap();
        assert_eq!(adapter.state(), AdapterState::Unloaded);
    }
}
