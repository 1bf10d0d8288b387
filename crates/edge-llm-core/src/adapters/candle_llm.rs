//! `llama.cpp-class` adapter backed by `candle-core`/`candle-transformers`.
//!
//! Grounded on the GGUF loading and sampling shape used by the pack's
//! candle-based LLM engine: `gguf_file::Content::read` to parse headers,
//! `ModelWeights::from_gguf` to build the quantized model, and
//! `LogitsProcessor` for temperature/top-p sampling. Streaming here differs
//! from that grounding file's delta-based callback: each adapter generation
//! result is the cumulative text produced so far, not just the new piece.

#![cfg(feature = "backend-llama-cpp")]

use super::{
    AdapterDescription, AdapterState, AudioFormat, FinishReason, GenerationOptions,
    GenerationResult, GenerationStream, InferenceAdapter,
};
use crate::cancel::CancellationToken;
use crate::error::{Result, RuntimeError};
use crate::registry::{FrameworkTag, ModelDescriptor};
use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::Device;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama::ModelWeights;
use futures::stream;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use tokenizers::Tokenizer;
use tokio::sync::Mutex;

struct LoadedModel {
    model: ModelWeights,
    tokenizer: Tokenizer,
    eos_token_id: Option<u32>,
}

/// GGUF/llama.cpp-class text-generation adapter.
///
/// At most one model is resident at a time; `load` replaces any previously
/// loaded model after tearing it down.
pub struct CandleLlamaAdapter {
    inner: Mutex<Option<LoadedModel>>,
    state: StdMutex<AdapterState>,
}

impl CandleLlamaAdapter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            state: StdMutex::new(AdapterState::Unloaded),
        }
    }

    fn set_state(&self, s: AdapterState) {
        *self.state.lock().expect("adapter state mutex poisoned") = s;
    }

    fn load_tokenizer(model_path: &Path) -> Result<Tokenizer> {
        let sibling = model_path
            .parent()
            .map(|dir| dir.join("tokenizer.json"))
            .filter(|p| p.exists());

        let tokenizer_path = sibling.ok_or_else(|| RuntimeError::ModelNotFound {
            id: "tokenizer.json (expected alongside the GGUF file)".into(),
        })?;

        Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| RuntimeError::UnsupportedFormat(format!("failed to load tokenizer: {e}")))
    }

    fn metadata_u32(gguf: &gguf_file::Content, key: &str) -> Option<u32> {
        gguf.metadata.get(key).and_then(|v| match v {
            gguf_file::Value::U32(n) => Some(*n),
            gguf_file::Value::I32(n) => Some(*n as u32),
            gguf_file::Value::U64(n) => Some(*n as u32),
            gguf_file::Value::I64(n) => Some(*n as u32),
            _ => None,
        })
    }
}

impl Default for CandleLlamaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceAdapter for CandleLlamaAdapter {
    fn framework(&self) -> FrameworkTag {
        FrameworkTag::LlamaCppClass
    }

    fn state(&self) -> AdapterState {
        *self.state.lock().expect("adapter state mutex poisoned")
    }

    fn preferred_audio_format(&self) -> AudioFormat {
        AudioFormat::F32Pcm
    }

    async fn load(&self, path: &Path, descriptor: &ModelDescriptor) -> Result<()> {
        self.validate(descriptor)?;
        self.set_state(AdapterState::Loading);

        let path = path.to_path_buf();
        let loaded = tokio::task::spawn_blocking(move || -> Result<LoadedModel> {
            load_blocking(&path)
        })
        .await
        .map_err(|e| RuntimeError::Unknown(e.to_string()))??;

        *self.inner.lock().await = Some(loaded);
        self.set_state(AdapterState::Loaded);
        tracing::info!("llama.cpp-class adapter loaded model");
        Ok(())
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GenerationResult> {
        let mut guard = self.inner.lock().await;
        let loaded = guard.as_mut().ok_or(RuntimeError::NotInitialized)?;
        generate_blocking(loaded, prompt, options, None)
    }

    async fn stream_generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: CancellationToken,
    ) -> Result<GenerationStream> {
        let mut guard = self.inner.lock().await;
        let loaded = guard.as_mut().ok_or(RuntimeError::NotInitialized)?;

        let mut results = Vec::new();
        generate_blocking(loaded, prompt, options, Some(&mut |partial: GenerationResult| {
            let stop = cancel.is_cancelled();
            results.push(partial);
            !stop
        }))?;

        Ok(Box::pin(stream::iter(results.into_iter().map(Ok))))
    }

    async fn unload(&self) -> Result<()> {
        *self.inner.lock().await = None;
        self.set_state(AdapterState::Unloaded);
        Ok(())
    }

    fn describe(&self) -> AdapterDescription {
        AdapterDescription {
            name: "llama.cpp-class (candle GGUF)",
            memory_bytes: None,
        }
    }
}

fn load_blocking(path: &PathBuf) -> Result<LoadedModel> {
    let mut file = File::open(path).map_err(|e| RuntimeError::io_with_path(e, path.clone()))?;
    let gguf = gguf_file::Content::read(&mut file)
        .map_err(|e| RuntimeError::UnsupportedFormat(format!("invalid GGUF file: {e}")))?;

    let eos_token_id = CandleLlamaAdapter::metadata_u32(&gguf, "tokenizer.ggml.eos_token_id");
    let device = Device::Cpu;
    let model = ModelWeights::from_gguf(gguf, &mut file, &device)
        .map_err(|e| RuntimeError::UnsupportedFormat(format!("failed to build model weights: {e}")))?;
    let tokenizer = CandleLlamaAdapter::load_tokenizer(path)?;

    Ok(LoadedModel {
        model,
        tokenizer,
        eos_token_id,
    })
}

/// Generate tokens, invoking `on_partial` with the cumulative text so far
/// after each token when present (streaming path); otherwise runs to
/// completion and returns only the final result (non-streaming path).
fn generate_blocking(
    loaded: &mut LoadedModel,
    prompt: &str,
    options: &GenerationOptions,
    mut on_partial: Option<&mut dyn FnMut(GenerationResult) -> bool>,
) -> Result<GenerationResult> {
    let encoding = loaded
        .tokenizer
        .encode(prompt, true)
        .map_err(|e| RuntimeError::UnsupportedFormat(format!("tokenization failed: {e}")))?;
    let mut tokens: Vec<u32> = encoding.get_ids().to_vec();
    let prompt_len = tokens.len();

    let mut processor = LogitsProcessor::new(
        rand_seed(),
        Some(options.temperature as f64),
        Some(options.top_p as f64),
    );

    let start = std::time::Instant::now();
    let mut cumulative = String::new();
    let mut finish_reason = FinishReason::MaxTokens;

    for step in 0..options.max_tokens {
        let input = candle_core::Tensor::new(tokens.as_slice(), &Device::Cpu)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| RuntimeError::Unknown(format!("tensor build failed: {e}")))?;
        let logits = loaded
            .model
            .forward(&input, prompt_len + step as usize)
            .map_err(|e| RuntimeError::Unknown(format!("forward pass failed: {e}")))?;
        let logits = logits
            .squeeze(0)
            .map_err(|e| RuntimeError::Unknown(e.to_string()))?;

        let next_token = processor
            .sample(&logits)
            .map_err(|e| RuntimeError::Unknown(format!("sampling failed: {e}")))?;

        if Some(next_token) == loaded.eos_token_id {
            finish_reason = FinishReason::Stop;
            break;
        }

        tokens.push(next_token);
        let piece = loaded
            .tokenizer
            .decode(&[next_token], true)
            .map_err(|e| RuntimeError::Unknown(e.to_string()))?;
        cumulative.push_str(&piece);

        if let Some(stop_seq) = options
            .stop_sequences
            .iter()
            .find(|s| cumulative.ends_with(s.as_str()))
        {
            cumulative.truncate(cumulative.len() - stop_seq.len());
            finish_reason = FinishReason::StopSequence;
            if let Some(cb) = on_partial.as_deref_mut() {
                cb(result_so_far(&cumulative, step + 1, start, Some(finish_reason)));
            }
            break;
        }

        let partial = result_so_far(&cumulative, step + 1, start, None);
        if let Some(cb) = on_partial.as_deref_mut() {
            if !cb(partial) {
                finish_reason = FinishReason::Stop;
                break;
            }
        }
    }

    Ok(result_so_far(
        &cumulative,
        tokens.len().saturating_sub(prompt_len) as u32,
        start,
        Some(finish_reason),
    ))
}

fn result_so_far(
    text: &str,
    tokens_generated: u32,
    start: std::time::Instant,
    finish_reason: Option<FinishReason>,
) -> GenerationResult {
    let elapsed = start.elapsed().as_secs_f32().max(f32::EPSILON);
    GenerationResult {
        text: text.to_string(),
        tokens_generated,
        tokens_per_second: tokens_generated as f32 / elapsed,
        finish_reason,
    }
}

fn rand_seed() -> u64 {
    // Deterministic seed: sampling temperature/top-p already introduce the
    // desired variability; a fixed seed keeps adapter behavior reproducible
    // for a given prompt and options, which the download engine's retry
    // tests rely on for the rest of the crate's determinism conventions.
    1337
}
