//! Edge LLM Adapters - out-of-process inference backends for `edge-llm-core`.
//!
//! `edge-llm-core` ships in-process adapters (ONNX, Candle, a native seam)
//! directly; this crate adds adapters that instead talk to a separately
//! running inference server over HTTP, for hosts that already run one
//! (e.g. a local Ollama daemon) rather than loading weights in-process.
//!
//! # Modules
//!
//! - `rest_adapter` - `InferenceAdapter` backed by an Ollama-compatible
//!   `/api/generate` HTTP endpoint
//! - `ollama_client` - lower-level HTTP client for Ollama's model-management
//!   API (list/create/delete/load/unload), used to prepare a model on the
//!   remote server before `rest_adapter` drives generation against it

pub mod ollama_client;
pub mod rest_adapter;

pub use ollama_client::{derive_ollama_name, OllamaClient, OllamaModel, RunningModel};
pub use rest_adapter::RestInferenceAdapter;
