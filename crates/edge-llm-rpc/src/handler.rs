//! JSON-RPC request handlers.
//!
//! Dispatches the public operations named in the external-interfaces
//! contract (`list-available-models`, `add-model-from-url`, `download-model`,
//! `load-model`, `generate`, voice session lifecycle, ...) onto the
//! `EdgeLlmCore` facade owned by `AppState`.

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use edge_llm_core::voice::VoiceActivityDetector;
use edge_llm_core::{
    cancel::CancellationToken, FrameworkTag, GenerationOptions, PipelineComponents, PipelineFactory,
    RuntimeError,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Builds a pipeline over the facade's own inference service with no
/// STT/TTS stage; a dedicated adapter for those stages is supplied by the
/// host application rather than this loopback server.
struct LlmOnlyFactory {
    app: Arc<AppState>,
}

impl PipelineFactory for LlmOnlyFactory {
    fn build(&self) -> PipelineComponents {
        PipelineComponents {
            vad: Some(VoiceActivityDetector::new(self.app.core.config().vad.clone())),
            stt: None,
            llm: Some(self.app.core.inference().clone()),
            tts: None,
        }
    }
}

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError { code, message }),
            id,
        }
    }
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Main JSON-RPC handler.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let method = &request.method;
    let params = request.params.unwrap_or(Value::Object(Default::default()));
    let id = request.id.clone();

    debug!("RPC call: {}({:?})", method, params);

    if method == "health-check" {
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::success(id, json!({"status": "ok"}))),
        );
    }

    match dispatch_method(&state, method, &params).await {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(e) => {
            error!("RPC error for {}: {}", method, e);
            let code = rpc_error_code(&e);
            (
                StatusCode::OK,
                Json(JsonRpcResponse::error(id, code, e.to_string())),
            )
        }
    }
}

/// Map a `RuntimeError` onto a JSON-RPC error code. Unknown/unclassified
/// errors use the reserved server-error range.
fn rpc_error_code(err: &RuntimeError) -> i32 {
    match err {
        RuntimeError::ModelNotFound { .. } => -32001,
        RuntimeError::NoCompatibleBackend { .. } => -32002,
        RuntimeError::NotInitialized => -32003,
        RuntimeError::Validation { .. } | RuntimeError::InvalidUrl(_) => -32602,
        RuntimeError::Cancelled => -32004,
        _ => -32000,
    }
}

fn get_str_param<'a>(params: &'a Value, name: &str) -> Option<&'a str> {
    params.get(name).and_then(|v| v.as_str())
}

fn require_str_param(params: &Value, name: &str) -> Result<String, RuntimeError> {
    get_str_param(params, name)
        .map(str::to_string)
        .ok_or_else(|| RuntimeError::Validation {
            field: name.to_string(),
            message: "missing required parameter".to_string(),
        })
}

fn parse_framework_tag(s: &str) -> Result<FrameworkTag, RuntimeError> {
    serde_json::from_value(json!(s)).map_err(|_| RuntimeError::Validation {
        field: "framework".to_string(),
        message: format!("unrecognized framework tag: {s}"),
    })
}

fn parse_generation_options(params: &Value) -> GenerationOptions {
    let mut options = GenerationOptions::default();
    if let Some(t) = params.get("temperature").and_then(Value::as_f64) {
        options.temperature = t as f32;
    }
    if let Some(p) = params.get("top-p").and_then(Value::as_f64) {
        options.top_p = p as f32;
    }
    if let Some(m) = params.get("max-tokens").and_then(Value::as_u64) {
        options.max_tokens = m as u32;
    }
    options
}

/// Dispatch a method call to the appropriate facade operation.
async fn dispatch_method(
    state: &Arc<AppState>,
    method: &str,
    params: &Value,
) -> edge_llm_core::Result<Value> {
    let core = &state.core;
    match method {
        // Models
        "list-available-models" => {
            let models = core.list_available_models().await?;
            Ok(serde_json::to_value(models)?)
        }
        "list-downloaded-models" => {
            let models = core.list_downloaded_models().await?;
            Ok(serde_json::to_value(models)?)
        }
        "add-model-from-url" => {
            let name = require_str_param(params, "name")?;
            let url = require_str_param(params, "url")?;
            let framework = parse_framework_tag(&require_str_param(params, "framework")?)?;
            let estimated_size = params.get("estimated-size").and_then(Value::as_u64);
            let supports_thinking = params
                .get("supports-thinking")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let id = core
                .add_model_from_url(&name, &url, framework, estimated_size, supports_thinking)
                .await?;
            Ok(json!({ "id": id }))
        }
        "get-model" => {
            let id = require_str_param(params, "id")?;
            let model = core.get_model(&id).await;
            Ok(serde_json::to_value(model)?)
        }
        "delete-model" => {
            let id = require_str_param(params, "id")?;
            core.delete_model(&id).await?;
            Ok(json!({ "success": true }))
        }
        "validate-model" => {
            let path = require_str_param(params, "path")?;
            let detection = core.validate_model(&path).await?;
            Ok(serde_json::to_value(detection)?)
        }

        // Downloads
        "download-model" => {
            let id = require_str_param(params, "id")?;
            let task = core.download_model(&id).await?;
            Ok(json!({ "task-id": task.id, "model-id": task.model_id }))
        }
        "cancel-download" => {
            let task_id = require_str_param(params, "task-id")?;
            let uuid = uuid::Uuid::parse_str(&task_id).map_err(|_| RuntimeError::Validation {
                field: "task-id".to_string(),
                message: "not a valid task id".to_string(),
            })?;
            core.cancel_download(uuid).await;
            Ok(json!({ "success": true }))
        }
        "active-downloads" => Ok(json!({ "count": core.active_downloads().await })),
        "pause-all" => {
            core.pause_all_downloads();
            Ok(json!({ "success": true }))
        }
        "resume-all" => {
            core.resume_all_downloads();
            Ok(json!({ "success": true }))
        }
        "download-statistics" => Ok(serde_json::to_value(core.download_statistics().await)?),

        // Inference
        "load-model" => {
            let id = require_str_param(params, "id")?;
            core.load_model(&id).await?;
            Ok(json!({ "success": true }))
        }
        "unload-model" => {
            core.unload_model().await;
            Ok(json!({ "success": true }))
        }
        "generate" => {
            let prompt = require_str_param(params, "prompt")?;
            let options = parse_generation_options(params);
            let result = core.generate(&prompt, &options).await?;
            Ok(serde_json::to_value(result)?)
        }
        "stream-generate" => {
            // A loopback JSON-RPC request/response round trip has no native
            // notion of a lazy sequence; this drains the stream here and
            // returns the final cumulative result rather than each
            // intermediate token.
            let prompt = require_str_param(params, "prompt")?;
            let options = parse_generation_options(params);
            let mut stream = core
                .stream_generate(&prompt, &options, CancellationToken::new())
                .await?;
            let mut result = None;
            while let Some(item) = stream.next().await {
                result = Some(item?);
            }
            Ok(serde_json::to_value(result)?)
        }

        // Voice
        "create-voice-session" => {
            let sample_rate = params.get("sample-rate").and_then(Value::as_u64).unwrap_or(16_000) as u32;
            let max_speech_duration_seconds = params
                .get("max-speech-duration-seconds")
                .and_then(Value::as_f64)
                .unwrap_or(30.0);
            let factory = Arc::new(LlmOnlyFactory { app: state.clone() });
            let session = Arc::new(core.create_voice_session(factory, sample_rate, max_speech_duration_seconds));
            let session_id = session.id;
            state.voice_sessions.lock().await.insert(session_id, session);
            Ok(json!({ "session-id": session_id }))
        }
        "voice-session.connect" => {
            let session = get_voice_session(state, params).await?;
            session.connect().await?;
            Ok(json!({ "success": true }))
        }
        "voice-session.disconnect" => {
            let session_id = require_session_id(params)?;
            if let Some(session) = state.voice_sessions.lock().await.remove(&session_id) {
                session.disconnect().await;
            }
            Ok(json!({ "success": true }))
        }
        "voice-session.start-listening" => {
            let session = get_voice_session(state, params).await?;
            session.start_listening().await?;
            Ok(json!({ "success": true }))
        }
        "voice-session.stop-listening" => {
            let session = get_voice_session(state, params).await?;
            session.stop_listening().await?;
            Ok(json!({ "success": true }))
        }
        "voice-session.interrupt" => {
            let session = get_voice_session(state, params).await?;
            session.interrupt().await?;
            Ok(json!({ "success": true }))
        }
        "voice-session.state" => {
            let session = get_voice_session(state, params).await?;
            Ok(json!({ "state": format!("{:?}", session.state().await) }))
        }

        _ => Err(RuntimeError::Validation {
            field: "method".to_string(),
            message: format!("unknown method: {method}"),
        }),
    }
}

fn require_session_id(params: &Value) -> edge_llm_core::Result<Uuid> {
    let raw = require_str_param(params, "session-id")?;
    Uuid::parse_str(&raw).map_err(|_| RuntimeError::Validation {
        field: "session-id".to_string(),
        message: "not a valid session id".to_string(),
    })
}

async fn get_voice_session(
    state: &Arc<AppState>,
    params: &Value,
) -> edge_llm_core::Result<Arc<edge_llm_core::VoiceSession>> {
    let session_id = require_session_id(params)?;
    state
        .voice_sessions
        .lock()
        .await
        .get(&session_id)
        .cloned()
        .ok_or_else(|| RuntimeError::Validation {
            field: "session-id".to_string(),
            message: "no such voice session".to_string(),
        })
}
