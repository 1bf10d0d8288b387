//! Integration tests for the edge-llm-rpc JSON-RPC server.

use serde_json::{json, Value};
use tempfile::TempDir;

/// Make an RPC call to the server.
async fn rpc_call(port: u16, method: &str, params: Value) -> Value {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{}/rpc", port))
        .json(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .expect("request should succeed");

    response.json().await.expect("response should be valid json")
}

#[path = "../src/handler.rs"]
mod handler;
#[path = "../src/server.rs"]
mod server;

async fn start_test_server() -> (TempDir, u16) {
    let temp_dir = TempDir::new().unwrap();
    let core = edge_llm_core::EdgeLlmCore::new(temp_dir.path()).await.unwrap();
    let addr = server::start_server(core, "127.0.0.1", 0).await.unwrap();
    (temp_dir, addr.port())
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let (_temp_dir, port) = start_test_server().await;
    let response = reqwest::get(format!("http://127.0.0.1:{}/health", port))
        .await
        .unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn list_available_models_starts_empty() {
    let (_temp_dir, port) = start_test_server().await;
    let response = rpc_call(port, "list-available-models", json!({})).await;
    assert_eq!(response["result"], json!([]));
}

#[tokio::test]
async fn add_get_and_delete_model_round_trips_over_rpc() {
    let (_temp_dir, port) = start_test_server().await;

    let add = rpc_call(
        port,
        "add-model-from-url",
        json!({
            "name": "tiny-llama",
            "url": "https://example.com/tiny.gguf",
            "framework": "llama-cpp-class",
            "estimated-size": 512,
        }),
    )
    .await;
    let id = add["result"]["id"].as_str().unwrap().to_string();

    let get = rpc_call(port, "get-model", json!({ "id": id })).await;
    assert_eq!(get["result"]["display_name"], json!("tiny-llama"));

    let delete = rpc_call(port, "delete-model", json!({ "id": id })).await;
    assert_eq!(delete["result"]["success"], json!(true));
}

#[tokio::test]
async fn unknown_method_returns_a_json_rpc_error() {
    let (_temp_dir, port) = start_test_server().await;
    let response = rpc_call(port, "not-a-real-method", json!({})).await;
    assert!(response.get("error").is_some());
}

#[tokio::test]
async fn generate_without_a_loaded_model_returns_a_json_rpc_error() {
    let (_temp_dir, port) = start_test_server().await;
    let response = rpc_call(port, "generate", json!({ "prompt": "hello" })).await;
    assert!(response.get("error").is_some());
}
