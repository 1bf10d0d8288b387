//! HTTP server implementation using Axum.

use crate::handler::{handle_health, handle_rpc};
use axum::{
    routing::{get, post},
    Router,
};
use edge_llm_core::{EdgeLlmCore, VoiceSession};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

/// Application state shared across handlers.
pub struct AppState {
    /// Core facade (model registry, downloads, inference, voice).
    pub core: EdgeLlmCore,
    /// Voice sessions created over RPC, keyed by session id. A session is
    /// removed from the map on `voice-session.disconnect`.
    pub voice_sessions: Mutex<HashMap<Uuid, Arc<VoiceSession>>>,
}

/// Start the JSON-RPC HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(core: EdgeLlmCore, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let state = Arc::new(AppState {
        core,
        voice_sessions: Mutex::new(HashMap::new()),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/rpc", post(handle_rpc))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server error");
    });

    Ok(actual_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_server_starts() {
        let temp_dir = TempDir::new().unwrap();
        let core = EdgeLlmCore::new(temp_dir.path()).await.unwrap();

        let addr = start_server(core, "127.0.0.1", 0).await.unwrap();
        assert!(addr.port() > 0);
    }
}
