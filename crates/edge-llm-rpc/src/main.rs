//! Edge LLM RPC Server - JSON-RPC backend for desktop-application IPC.
//!
//! Wraps `edge-llm-core` behind a JSON-RPC 2.0 HTTP server so a desktop
//! shell (e.g. an Electron main process) can drive model management,
//! downloads, inference and voice sessions over a loopback port.

mod handler;
mod server;

use anyhow::Result;
use clap::Parser;
use edge_llm_adapters::RestInferenceAdapter;
use edge_llm_core::registry::FrameworkTag;
use edge_llm_core::EdgeLlmCore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "edge-llm-rpc")]
#[command(about = "JSON-RPC server for edge-llm-core")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// App data root directory (created if missing)
    #[arg(long)]
    app_data_root: Option<PathBuf>,

    /// Base URL of a running Ollama-compatible inference server to register
    /// as the llama-cpp-class backend. Pass an empty string to skip.
    #[arg(long, default_value = "http://127.0.0.1:11434")]
    inference_base_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Edge LLM RPC Server");

    let app_data_root = args
        .app_data_root
        .or_else(|| dirs::data_dir().map(|d| d.join("edge-llm")))
        .unwrap_or_else(|| std::env::current_dir().unwrap());

    info!("App data root: {}", app_data_root.display());

    let core = EdgeLlmCore::builder(&app_data_root)
        .auto_create_dirs(true)
        .build()
        .await?;

    if !args.inference_base_url.is_empty() {
        core.adapters()
            .register(Arc::new(RestInferenceAdapter::new(
                args.inference_base_url.clone(),
                FrameworkTag::LlamaCppClass,
            )))
            .await;
        info!("Registered REST inference adapter at {}", args.inference_base_url);
    }

    let addr = server::start_server(core, &args.host, args.port).await?;

    // Printed for the parent process to read the assigned port over stdout.
    println!("RPC_PORT={}", addr.port());

    info!("RPC server running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}
