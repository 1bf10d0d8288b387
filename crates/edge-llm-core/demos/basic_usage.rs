//! Basic usage example - register a model and list what's known.

use edge_llm_core::{EdgeLlmCore, FrameworkTag, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "./example-models".to_string());

    println!("Initializing EdgeLlmCore with path: {}", path);

    let core = EdgeLlmCore::builder(&path).auto_create_dirs(true).build().await?;

    core.add_model_from_url(
        "demo-llama",
        "https://example.com/demo-llama.gguf",
        FrameworkTag::LlamaCppClass,
        Some(4 * 1024 * 1024 * 1024),
        false,
    )
    .await?;

    println!("Listing models...");
    let models = core.list_available_models().await?;

    if models.is_empty() {
        println!("No models found in library.");
    } else {
        println!("Found {} models:", models.len());
        for model in models {
            println!("  - {} ({})", model.display_name, model.id);
        }
    }

    Ok(())
}
