//! Search and filter models example

use edge_llm_core::registry::FilterCriteria;
use edge_llm_core::{EdgeLlmCore, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let path = args.get(1).map(|s| s.as_str()).unwrap_or("./example-models");
    let query = args.get(2).map(|s| s.as_str()).unwrap_or("llama");

    println!("Initializing EdgeLlmCore with path: {}", path);

    let core = EdgeLlmCore::builder(path).auto_create_dirs(true).build().await?;

    println!("Searching for '{}'...", query);
    let criteria = FilterCriteria {
        search: Some(query.to_string()),
        ..Default::default()
    };
    let results = core.registry().filter(&criteria).await;

    println!("Found {} matches:", results.len());
    for model in results {
        println!("  - {} [{:?}] ({})", model.display_name, model.format, model.id);
    }

    Ok(())
}
