//! Integration tests for the `EdgeLlmCore` public facade.

use edge_llm_core::{EdgeLlmCore, FrameworkTag, GenerationOptions, RuntimeError};
use tempfile::TempDir;

#[tokio::test]
async fn creation_succeeds_for_an_existing_root() {
    let temp_dir = TempDir::new().unwrap();
    let core = EdgeLlmCore::new(temp_dir.path()).await;
    assert!(core.is_ok());
}

#[tokio::test]
async fn creation_fails_for_a_nonexistent_root_without_auto_create() {
    let result = EdgeLlmCore::builder("/nonexistent/path/that/does/not/exist").build().await;
    assert!(result.is_err());
}

#[tokio::test]
async fn root_and_models_dir_are_rooted_correctly() {
    let temp_dir = TempDir::new().unwrap();
    let core = EdgeLlmCore::new(temp_dir.path()).await.unwrap();
    assert_eq!(core.root(), temp_dir.path());
    assert!(temp_dir.path().join("Models").exists());
}

#[tokio::test]
async fn fresh_install_has_no_models_or_active_downloads() {
    let temp_dir = TempDir::new().unwrap();
    let core = EdgeLlmCore::new(temp_dir.path()).await.unwrap();

    assert!(core.list_available_models().await.unwrap().is_empty());
    assert!(core.list_downloaded_models().await.unwrap().is_empty());
    assert_eq!(core.active_downloads().await, 0);
}

#[tokio::test]
async fn add_get_and_delete_model_round_trips_through_the_registry() {
    let temp_dir = TempDir::new().unwrap();
    let core = EdgeLlmCore::new(temp_dir.path()).await.unwrap();

    let id = core
        .add_model_from_url("tiny-llama", "https://example.com/tiny.gguf", FrameworkTag::LlamaCppClass, Some(512), false)
        .await
        .unwrap();

    let descriptor = core.get_model(&id).await.unwrap();
    assert_eq!(descriptor.display_name, "tiny-llama");
    assert_eq!(descriptor.compatible_frameworks, vec![FrameworkTag::LlamaCppClass]);

    core.delete_model(&id).await.unwrap();
    assert!(core.get_model(&id).await.is_none());
}

#[tokio::test]
async fn delete_model_for_an_unknown_id_fails_model_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let core = EdgeLlmCore::new(temp_dir.path()).await.unwrap();

    let err = core.delete_model("does-not-exist").await.unwrap_err();
    assert!(matches!(err, RuntimeError::ModelNotFound { .. }));
}

#[tokio::test]
async fn download_model_for_an_unknown_id_fails_model_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let core = EdgeLlmCore::new(temp_dir.path()).await.unwrap();

    let err = core.download_model("does-not-exist").await.unwrap_err();
    assert!(matches!(err, RuntimeError::ModelNotFound { .. }));
}

#[tokio::test]
async fn load_model_before_it_has_a_local_path_fails_model_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let core = EdgeLlmCore::new(temp_dir.path()).await.unwrap();

    let id = core
        .add_model_from_url("tiny-llama", "https://example.com/tiny.gguf", FrameworkTag::LlamaCppClass, Some(512), false)
        .await
        .unwrap();

    let err = core.load_model(&id).await.unwrap_err();
    assert!(matches!(err, RuntimeError::ModelNotFound { .. }));
}

#[tokio::test]
async fn generate_with_nothing_loaded_fails_not_initialized() {
    let temp_dir = TempDir::new().unwrap();
    let core = EdgeLlmCore::new(temp_dir.path()).await.unwrap();

    let err = core.generate("hello", &GenerationOptions::default()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::NotInitialized));
}

#[tokio::test]
async fn unload_with_nothing_loaded_is_a_harmless_no_op() {
    let temp_dir = TempDir::new().unwrap();
    let core = EdgeLlmCore::new(temp_dir.path()).await.unwrap();
    core.unload_model().await;
}

#[tokio::test]
async fn pause_and_resume_all_downloads_do_not_panic_with_nothing_queued() {
    let temp_dir = TempDir::new().unwrap();
    let core = EdgeLlmCore::new(temp_dir.path()).await.unwrap();
    core.pause_all_downloads();
    core.resume_all_downloads();
    let stats = core.download_statistics().await;
    assert_eq!(stats.submitted, 0);
}
