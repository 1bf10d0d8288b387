//! Storage Manager (C3).
//!
//! Canonical on-disk layout: `<root>/<framework-tag>/<model-id>/<model-id>.<ext>`
//! plus sibling files. Writers are serialized per model id so no two
//! concurrent writers target the same final path.

use crate::config::RuntimeConstants;
use crate::error::{Result, RuntimeError};
use crate::registry::FrameworkTag;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Framework-scoped, per-model-id file layout rooted at a "Models" directory.
pub struct StorageManager {
    root: PathBuf,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StorageManager {
    /// Construct a storage manager rooted at `<app_data_root>/Models`.
    /// The root directory check is a hard precondition: if it cannot be
    /// created or is not writable, construction fails.
    pub fn new(app_data_root: impl AsRef<Path>) -> Result<Self> {
        let root = app_data_root
            .as_ref()
            .join(RuntimeConstants::MODELS_DIR_NAME);
        std::fs::create_dir_all(&root).map_err(|e| RuntimeError::io_with_path(e, &root))?;
        // Verify writability with a throwaway probe file.
        let probe = root.join(format!("{}probe", RuntimeConstants::TEMP_PREFIX));
        std::fs::write(&probe, b"").map_err(|e| RuntimeError::io_with_path(e, &root))?;
        let _ = std::fs::remove_file(&probe);

        Ok(Self {
            root,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic final path for `(model_id, framework)`, before the
    /// artifact's extension is known.
    pub fn model_dir(&self, model_id: &str, framework: FrameworkTag) -> PathBuf {
        self.root.join(framework.to_string()).join(model_id)
    }

    pub fn final_path(&self, model_id: &str, framework: FrameworkTag, extension: &str) -> PathBuf {
        self.model_dir(model_id, framework)
            .join(format!("{model_id}.{extension}"))
    }

    async fn lock_for(&self, model_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Report free bytes on the volume hosting the storage root.
    pub fn free_bytes(&self) -> Result<u64> {
        fs2::available_space(&self.root).map_err(|e| RuntimeError::io_with_path(e, &self.root))
    }

    /// Atomically promote a downloaded temporary file into the canonical
    /// location for `(model_id, framework)`, replacing any prior file there.
    pub async fn move_into_storage(
        &self,
        temporary: &Path,
        model_id: &str,
        framework: FrameworkTag,
        extension: &str,
    ) -> Result<PathBuf> {
        let lock = self.lock_for(model_id).await;
        let _guard = lock.lock().await;

        let dir = self.model_dir(model_id, framework);
        std::fs::create_dir_all(&dir).map_err(|e| RuntimeError::io_with_path(e, &dir))?;
        let dest = dir.join(format!("{model_id}.{extension}"));

        std::fs::rename(temporary, &dest).or_else(|_| {
            // Cross-device rename: fall back to copy + remove.
            std::fs::copy(temporary, &dest)?;
            std::fs::remove_file(temporary)
        })
        .map_err(|e| RuntimeError::io_with_path(e, &dest))?;

        info!(model_id, framework = %framework, path = %dest.display(), "promoted model into storage");
        Ok(dest)
    }

    /// Remove the per-model directory. The download engine is responsible
    /// for cancelling any in-flight download for `id` before this is called.
    pub async fn delete_model(&self, model_id: &str, framework: FrameworkTag) -> Result<()> {
        let lock = self.lock_for(model_id).await;
        let _guard = lock.lock().await;

        let dir = self.model_dir(model_id, framework);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| RuntimeError::io_with_path(e, &dir))?;
        }
        Ok(())
    }

    pub fn exists(&self, model_id: &str, framework: FrameworkTag) -> bool {
        self.model_dir(model_id, framework).exists()
    }

    /// Total size in bytes of everything under a model's directory.
    pub fn size(&self, model_id: &str, framework: FrameworkTag) -> Result<u64> {
        let dir = self.model_dir(model_id, framework);
        if !dir.exists() {
            return Ok(0);
        }
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&dir) {
            let entry = entry.map_err(|e| RuntimeError::Config {
                message: e.to_string(),
            })?;
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }

    /// List `(framework, model_id)` pairs present on disk.
    pub fn list_installed(&self) -> Result<Vec<(FrameworkTag, String)>> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        for framework_entry in std::fs::read_dir(&self.root)? {
            let framework_entry = framework_entry?;
            if !framework_entry.file_type()?.is_dir() {
                continue;
            }
            let Some(framework) = parse_framework_dir(&framework_entry.file_name()) else {
                continue;
            };
            for model_entry in std::fs::read_dir(framework_entry.path())? {
                let model_entry = model_entry?;
                if model_entry.file_type()?.is_dir() {
                    out.push((framework, model_entry.file_name().to_string_lossy().into_owned()));
                }
            }
        }
        Ok(out)
    }

    /// Remove every file anywhere under the root whose name carries the
    /// reserved temporary prefix.
    pub fn cleanup_temp(&self) -> Result<usize> {
        let mut removed = 0;
        if !self.root.exists() {
            return Ok(0);
        }
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| RuntimeError::Config {
                message: e.to_string(),
            })?;
            if entry.file_type().is_file() {
                let name = entry.file_name().to_string_lossy();
                if name.starts_with(RuntimeConstants::TEMP_PREFIX) {
                    if std::fs::remove_file(entry.path()).is_ok() {
                        removed += 1;
                        debug!(path = %entry.path().display(), "removed stale temp file");
                    }
                }
            }
        }
        Ok(removed)
    }
}

fn parse_framework_dir(name: &std::ffi::OsStr) -> Option<FrameworkTag> {
    let name = name.to_str()?;
    for tag in [
        FrameworkTag::CoreMlClass,
        FrameworkTag::TfliteClass,
        FrameworkTag::OnnxClass,
        FrameworkTag::LlamaCppClass,
        FrameworkTag::ExecuTorchClass,
        FrameworkTag::MlxClass,
        FrameworkTag::MediaPipeClass,
        FrameworkTag::PicoLlmClass,
        FrameworkTag::PlatformFoundationClass,
        FrameworkTag::WhisperKitClass,
        FrameworkTag::SystemTtsClass,
    ] {
        if tag.to_string() == name {
            return Some(tag);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn move_into_storage_produces_deterministic_path() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();

        let tmp = dir.path().join("download.tmp");
        std::fs::write(&tmp, b"weights").unwrap();

        let dest = storage
            .move_into_storage(&tmp, "qwen-2.5-0.5b", FrameworkTag::LlamaCppClass, "gguf")
            .await
            .unwrap();

        assert_eq!(
            dest,
            storage.final_path("qwen-2.5-0.5b", FrameworkTag::LlamaCppClass, "gguf")
        );
        assert!(dest.exists());
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn move_into_storage_replaces_prior_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();

        let tmp1 = dir.path().join("a.tmp");
        std::fs::write(&tmp1, b"v1").unwrap();
        storage
            .move_into_storage(&tmp1, "m", FrameworkTag::OnnxClass, "onnx")
            .await
            .unwrap();

        let tmp2 = dir.path().join("b.tmp");
        std::fs::write(&tmp2, b"v2").unwrap();
        let dest = storage
            .move_into_storage(&tmp2, "m", FrameworkTag::OnnxClass, "onnx")
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn delete_model_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();
        let tmp = dir.path().join("a.tmp");
        std::fs::write(&tmp, b"v1").unwrap();
        storage
            .move_into_storage(&tmp, "m", FrameworkTag::OnnxClass, "onnx")
            .await
            .unwrap();

        assert!(storage.exists("m", FrameworkTag::OnnxClass));
        storage.delete_model("m", FrameworkTag::OnnxClass).await.unwrap();
        assert!(!storage.exists("m", FrameworkTag::OnnxClass));
    }

    #[tokio::test]
    async fn cleanup_temp_removes_reserved_prefix_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();
        let model_dir = storage.model_dir("m", FrameworkTag::OnnxClass);
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join(format!("{}x", RuntimeConstants::TEMP_PREFIX)), b"").unwrap();
        std::fs::write(model_dir.join("keep.onnx"), b"").unwrap();

        let removed = storage.cleanup_temp().unwrap();
        assert_eq!(removed, 1);
        assert!(model_dir.join("keep.onnx").exists());
    }

    #[tokio::test]
    async fn list_installed_finds_framework_and_model_id() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path()).unwrap();
        let tmp = dir.path().join("a.tmp");
        std::fs::write(&tmp, b"v1").unwrap();
        storage
            .move_into_storage(&tmp, "m", FrameworkTag::LlamaCppClass, "gguf")
            .await
            .unwrap();

        let installed = storage.list_installed().unwrap();
        assert_eq!(installed, vec![(FrameworkTag::LlamaCppClass, "m".to_string())]);
    }
}
