//! Download Engine (C4).
//!
//! A priority-queued, bounded-concurrency downloader with checksum
//! verification, pluggable archive extraction, deterministic exponential
//! backoff and cooperative cancellation. Generalizes the teacher's
//! `network::download` single-shot fetcher into a queue of concurrently
//! tracked tasks, the same way `network::circuit_breaker` tracked per-host
//! health, except the unit of bookkeeping here is a download task rather
//! than a host.

mod archive;
mod queue;
mod transport;

pub use transport::{ReqwestTransport, Transport, TransportResponse};

use crate::cancel::CancellationToken;
use crate::config::{DownloadConfig, DownloadPriority};
use crate::error::{Result, RuntimeError};
use crate::registry::{FrameworkTag, ModelRegistry};
use crate::storage::StorageManager;
use queue::PriorityDispatcher;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Progress or terminal event emitted on a download task's channel.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// An attempt is retrying after a transient failure.
    Retrying { attempt: u32, delay: Duration },
    /// Bytes have been written to the temporary file.
    Progress {
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },
    /// Verifying checksum / extracting an archive.
    PostProcessing,
    /// The task has reached a terminal state; no further events follow.
    Terminal(Result<PathBuf>),
}

/// Handle to a single in-flight (or already-finished) download.
pub struct DownloadTask {
    pub id: Uuid,
    pub model_id: String,
    events: mpsc::Receiver<DownloadEvent>,
}

impl DownloadTask {
    /// Receive the next event, or `None` once the terminal event has drained.
    pub async fn next_event(&mut self) -> Option<DownloadEvent> {
        self.events.recv().await
    }

    /// Drive the task to completion, discarding intermediate progress.
    pub async fn wait(mut self) -> Result<PathBuf> {
        loop {
            match self.events.recv().await {
                Some(DownloadEvent::Terminal(result)) => return result,
                Some(_) => continue,
                None => return Err(RuntimeError::Unknown("download task dropped before completion".into())),
            }
        }
    }
}

/// Aggregate counters across the engine's lifetime (§6 `statistics`).
#[derive(Debug, Clone, Default)]
pub struct DownloadStatistics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub bytes_downloaded: u64,
}

/// Priority-queued downloader bounded by a configurable concurrency limit.
pub struct DownloadEngine {
    transport: Arc<dyn Transport>,
    storage: Arc<StorageManager>,
    registry: Arc<ModelRegistry>,
    config: RwLock<DownloadConfig>,
    dispatcher: Arc<PriorityDispatcher>,
    tasks: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    /// Active task ids per model id, so a model's in-flight downloads can be
    /// cancelled by id without the caller tracking task ids itself.
    tasks_by_model: Arc<Mutex<HashMap<String, Vec<Uuid>>>>,
    stats: Arc<Mutex<DownloadStatistics>>,
    bytes_downloaded: Arc<AtomicU64>,
}

impl DownloadEngine {
    pub fn new(storage: Arc<StorageManager>, registry: Arc<ModelRegistry>, config: DownloadConfig) -> Self {
        Self::with_transport(storage, registry, config, Arc::new(ReqwestTransport::new()))
    }

    pub fn with_transport(
        storage: Arc<StorageManager>,
        registry: Arc<ModelRegistry>,
        config: DownloadConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let dispatcher = Arc::new(PriorityDispatcher::new(config.max_concurrent_downloads));
        Self {
            transport,
            storage,
            registry,
            config: RwLock::new(config),
            dispatcher,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            tasks_by_model: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(Mutex::new(DownloadStatistics::default())),
            bytes_downloaded: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn set_max_concurrent(&self, max: usize) {
        self.dispatcher.set_max_concurrent(max);
        self.config.write().await.max_concurrent_downloads = max;
    }

    pub fn pause_all(&self) {
        self.dispatcher.pause();
    }

    pub fn resume_all(&self) {
        self.dispatcher.resume();
    }

    pub async fn statistics(&self) -> DownloadStatistics {
        let mut snapshot = self.stats.lock().await.clone();
        snapshot.bytes_downloaded = self.bytes_downloaded.load(Ordering::Relaxed);
        snapshot
    }

    /// Number of tasks not yet in a terminal state.
    pub async fn active_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Request cancellation of a task by id. A no-op if the task has already
    /// reached a terminal state.
    pub async fn cancel(&self, task_id: Uuid) {
        if let Some(token) = self.tasks.lock().await.get(&task_id) {
            token.cancel();
        }
    }

    /// Cancel every in-flight download task for `model_id`. Called before
    /// removing a model's storage so a download cannot resurrect the files a
    /// delete just tore down.
    pub async fn cancel_for_model(&self, model_id: &str) {
        let task_ids = self
            .tasks_by_model
            .lock()
            .await
            .get(model_id)
            .cloned()
            .unwrap_or_default();
        let tasks = self.tasks.lock().await;
        for task_id in task_ids {
            if let Some(token) = tasks.get(&task_id) {
                token.cancel();
            }
        }
    }

    /// Submit a model for download. Always returns a task synchronously,
    /// including when a pre-flight check fails: in that case the task's only
    /// event is an immediate terminal failure, with no network request made.
    pub async fn download(
        &self,
        model_id: &str,
        remote_url: String,
        framework: FrameworkTag,
        priority: DownloadPriority,
    ) -> DownloadTask {
        let task_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();

        self.tasks.lock().await.insert(task_id, cancel.clone());
        self.tasks_by_model
            .lock()
            .await
            .entry(model_id.to_string())
            .or_default()
            .push(task_id);
        self.stats.lock().await.submitted += 1;

        if let Some(needed) = self.registry.get(model_id).await.and_then(|d| d.size_bytes) {
            match self.storage.free_bytes() {
                Ok(available) if available < needed => {
                    self.fail_before_start(
                        task_id,
                        &tx,
                        RuntimeError::InsufficientSpace { needed, available },
                    )
                    .await;
                    return DownloadTask { id: task_id, model_id: model_id.to_string(), events: rx };
                }
                Err(e) => {
                    self.fail_before_start(task_id, &tx, e).await;
                    return DownloadTask { id: task_id, model_id: model_id.to_string(), events: rx };
                }
                _ => {}
            }
        }

        let worker = Worker {
            task_id,
            model_id: model_id.to_string(),
            remote_url,
            framework,
            priority,
            transport: self.transport.clone(),
            storage: self.storage.clone(),
            registry: self.registry.clone(),
            config: self.config.read().await.clone(),
            dispatcher: self.dispatcher.clone(),
            cancel,
            events: tx,
        };

        let stats = self.stats.clone();
        let bytes_downloaded = self.bytes_downloaded.clone();
        let tasks = self.tasks.clone();
        let tasks_by_model = self.tasks_by_model.clone();
        let model_id_owned = model_id.to_string();
        let span = info_span!("download", task_id = %task_id, model_id = %model_id);

        tokio::spawn(
            async move {
                let outcome = worker.run().await;
                let mut stats_guard = stats.lock().await;
                match &outcome {
                    Ok(bytes) => {
                        stats_guard.completed += 1;
                        bytes_downloaded.fetch_add(*bytes, Ordering::Relaxed);
                    }
                    Err(RuntimeError::Cancelled) => stats_guard.cancelled += 1,
                    Err(_) => stats_guard.failed += 1,
                }
                drop(stats_guard);
                tasks.lock().await.remove(&task_id);
                if let Some(ids) = tasks_by_model.lock().await.get_mut(&model_id_owned) {
                    ids.retain(|id| *id != task_id);
                }
            }
            .instrument(span),
        );

        DownloadTask { id: task_id, model_id: model_id.to_string(), events: rx }
    }

    async fn fail_before_start(&self, task_id: Uuid, tx: &mpsc::Sender<DownloadEvent>, err: RuntimeError) {
        warn!(task_id = %task_id, error = %err, "download rejected before dispatch");
        let _ = tx.send(DownloadEvent::Terminal(Err(err))).await;
        self.tasks.lock().await.remove(&task_id);
        for ids in self.tasks_by_model.lock().await.values_mut() {
            ids.retain(|id| *id != task_id);
        }
        self.stats.lock().await.failed += 1;
    }
}

/// Per-task download state machine. Owns its own copy of the config snapshot
/// taken at submission time, so a concurrent `set_max_concurrent` cannot
/// change an in-flight task's retry/timeout behavior mid-flight.
struct Worker {
    task_id: Uuid,
    model_id: String,
    remote_url: String,
    framework: FrameworkTag,
    priority: DownloadPriority,
    transport: Arc<dyn Transport>,
    storage: Arc<StorageManager>,
    registry: Arc<ModelRegistry>,
    config: DownloadConfig,
    dispatcher: Arc<PriorityDispatcher>,
    cancel: CancellationToken,
    events: mpsc::Sender<DownloadEvent>,
}

impl Worker {
    /// Returns the number of bytes written to the final artifact on success.
    async fn run(self) -> Result<u64> {
        match self.run_inner().await {
            Ok((path, bytes)) => {
                let _ = self.events.send(DownloadEvent::Terminal(Ok(path))).await;
                Ok(bytes)
            }
            Err(err) => {
                let is_cancelled = matches!(err, RuntimeError::Cancelled);
                let _ = self.events.send(DownloadEvent::Terminal(Err(err))).await;
                if is_cancelled {
                    Err(RuntimeError::Cancelled)
                } else {
                    Err(RuntimeError::Unknown("download failed".into()))
                }
            }
        }
    }

    async fn run_inner(&self) -> Result<(PathBuf, u64)> {
        if self.dispatcher.acquire(self.priority, &self.cancel).await.is_err() {
            return Err(RuntimeError::Cancelled);
        }
        // From here on we hold a concurrency slot and must release it on
        // every exit path.
        let result = self.download_with_retry().await;
        self.dispatcher.release();
        result
    }

    async fn download_with_retry(&self) -> Result<(PathBuf, u64)> {
        let dir = self.storage.model_dir(&self.model_id, self.framework);
        std::fs::create_dir_all(&dir).map_err(|e| RuntimeError::io_with_path(e, &dir))?;
        let extension = remote_extension(&self.remote_url);
        let temp_path = dir.join(format!(
            "{}{}.{extension}",
            crate::config::RuntimeConstants::TEMP_PREFIX,
            self.task_id
        ));

        let max_attempts = self.config.retry_count + 1;
        let mut attempt = 1u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }

            match self.try_once(&temp_path).await {
                Ok(total_written) => {
                    return self.finalize(&temp_path, &extension, total_written).await;
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    let _ = self
                        .events
                        .send(DownloadEvent::Retrying { attempt, delay })
                        .await;
                    warn!(task_id = %self.task_id, attempt, ?delay, error = %err, "retrying download");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            let _ = std::fs::remove_file(&temp_path);
                            return Err(RuntimeError::Cancelled);
                        }
                    }
                    attempt += 1;
                }
                Err(err) => {
                    let _ = std::fs::remove_file(&temp_path);
                    return Err(err);
                }
            }
        }
    }

    /// One request/response cycle, resuming from any bytes already on disk
    /// from a prior attempt within this same retry loop. Returns the total
    /// byte count written on success.
    async fn try_once(&self, temp_path: &Path) -> Result<u64> {
        let already_written = std::fs::metadata(temp_path).map(|m| m.len()).unwrap_or(0);

        let response = self
            .transport
            .get(&self.remote_url, already_written, self.config.timeout())
            .await?;

        if response.status != 200 && response.status != 206 {
            return Err(RuntimeError::Http { status: response.status });
        }

        let resume_from = if response.resumed { already_written } else { 0 };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!response.resumed)
            .open(temp_path)
            .await
            .map_err(|e| RuntimeError::io_with_path(e, temp_path))?;
        if response.resumed {
            use tokio::io::AsyncSeekExt;
            file.seek(std::io::SeekFrom::Start(resume_from)).await?;
        }

        let mut written = resume_from;
        let mut last_reported = written;
        let mut stream = response.stream;
        use futures::StreamExt;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.persist_resume_hint(written).await;
                    return Err(RuntimeError::Cancelled);
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            file.write_all(&bytes).await.map_err(|e| RuntimeError::io_with_path(e, temp_path))?;
                            written += bytes.len() as u64;
                            if written - last_reported >= crate::config::RuntimeConstants::DOWNLOAD_PROGRESS_CHUNK_BYTES as u64 {
                                last_reported = written;
                                let _ = self.events.send(DownloadEvent::Progress {
                                    bytes_downloaded: written,
                                    total_bytes: response.total_len,
                                }).await;
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => break,
                    }
                }
            }
        }
        file.flush().await.map_err(|e| RuntimeError::io_with_path(e, temp_path))?;

        if let Some(expected) = response.total_len {
            if written != expected {
                return Err(RuntimeError::PartialDownload { got: written, expected: Some(expected) });
            }
        }

        let _ = self
            .events
            .send(DownloadEvent::Progress { bytes_downloaded: written, total_bytes: response.total_len })
            .await;
        Ok(written)
    }

    async fn persist_resume_hint(&self, bytes_written: u64) {
        let cache_dir = self.storage.root().join(crate::config::RuntimeConstants::CACHE_DIR_NAME);
        if std::fs::create_dir_all(&cache_dir).is_err() {
            return;
        }
        let hint_path = cache_dir.join(format!(
            "{}{}",
            crate::config::RuntimeConstants::RESUME_BLOB_PREFIX,
            self.model_id
        ));
        let _ = std::fs::write(hint_path, bytes_written.to_string());
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_delay();
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor)
    }

    async fn finalize(&self, temp_path: &Path, extension: &str, bytes_written: u64) -> Result<(PathBuf, u64)> {
        if let Some(descriptor) = self.registry.get(&self.model_id).await {
            if self.config.verify_checksum {
                if let Some(expected) = &descriptor.checksum {
                    let _ = self.events.send(DownloadEvent::PostProcessing).await;
                    let actual = sha256_hex(temp_path)?;
                    if &actual != expected {
                        let _ = std::fs::remove_file(temp_path);
                        return Err(RuntimeError::ChecksumMismatch {
                            expected: expected.clone(),
                            actual,
                        });
                    }
                }
            }
        }

        let final_path = if archive::is_archive_extension(extension) {
            let _ = self.events.send(DownloadEvent::PostProcessing).await;
            let dest = self.storage.model_dir(&self.model_id, self.framework);
            // Non-resumable extraction: any output from a prior failed
            // attempt is torn down and the archive is re-extracted in full.
            let _ = std::fs::remove_dir_all(&dest);
            let extracted = archive::extract(temp_path, &dest)?;
            let _ = std::fs::remove_file(temp_path);
            extracted
        } else {
            self.storage
                .move_into_storage(temp_path, &self.model_id, self.framework, extension)
                .await?
        };

        self.registry
            .update(&self.model_id, |d| {
                d.local_path = Some(final_path.clone());
                if !d.compatible_frameworks.contains(&self.framework) {
                    d.compatible_frameworks.push(self.framework);
                }
            })
            .await?;

        info!(task_id = %self.task_id, model_id = %self.model_id, path = %final_path.display(), "download complete");
        Ok((final_path, bytes_written))
    }
}

fn remote_extension(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let lower = without_query.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") {
        return "tar.gz".to_string();
    }
    if lower.ends_with(".tar.bz2") {
        return "tar.bz2".to_string();
    }
    if lower.ends_with(".tar.xz") {
        return "tar.xz".to_string();
    }
    Path::new(without_query)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
        .to_string()
}

fn sha256_hex(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| RuntimeError::io_with_path(e, path))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
