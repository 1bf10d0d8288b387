//! Event/Progress Aggregator (C11).
//!
//! Merges multiple per-task progress sequences into one aggregated
//! snapshot: summed bytes, a weighted percentage, and the worst state
//! across all tracked tasks. Grounded on `saorsa-labs-fae`'s
//! `progress.rs`, whose `ProgressEvent::AggregateProgress` already
//! carries exactly this shape (`bytes_downloaded`/`total_bytes`/
//! `files_complete`/`files_total`) for a callback-based, download-only
//! case; this module generalizes it to an arbitrary number of live
//! task streams (downloads, generations, voice segments) merged
//! concurrently via a broadcast channel instead of a single callback.

use crate::download::{DownloadEvent, DownloadTask};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::debug;

/// State of one tracked task, ordered worst-to-best for aggregation:
/// a single failed task makes the whole aggregate read as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    Completed,
    Running,
    Cancelled,
    Failed,
}

/// One task's progress, as reported by its source stream.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub state: TaskState,
}

/// A merged view across every task currently tracked by the aggregator.
#[derive(Debug, Clone, Default)]
pub struct AggregateSnapshot {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub tasks_complete: usize,
    pub tasks_total: usize,
    pub worst_state: Option<TaskState>,
}

impl AggregateSnapshot {
    pub fn percentage(&self) -> f64 {
        if self.bytes_total > 0 {
            (self.bytes_done as f64 / self.bytes_total as f64) * 100.0
        } else if self.tasks_total > 0 {
            (self.tasks_complete as f64 / self.tasks_total as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// Merges concurrently-registered task streams into one broadcast of
/// [`AggregateSnapshot`]s. Registration and removal both go through the
/// same lock as the merge loop, so a source can never observe a
/// half-updated snapshot.
pub struct ProgressAggregator {
    tasks: Arc<RwLock<HashMap<String, ProgressUpdate>>>,
    snapshots: broadcast::Sender<AggregateSnapshot>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            snapshots: tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AggregateSnapshot> {
        self.snapshots.subscribe()
    }

    async fn publish(&self) {
        let tasks = self.tasks.read().await;
        let mut snapshot = AggregateSnapshot {
            tasks_total: tasks.len(),
            ..Default::default()
        };
        for update in tasks.values() {
            snapshot.bytes_done += update.bytes_done;
            snapshot.bytes_total += update.bytes_total.unwrap_or(0);
            if update.state == TaskState::Completed {
                snapshot.tasks_complete += 1;
            }
            snapshot.worst_state = Some(match snapshot.worst_state {
                Some(current) if current >= update.state => current,
                _ => update.state,
            });
        }
        let _ = self.snapshots.send(snapshot);
    }

    /// Atomically add or update one task's progress and republish.
    pub async fn report(&self, task_id: impl Into<String>, update: ProgressUpdate) {
        self.tasks.write().await.insert(task_id.into(), update);
        self.publish().await;
    }

    /// Remove a task from the aggregate atomically. The aggregate
    /// terminates (a final snapshot with `tasks_total == 0`) once the
    /// last source is removed.
    pub async fn remove_source(&self, task_id: &str) {
        self.tasks.write().await.remove(task_id);
        self.publish().await;
    }

    /// Register a raw progress channel as a tracked source: an
    /// internal task drains it until closed, reporting and then
    /// removing itself.
    pub fn register_source(
        self: &Arc<Self>,
        task_id: impl Into<String> + Send + 'static,
        mut updates: mpsc::Receiver<ProgressUpdate>,
    ) {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let task_id = task_id.into();
            while let Some(update) = updates.recv().await {
                aggregator.report(task_id.clone(), update).await;
            }
            aggregator.remove_source(&task_id).await;
            debug!(task_id, "progress source drained");
        });
    }

    /// Track a [`DownloadTask`] directly, translating its own event
    /// stream into aggregated progress without the caller needing to
    /// know the download engine's event shape.
    pub fn track_download(self: &Arc<Self>, mut task: DownloadTask) {
        let aggregator = Arc::clone(self);
        let task_id = task.id.to_string();
        tokio::spawn(async move {
            while let Some(event) = task.next_event().await {
                let update = match event {
                    DownloadEvent::Progress { bytes_downloaded, total_bytes } => ProgressUpdate {
                        bytes_done: bytes_downloaded,
                        bytes_total: total_bytes,
                        state: TaskState::Running,
                    },
                    DownloadEvent::Retrying { .. } | DownloadEvent::PostProcessing => continue,
                    DownloadEvent::Terminal(Ok(_)) => ProgressUpdate {
                        bytes_done: 0,
                        bytes_total: None,
                        state: TaskState::Completed,
                    },
                    DownloadEvent::Terminal(Err(ref e)) if matches!(e, crate::error::RuntimeError::Cancelled) => {
                        ProgressUpdate { bytes_done: 0, bytes_total: None, state: TaskState::Cancelled }
                    }
                    DownloadEvent::Terminal(Err(_)) => ProgressUpdate {
                        bytes_done: 0,
                        bytes_total: None,
                        state: TaskState::Failed,
                    },
                };
                let is_terminal = matches!(
                    update.state,
                    TaskState::Completed | TaskState::Failed | TaskState::Cancelled
                );
                aggregator.report(task_id.clone(), update).await;
                if is_terminal {
                    break;
                }
            }
            aggregator.remove_source(&task_id).await;
        });
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_task_snapshot_reflects_its_progress() {
        let aggregator = Arc::new(ProgressAggregator::new());
        let mut rx = aggregator.subscribe();
        aggregator
            .report("a", ProgressUpdate { bytes_done: 50, bytes_total: Some(100), state: TaskState::Running })
            .await;
        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.bytes_done, 50);
        assert_eq!(snap.bytes_total, 100);
        assert_eq!(snap.percentage(), 50.0);
    }

    #[tokio::test]
    async fn one_failed_task_makes_worst_state_failed() {
        let aggregator = Arc::new(ProgressAggregator::new());
        let mut rx = aggregator.subscribe();
        aggregator
            .report("a", ProgressUpdate { bytes_done: 10, bytes_total: Some(10), state: TaskState::Completed })
            .await;
        rx.recv().await.unwrap();
        aggregator
            .report("b", ProgressUpdate { bytes_done: 0, bytes_total: Some(10), state: TaskState::Failed })
            .await;
        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.worst_state, Some(TaskState::Failed));
    }

    #[tokio::test]
    async fn removing_the_last_source_drains_the_aggregate() {
        let aggregator = Arc::new(ProgressAggregator::new());
        let mut rx = aggregator.subscribe();
        aggregator
            .report("a", ProgressUpdate { bytes_done: 5, bytes_total: Some(10), state: TaskState::Running })
            .await;
        rx.recv().await.unwrap();
        aggregator.remove_source("a").await;
        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.tasks_total, 0);
    }

    #[tokio::test]
    async fn registered_channel_source_reports_and_then_removes_itself() {
        let aggregator = Arc::new(ProgressAggregator::new());
        let mut rx = aggregator.subscribe();
        let (tx, updates) = mpsc::channel(4);
        aggregator.register_source("c", updates);
        tx.send(ProgressUpdate { bytes_done: 1, bytes_total: Some(2), state: TaskState::Running })
            .await
            .unwrap();
        drop(tx);

        let mut saw_progress = false;
        let mut saw_drain = false;
        for _ in 0..5 {
            let snap = rx.recv().await.unwrap();
            if snap.tasks_total == 1 {
                saw_progress = true;
            }
            if snap.tasks_total == 0 && saw_progress {
                saw_drain = true;
                break;
            }
        }
        assert!(saw_progress);
        assert!(saw_drain);
    }
}
