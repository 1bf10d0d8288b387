//! Priority dispatch for bounded-concurrency downloads.
//!
//! Higher-[`DownloadPriority`](crate::config::DownloadPriority) tasks are
//! dispatched before lower ones; tasks of equal priority dispatch in
//! first-queued-first-dispatched order. A task waiting for a slot can still
//! observe cancellation, so a queued-but-not-yet-started task is abandoned
//! rather than dispatched once its owning worker cancels.

use crate::cancel::CancellationToken;
use crate::config::DownloadPriority;
use crate::error::{Result, RuntimeError};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;
use tokio::sync::oneshot;

pub struct QueueEntry {
    priority: DownloadPriority,
    seq: u64,
    go: oneshot::Sender<()>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority pops first; among equal
        // priorities, the lower (earlier) sequence number pops first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded-concurrency priority gate shared by every download task.
pub struct PriorityDispatcher {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    active: AtomicUsize,
    max_concurrent: AtomicUsize,
    paused: AtomicBool,
    seq: AtomicU64,
}

impl PriorityDispatcher {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            active: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(max_concurrent.max(1)),
            paused: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        }
    }

    pub fn set_max_concurrent(&self, max: usize) {
        self.max_concurrent.store(max.max(1), AtomicOrdering::SeqCst);
        self.try_dispatch();
    }

    pub fn pause(&self) {
        self.paused.store(true, AtomicOrdering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, AtomicOrdering::SeqCst);
        self.try_dispatch();
    }

    /// Wait for a concurrency slot at `priority`, racing against `cancel`.
    /// On success the caller owns a slot and must call [`Self::release`]
    /// exactly once when the download finishes, fails, or is cancelled after
    /// dispatch.
    pub async fn acquire(&self, priority: DownloadPriority, cancel: &CancellationToken) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut heap = self.heap.lock().expect("queue mutex poisoned");
            let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
            heap.push(QueueEntry { priority, seq, go: tx });
        }
        self.try_dispatch();

        tokio::select! {
            result = rx => result.map_err(|_| RuntimeError::Cancelled),
            _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
        }
    }

    pub fn release(&self) {
        self.active.fetch_sub(1, AtomicOrdering::SeqCst);
        self.try_dispatch();
    }

    fn try_claim_slot(&self) -> bool {
        loop {
            let current = self.active.load(AtomicOrdering::SeqCst);
            let max = self.max_concurrent.load(AtomicOrdering::SeqCst);
            if current >= max {
                return false;
            }
            if self
                .active
                .compare_exchange(current, current + 1, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn try_dispatch(&self) {
        if self.paused.load(AtomicOrdering::SeqCst) {
            return;
        }
        loop {
            if !self.try_claim_slot() {
                break;
            }
            let popped = self.heap.lock().expect("queue mutex poisoned").pop();
            match popped {
                Some(entry) => {
                    // The waiter may have cancelled while queued, in which
                    // case its receiver is already dropped; give the slot
                    // back and keep draining the heap.
                    if entry.go.send(()).is_err() {
                        self.active.fetch_sub(1, AtomicOrdering::SeqCst);
                        continue;
                    }
                }
                None => {
                    self.active.fetch_sub(1, AtomicOrdering::SeqCst);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatches_higher_priority_before_lower() {
        let dispatcher = PriorityDispatcher::new(1);
        let c = CancellationToken::new();

        // Hold the one slot.
        dispatcher.acquire(DownloadPriority::Normal, &c).await.unwrap();

        let dispatcher = std::sync::Arc::new(dispatcher);
        let order = std::sync::Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (label, priority) in [("low", DownloadPriority::Low), ("critical", DownloadPriority::Critical), ("normal", DownloadPriority::Normal)] {
            let dispatcher = dispatcher.clone();
            let order = order.clone();
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.acquire(priority, &c).await.unwrap();
                order.lock().unwrap().push(label);
            }));
        }

        // Give the three waiters time to enqueue before releasing the slot.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        dispatcher.release();

        for h in handles {
            tokio::time::timeout(std::time::Duration::from_secs(1), h)
                .await
                .unwrap()
                .unwrap();
            dispatcher.release();
        }

        assert_eq!(*order.lock().unwrap(), vec!["critical", "normal", "low"]);
    }

    #[tokio::test]
    async fn cancelling_while_queued_does_not_consume_a_slot() {
        let dispatcher = PriorityDispatcher::new(1);
        let holder_token = CancellationToken::new();
        dispatcher.acquire(DownloadPriority::Normal, &holder_token).await.unwrap();

        let waiter_token = CancellationToken::new();
        let dispatcher_clone = &dispatcher;
        let waiter = async {
            dispatcher_clone.acquire(DownloadPriority::Normal, &waiter_token).await
        };
        tokio::pin!(waiter);

        tokio::select! {
            _ = &mut waiter => panic!("should not have been dispatched yet"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
        }

        waiter_token.cancel();
        let result = waiter.await;
        assert!(matches!(result, Err(RuntimeError::Cancelled)));

        dispatcher.release();
        let second_token = CancellationToken::new();
        // A fresh acquire should get the slot immediately, proving the
        // cancelled waiter's slot was never actually consumed.
        tokio::time::timeout(std::time::Duration::from_millis(100), dispatcher.acquire(DownloadPriority::Normal, &second_token))
            .await
            .expect("slot should be available")
            .unwrap();
    }
}
