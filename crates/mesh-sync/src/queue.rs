//! Priority-ordered operation queue with per-path deduplication.
//!
//! Ordering rules:
//!   - CRITICAL goes to the front.
//!   - HIGH goes immediately before the first NORMAL/LOW entry, so it is FIFO
//!     among HIGH but overtakes everything below it.
//!   - NORMAL and LOW append.
//!
//! At most one operation per path is queued. Enqueueing for a path that
//! already has an operation resolves the old one as [`SyncResult::Superseded`].

use std::collections::VecDeque;

use mesh_core::{unix_millis, OperationKind, StagedFile, SyncPriority};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Outcome delivered exactly once to whoever holds the [`SyncHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
    Completed,
    Failed { error: String },
    /// A newer operation for the same path replaced this one.
    Superseded,
    /// Shutdown, disconnect, or the file disappeared before execution.
    Cancelled,
}

/// Receiving half of an operation's completion.
#[derive(Debug)]
pub struct SyncHandle {
    pub id: Uuid,
    rx: oneshot::Receiver<SyncResult>,
}

impl SyncHandle {
    pub async fn wait(self) -> SyncResult {
        self.rx.await.unwrap_or(SyncResult::Cancelled)
    }
}

#[derive(Debug)]
pub struct SyncOperation {
    pub id: Uuid,
    /// Snapshot of the file when the operation was (re)queued
    pub file: StagedFile,
    pub kind: OperationKind,
    pub enqueued_at: u64,
    /// Failed attempts so far
    pub attempts: u32,
    completion: Option<oneshot::Sender<SyncResult>>,
}

impl SyncOperation {
    pub fn new(file: StagedFile, kind: OperationKind) -> (Self, SyncHandle) {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let attempts = file.retry_count;
        (
            Self {
                id,
                file,
                kind,
                enqueued_at: unix_millis(),
                attempts,
                completion: Some(tx),
            },
            SyncHandle { id, rx },
        )
    }

    pub fn path(&self) -> &str {
        &self.file.path
    }

    pub fn priority(&self) -> SyncPriority {
        self.file.priority
    }

    /// Resolve the completion handle. Later calls are no-ops.
    pub fn complete(&mut self, result: SyncResult) {
        if let Some(tx) = self.completion.take() {
            // Receiver may have been dropped; nobody is waiting then.
            let _ = tx.send(result);
        }
    }
}

impl Drop for SyncOperation {
    fn drop(&mut self) {
        self.complete(SyncResult::Cancelled);
    }
}

#[derive(Debug, Default)]
pub struct OperationQueue {
    ops: VecDeque<SyncOperation>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert by priority, superseding any queued operation for the same path.
    pub fn push(&mut self, op: SyncOperation) {
        if let Some(mut old) = self.remove(op.path()) {
            old.complete(SyncResult::Superseded);
        }

        match op.priority() {
            SyncPriority::Critical => self.ops.push_front(op),
            SyncPriority::High => {
                let at = self
                    .ops
                    .iter()
                    .position(|o| o.priority().is_normal_or_lower())
                    .unwrap_or(self.ops.len());
                self.ops.insert(at, op);
            }
            SyncPriority::Normal | SyncPriority::Low => self.ops.push_back(op),
        }
    }

    /// Take up to `max` operations from the front. With `critical_only`,
    /// only CRITICAL operations are taken and the rest stay queued.
    pub fn drain_batch(&mut self, max: usize, critical_only: bool) -> Vec<SyncOperation> {
        let mut batch = Vec::with_capacity(max.min(self.ops.len()));
        while batch.len() < max {
            let take = match self.ops.front() {
                Some(front) => !critical_only || front.priority() == SyncPriority::Critical,
                None => false,
            };
            if !take {
                break;
            }
            if let Some(op) = self.ops.pop_front() {
                batch.push(op);
            }
        }
        batch
    }

    pub fn remove(&mut self, path: &str) -> Option<SyncOperation> {
        let idx = self.ops.iter().position(|o| o.path() == path)?;
        self.ops.remove(idx)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.ops.iter().any(|o| o.path() == path)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Paths in execution order.
    pub fn paths(&self) -> Vec<String> {
        self.ops.iter().map(|o| o.path().to_string()).collect()
    }

    /// Empty the queue, resolving every operation with `result`.
    pub fn clear_with(&mut self, result: SyncResult) -> usize {
        let n = self.ops.len();
        for mut op in self.ops.drain(..) {
            op.complete(result.clone());
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::FileState;
    use proptest::prelude::*;

    fn file(path: &str, priority: SyncPriority) -> StagedFile {
        StagedFile {
            path: path.into(),
            local_path: format!("blobs/{path}"),
            size: 1,
            state: FileState::LocalOnly,
            priority,
            last_modified: 0,
            retry_count: 0,
            checksum: String::new(),
            metadata: Default::default(),
        }
    }

    fn push(q: &mut OperationQueue, path: &str, priority: SyncPriority) -> SyncHandle {
        let (op, handle) = SyncOperation::new(file(path, priority), OperationKind::Upload);
        q.push(op);
        handle
    }

    #[test]
    fn critical_normal_high_dequeues_by_tier() {
        let mut q = OperationQueue::new();
        push(&mut q, "c", SyncPriority::Critical);
        push(&mut q, "n", SyncPriority::Normal);
        push(&mut q, "h", SyncPriority::High);

        let order: Vec<_> = q
            .drain_batch(10, false)
            .iter()
            .map(|o| o.path().to_string())
            .collect();
        assert_eq!(order, vec!["c", "h", "n"]);
    }

    #[test]
    fn high_is_fifo_among_high_and_after_critical() {
        let mut q = OperationQueue::new();
        push(&mut q, "n1", SyncPriority::Normal);
        push(&mut q, "h1", SyncPriority::High);
        push(&mut q, "c1", SyncPriority::Critical);
        push(&mut q, "l1", SyncPriority::Low);
        push(&mut q, "h2", SyncPriority::High);

        assert_eq!(q.paths(), vec!["c1", "h1", "h2", "n1", "l1"]);
    }

    #[test]
    fn critical_goes_to_the_very_front() {
        let mut q = OperationQueue::new();
        push(&mut q, "c1", SyncPriority::Critical);
        push(&mut q, "c2", SyncPriority::Critical);
        assert_eq!(q.paths(), vec!["c2", "c1"]);
    }

    #[tokio::test]
    async fn second_enqueue_supersedes_first() {
        let mut q = OperationQueue::new();
        let first = push(&mut q, "a", SyncPriority::Normal);
        let _second = push(&mut q, "a", SyncPriority::High);

        assert_eq!(q.len(), 1);
        assert_eq!(first.wait().await, SyncResult::Superseded);
        assert_eq!(q.drain_batch(1, false)[0].priority(), SyncPriority::High);
    }

    #[test]
    fn critical_only_leaves_others_queued() {
        let mut q = OperationQueue::new();
        push(&mut q, "n", SyncPriority::Normal);
        push(&mut q, "c", SyncPriority::Critical);
        push(&mut q, "h", SyncPriority::High);

        let batch = q.drain_batch(10, true);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].path(), "c");
        assert_eq!(q.paths(), vec!["h", "n"]);
    }

    #[test]
    fn handle_stays_pending_until_completed() {
        use tokio_test::{assert_pending, assert_ready_eq, task};

        let mut q = OperationQueue::new();
        let handle = push(&mut q, "a", SyncPriority::Normal);
        let mut waiting = task::spawn(handle.wait());
        assert_pending!(waiting.poll());

        let mut op = q.drain_batch(1, false).pop().unwrap();
        assert_pending!(waiting.poll());
        op.complete(SyncResult::Completed);

        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), SyncResult::Completed);
    }

    #[tokio::test]
    async fn dropped_operation_resolves_cancelled() {
        let mut q = OperationQueue::new();
        let handle = push(&mut q, "a", SyncPriority::Low);
        drop(q);
        assert_eq!(handle.wait().await, SyncResult::Cancelled);
    }

    fn arb_priority() -> impl Strategy<Value = SyncPriority> {
        prop_oneof![
            Just(SyncPriority::Critical),
            Just(SyncPriority::High),
            Just(SyncPriority::Normal),
            Just(SyncPriority::Low),
        ]
    }

    proptest! {
        #[test]
        fn one_op_per_path_and_tiers_ordered(
            ops in proptest::collection::vec(("[a-e]", arb_priority()), 0..40)
        ) {
            let mut q = OperationQueue::new();
            for (path, prio) in &ops {
                let (op, _h) = SyncOperation::new(file(path, *prio), OperationKind::Upload);
                q.push(op);
            }

            let paths = q.paths();
            let mut unique = paths.clone();
            unique.sort();
            unique.dedup();
            prop_assert_eq!(unique.len(), paths.len());

            let tiers: Vec<u8> = q
                .drain_batch(usize::MAX, false)
                .iter()
                .map(|o| match o.priority() {
                    SyncPriority::Critical => 0,
                    SyncPriority::High => 1,
                    _ => 2,
                })
                .collect();
            prop_assert!(tiers.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
