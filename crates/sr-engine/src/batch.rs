//! Task batch coordination.
//!
//! A [`TaskBatch`] covers every variant evaluated for one
//! `(experiment, search configuration, query text)` tuple. Completions are
//! counted with atomics only; whichever completion takes `remaining` to zero
//! gets [`Completion::Last`] and is responsible for calling
//! [`TaskBatch::finalize`]. The caller-facing promise is a oneshot channel
//! that is resolved exactly once, either by finalization or by
//! [`TaskBatch::abort`].
//!
//! Lifecycle: `Pending -> Active -> Completed | Aborted`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sr_types::{BatchError, ExperimentVariant, SearchError, VariantId};

use crate::writer::BackgroundWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Success,
    PartialSuccess,
    AllFailed,
}

impl BatchStatus {
    fn from_counts(total: usize, failed: usize) -> Self {
        if total > 0 && failed == total {
            Self::AllFailed
        } else if failed > 0 {
            Self::PartialSuccess
        } else {
            Self::Success
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Link from a variant to the evaluation record it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantResultRef {
    pub variant_id: VariantId,
    pub evaluation_id: Uuid,
}

/// What a batch resolves to when it finishes normally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub search_configuration_id: String,
    pub status: BatchStatus,
    pub summary: BatchSummary,
    /// In completion order, not submission order.
    pub results: Vec<VariantResultRef>,
}

/// Identity of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub experiment_id: String,
    pub search_config_id: String,
    pub query_text: String,
}

/// Returned by the record calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Other variants are still outstanding.
    Pending,
    /// This call took the last outstanding variant; finalize the batch.
    Last,
    /// Unknown or already-recorded variant; counters untouched.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchPhase {
    Pending = 0,
    Active = 1,
    Completed = 2,
    Aborted = 3,
}

impl BatchPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Active,
            2 => Self::Completed,
            _ => Self::Aborted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VariantState {
    Outstanding,
    Succeeded,
    Failed,
}

type BatchResult = Result<BatchOutcome, BatchError>;

pub struct TaskBatch {
    id: Uuid,
    key: BatchKey,
    total: usize,
    remaining: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    phase: AtomicU8,
    failure_latch: AtomicBool,
    variants: DashMap<VariantId, VariantState>,
    results: DashMap<VariantId, Uuid>,
    resolver: Mutex<Option<oneshot::Sender<BatchResult>>>,
    resolutions: AtomicUsize,
    writer: BackgroundWriter,
}

impl TaskBatch {
    /// Creates a pending batch for `variant_ids` and the handle its caller
    /// awaits. Duplicate ids count once.
    pub fn new(
        key: BatchKey,
        variant_ids: impl IntoIterator<Item = VariantId>,
        writer: BackgroundWriter,
    ) -> (Self, BatchHandle) {
        let variants: DashMap<VariantId, VariantState> = variant_ids
            .into_iter()
            .map(|id| (id, VariantState::Outstanding))
            .collect();
        let total = variants.len();
        let id = Uuid::new_v4();
        let (sender, receiver) = oneshot::channel();

        let batch = Self {
            id,
            key,
            total,
            remaining: AtomicUsize::new(total),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            phase: AtomicU8::new(BatchPhase::Pending as u8),
            failure_latch: AtomicBool::new(false),
            variants,
            results: DashMap::new(),
            resolver: Mutex::new(Some(sender)),
            resolutions: AtomicUsize::new(0),
            writer,
        };
        (batch, BatchHandle { batch_id: id, receiver })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> BatchPhase {
        BatchPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Whether a batch-fatal error has been latched.
    pub fn is_aborted(&self) -> bool {
        self.failure_latch.load(Ordering::Acquire)
    }

    /// How many times the promise was resolved. Never more than one.
    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::Acquire)
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            total: self.total,
            succeeded: self.succeeded.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }

    /// Moves the batch from `Pending` to `Active`. Returns false if it was
    /// not pending.
    pub fn activate(&self) -> bool {
        self.transition(BatchPhase::Pending, BatchPhase::Active)
    }

    pub fn record_success(&self, variant_id: VariantId, evaluation_id: Uuid) -> Completion {
        if !self.mark(variant_id, VariantState::Succeeded) {
            return Completion::Ignored;
        }
        self.results.insert(variant_id, evaluation_id);
        self.succeeded.fetch_add(1, Ordering::AcqRel);
        self.count_down()
    }

    pub fn record_failure(&self, variant_id: VariantId) -> Completion {
        if !self.mark(variant_id, VariantState::Failed) {
            return Completion::Ignored;
        }
        self.failed.fetch_add(1, Ordering::AcqRel);
        self.count_down()
    }

    fn mark(&self, variant_id: VariantId, state: VariantState) -> bool {
        match self.variants.get_mut(&variant_id) {
            Some(mut entry) if *entry == VariantState::Outstanding => {
                *entry = state;
                true
            }
            Some(_) => {
                warn!(batch_id = %self.id, variant_id = %variant_id, "variant already recorded, ignoring");
                false
            }
            None => {
                warn!(batch_id = %self.id, variant_id = %variant_id, "variant does not belong to batch, ignoring");
                false
            }
        }
    }

    fn count_down(&self) -> Completion {
        // Counts are bumped before the decrement, so the caller seeing 1 -> 0
        // also sees succeeded + failed == total.
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            Completion::Last
        } else {
            Completion::Pending
        }
    }

    /// Resolves the promise with the aggregate outcome. No-op unless the
    /// batch is active with nothing outstanding, so it runs at most once and
    /// never after an abort.
    pub fn finalize(&self) -> bool {
        if self.remaining() != 0 {
            return false;
        }
        if !self.transition(BatchPhase::Active, BatchPhase::Completed) {
            debug!(batch_id = %self.id, phase = ?self.phase(), "batch already terminal, skipping finalization");
            return false;
        }

        let summary = self.summary();
        let status = BatchStatus::from_counts(summary.total, summary.failed);
        let results: Vec<VariantResultRef> = self
            .results
            .iter()
            .map(|entry| VariantResultRef {
                variant_id: *entry.key(),
                evaluation_id: *entry.value(),
            })
            .collect();

        match status {
            BatchStatus::Success => info!(
                experiment_id = %self.key.experiment_id,
                search_config_id = %self.key.search_config_id,
                total = summary.total,
                "batch completed"
            ),
            BatchStatus::PartialSuccess => warn!(
                experiment_id = %self.key.experiment_id,
                search_config_id = %self.key.search_config_id,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "batch completed with failures"
            ),
            BatchStatus::AllFailed => error!(
                experiment_id = %self.key.experiment_id,
                search_config_id = %self.key.search_config_id,
                total = summary.total,
                "all variants in batch failed"
            ),
        }

        self.resolve(Ok(BatchOutcome {
            search_configuration_id: self.key.search_config_id.clone(),
            status,
            summary,
            results,
        }))
    }

    /// Latches a batch-fatal error and rejects the promise with it. Only the
    /// first call wins; later calls return false and drop their error.
    pub fn abort(&self, cause: SearchError) -> bool {
        if self
            .failure_latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let aborted = self.transition(BatchPhase::Active, BatchPhase::Aborted)
            || self.transition(BatchPhase::Pending, BatchPhase::Aborted);
        if !aborted {
            return false;
        }

        error!(
            batch_id = %self.id,
            experiment_id = %self.key.experiment_id,
            search_config_id = %self.key.search_config_id,
            error = %cause,
            "batch-fatal failure, aborting batch"
        );
        self.resolve(Err(BatchError::Aborted {
            experiment_id: self.key.experiment_id.clone(),
            search_config_id: self.key.search_config_id.clone(),
            query_text: self.key.query_text.clone(),
            source: cause,
        }))
    }

    /// Persists an updated variant in the background.
    pub fn schedule_result_write(&self, variant: ExperimentVariant) {
        self.writer.write_variant(variant);
    }

    fn transition(&self, from: BatchPhase, to: BatchPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn resolve(&self, result: BatchResult) -> bool {
        let Some(sender) = self.resolver.lock().take() else {
            return false;
        };
        self.resolutions.fetch_add(1, Ordering::AcqRel);
        if sender.send(result).is_err() {
            debug!(batch_id = %self.id, "batch handle dropped before resolution");
        }
        true
    }
}

impl std::fmt::Debug for TaskBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskBatch")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("phase", &self.phase())
            .field("summary", &self.summary())
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Caller side of a submitted batch. Resolves once the batch finalizes or is
/// aborted.
#[derive(Debug)]
pub struct BatchHandle {
    batch_id: Uuid,
    receiver: oneshot::Receiver<BatchResult>,
}

impl BatchHandle {
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }
}

impl Future for BatchHandle {
    type Output = BatchResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let batch_id = self.batch_id;
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(BatchError::Dropped {
                    batch_id: batch_id.to_string(),
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sr_data::InMemoryResultStore;
    use std::sync::Arc;
    use tokio::runtime::Handle;

    fn key() -> BatchKey {
        BatchKey {
            experiment_id: "exp".into(),
            search_config_id: "cfg".into(),
            query_text: "red shoes".into(),
        }
    }

    fn batch(n: usize) -> (TaskBatch, BatchHandle, Vec<VariantId>) {
        let ids: Vec<VariantId> = (0..n).map(|_| Uuid::new_v4()).collect();
        let writer = BackgroundWriter::new(Arc::new(InMemoryResultStore::new()), Handle::current());
        let (batch, handle) = TaskBatch::new(key(), ids.clone(), writer);
        assert!(batch.activate());
        (batch, handle, ids)
    }

    #[tokio::test]
    async fn all_successes_resolve_success() {
        let (batch, handle, ids) = batch(3);
        assert_eq!(batch.record_success(ids[0], Uuid::new_v4()), Completion::Pending);
        assert_eq!(batch.record_success(ids[1], Uuid::new_v4()), Completion::Pending);
        assert_eq!(batch.record_success(ids[2], Uuid::new_v4()), Completion::Last);
        assert!(batch.finalize());

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, BatchStatus::Success);
        assert_eq!(outcome.summary, BatchSummary { total: 3, succeeded: 3, failed: 0 });
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(batch.phase(), BatchPhase::Completed);
    }

    #[tokio::test]
    async fn mixed_outcomes_resolve_partial_success() {
        let (batch, handle, ids) = batch(2);
        batch.record_failure(ids[0]);
        assert_eq!(batch.record_success(ids[1], Uuid::new_v4()), Completion::Last);
        batch.finalize();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, BatchStatus::PartialSuccess);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].variant_id, ids[1]);
    }

    #[tokio::test]
    async fn all_failures_resolve_normally() {
        let (batch, handle, ids) = batch(2);
        batch.record_failure(ids[0]);
        batch.record_failure(ids[1]);
        batch.finalize();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, BatchStatus::AllFailed);
        assert_eq!(outcome.summary.failed, 2);
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_success() {
        let (batch, handle, _) = batch(0);
        assert!(batch.finalize());
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, BatchStatus::Success);
        assert_eq!(outcome.summary.total, 0);
    }

    #[tokio::test]
    async fn duplicate_and_foreign_records_are_ignored() {
        let (batch, _handle, ids) = batch(2);
        assert_eq!(batch.record_success(ids[0], Uuid::new_v4()), Completion::Pending);
        assert_eq!(batch.record_failure(ids[0]), Completion::Ignored);
        assert_eq!(batch.record_success(Uuid::new_v4(), Uuid::new_v4()), Completion::Ignored);
        assert_eq!(batch.remaining(), 1);
        assert_eq!(batch.summary().succeeded, 1);
    }

    #[tokio::test]
    async fn abort_rejects_promise_and_blocks_finalization() {
        let (batch, handle, ids) = batch(2);
        let cause = SearchError::CircuitBreaking {
            message: "[parent] Data too large".into(),
        };
        assert!(batch.abort(cause));
        assert!(!batch.abort(SearchError::OutOfMemory { message: "second".into() }));
        assert!(batch.is_aborted());

        batch.record_failure(ids[0]);
        assert_eq!(batch.record_failure(ids[1]), Completion::Last);
        assert!(!batch.finalize());
        assert_eq!(batch.resolutions(), 1);

        match handle.await {
            Err(BatchError::Aborted { source, query_text, .. }) => {
                assert!(source.is_resource_exhaustion());
                assert_eq!(query_text, "red shoes");
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pending_batch_cannot_finalize() {
        let ids = vec![Uuid::new_v4()];
        let writer = BackgroundWriter::new(Arc::new(InMemoryResultStore::new()), Handle::current());
        let (batch, _handle) = TaskBatch::new(key(), ids, writer);
        assert_eq!(batch.phase(), BatchPhase::Pending);
        assert!(!batch.finalize());
    }

    #[tokio::test]
    async fn dropped_batch_reports_dropped() {
        let (batch, handle, _) = batch(1);
        drop(batch);
        assert!(matches!(handle.await, Err(BatchError::Dropped { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_resolve_exactly_once() {
        for _ in 0..20 {
            let (batch, handle, ids) = batch(64);
            let batch = Arc::new(batch);
            let last_seen = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = ids
                .chunks(8)
                .map(|chunk| {
                    let batch = Arc::clone(&batch);
                    let last_seen = Arc::clone(&last_seen);
                    let chunk = chunk.to_vec();
                    std::thread::spawn(move || {
                        for (i, id) in chunk.into_iter().enumerate() {
                            let completion = if i % 3 == 0 {
                                batch.record_failure(id)
                            } else {
                                batch.record_success(id, Uuid::new_v4())
                            };
                            if completion == Completion::Last {
                                last_seen.fetch_add(1, Ordering::SeqCst);
                                batch.finalize();
                            }
                            batch.finalize();
                        }
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }

            assert_eq!(last_seen.load(Ordering::SeqCst), 1);
            assert_eq!(batch.resolutions(), 1);
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.summary.succeeded + outcome.summary.failed, 64);
            assert_eq!(outcome.results.len(), outcome.summary.succeeded);
        }
    }
}
