use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, error};

use sr_types::{EvaluationRecord, ExperimentVariant, ResultStore};

/// Fire-and-forget persistence onto the async runtime.
///
/// Write failures are logged and never reach batch accounting.
#[derive(Clone)]
pub struct BackgroundWriter {
    store: Arc<dyn ResultStore>,
    runtime: Handle,
    pending: Arc<AtomicUsize>,
}

impl BackgroundWriter {
    pub fn new(store: Arc<dyn ResultStore>, runtime: Handle) -> Self {
        Self {
            store,
            runtime,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn write_variant(&self, variant: ExperimentVariant) {
        let store = Arc::clone(&self.store);
        let pending = PendingWrite::start(&self.pending);
        self.runtime.spawn(async move {
            let variant_id = variant.id;
            let status = variant.status;
            match store.put_variant(variant).await {
                Ok(()) => debug!(variant_id = %variant_id, ?status, "persisted experiment variant"),
                Err(e) => error!(variant_id = %variant_id, error = %e, "failed to persist experiment variant"),
            }
            drop(pending);
        });
    }

    pub fn write_evaluation(&self, record: EvaluationRecord) {
        let store = Arc::clone(&self.store);
        let pending = PendingWrite::start(&self.pending);
        self.runtime.spawn(async move {
            let evaluation_id = record.id;
            if let Err(e) = store.put_evaluation(record).await {
                error!(evaluation_id = %evaluation_id, error = %e, "failed to persist evaluation record");
            }
            drop(pending);
        });
    }

    /// Writes spawned but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

struct PendingWrite(Arc<AtomicUsize>);

impl PendingWrite {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
