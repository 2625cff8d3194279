use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use sr_types::{EvaluationRecord, ExperimentVariant, ResultStore, StoreError, VariantId};

/// In-memory result store for evaluation records and experiment variants
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    evaluations: DashMap<Uuid, EvaluationRecord>,
    variants: DashMap<VariantId, ExperimentVariant>,
    stats: RwLock<StoreStats>,
    fail_writes: AtomicBool,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            self.stats.write().failures += 1;
            return Err(StoreError::Unavailable {
                message: "result store is rejecting writes".to_string(),
            });
        }
        Ok(())
    }

    pub fn evaluation(&self, id: &Uuid) -> Result<EvaluationRecord, StoreError> {
        self.evaluations
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    pub fn variant(&self, id: &VariantId) -> Result<ExperimentVariant, StoreError> {
        self.variants
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    /// All evaluation records for one experiment, oldest first.
    pub fn evaluations_for_experiment(&self, experiment_id: &str) -> Vec<EvaluationRecord> {
        let mut records: Vec<EvaluationRecord> = self
            .evaluations
            .iter()
            .filter(|entry| entry.value().experiment_id.as_deref() == Some(experiment_id))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.timestamp);
        records
    }

    pub fn variants_for_experiment(&self, experiment_id: &str) -> Vec<ExperimentVariant> {
        self.variants
            .iter()
            .filter(|entry| entry.value().experiment_id == experiment_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn evaluation_count(&self) -> usize {
        self.evaluations.len()
    }

    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    pub fn clear(&self) {
        self.evaluations.clear();
        self.variants.clear();

        {
            let mut stats = self.stats.write();
            *stats = StoreStats::default();
        }
    }

    pub fn get_stats(&self) -> StoreStats {
        self.stats.read().clone()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put_evaluation(&self, record: EvaluationRecord) -> Result<(), StoreError> {
        self.check_writable()?;

        let id = record.id;
        let replaced = self.evaluations.insert(id, record).is_some();

        {
            let mut stats = self.stats.write();
            stats.evaluation_puts += 1;
            if replaced {
                stats.overwrites += 1;
            }
        }

        debug!(evaluation_id = %id, "stored evaluation record");
        Ok(())
    }

    async fn put_variant(&self, variant: ExperimentVariant) -> Result<(), StoreError> {
        self.check_writable()?;

        let id = variant.id;
        // A terminal variant is never moved back to a non-terminal state.
        if let Some(existing) = self.variants.get(&id) {
            if existing.is_terminal() && !variant.is_terminal() {
                warn!(variant_id = %id, "ignoring non-terminal write over terminal variant");
                return Err(StoreError::WriteRejected {
                    message: format!("variant {id} is already {:?}", existing.status),
                });
            }
        }

        let replaced = self.variants.insert(id, variant).is_some();

        {
            let mut stats = self.stats.write();
            stats.variant_puts += 1;
            if replaced {
                stats.overwrites += 1;
            }
        }

        debug!(variant_id = %id, "stored experiment variant");
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub evaluation_puts: u64,
    pub variant_puts: u64,
    pub overwrites: u64,
    pub failures: u64,
}

impl StoreStats {
    pub fn total_puts(&self) -> u64 {
        self.evaluation_puts + self.variant_puts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sr_types::{ExperimentType, VariantStatus};
    use std::collections::BTreeMap;

    fn record(experiment_id: &str) -> EvaluationRecord {
        EvaluationRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            search_configuration_id: "cfg".into(),
            search_text: "shoes".into(),
            judgment_ids: vec!["j1".into()],
            document_ids: vec!["d1".into()],
            metrics: Vec::new(),
            experiment_id: Some(experiment_id.into()),
            experiment_variant_id: None,
            experiment_variant_parameters: None,
        }
    }

    fn variant() -> ExperimentVariant {
        ExperimentVariant::new("exp", ExperimentType::HybridOptimizer, BTreeMap::new())
    }

    #[tokio::test]
    async fn stores_and_reads_back_evaluations() {
        let store = InMemoryResultStore::new();
        let rec = record("exp-1");
        let id = rec.id;

        store.put_evaluation(rec).await.unwrap();
        store.put_evaluation(record("exp-2")).await.unwrap();

        assert_eq!(store.evaluation(&id).unwrap().search_text, "shoes");
        assert_eq!(store.evaluations_for_experiment("exp-1").len(), 1);
        assert_eq!(store.get_stats().evaluation_puts, 2);
    }

    #[tokio::test]
    async fn terminal_variant_is_not_reopened() {
        let store = InMemoryResultStore::new();
        let processing = variant();
        let completed = processing
            .finish(VariantStatus::Completed, BTreeMap::new())
            .unwrap();

        store.put_variant(completed).await.unwrap();
        let err = store.put_variant(processing.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::WriteRejected { .. }));
        assert_eq!(
            store.variant(&processing.id).unwrap().status,
            VariantStatus::Completed
        );
    }

    #[tokio::test]
    async fn injected_failure_rejects_writes() {
        let store = InMemoryResultStore::new();
        store.set_fail_writes(true);

        let err = store.put_variant(variant()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
        assert_eq!(store.get_stats().failures, 1);
        assert_eq!(store.variant_count(), 0);

        store.set_fail_writes(false);
        store.put_variant(variant()).await.unwrap();
        assert_eq!(store.variant_count(), 1);
    }

    #[test]
    fn missing_records_are_not_found() {
        let store = InMemoryResultStore::new();
        assert!(matches!(
            store.evaluation(&Uuid::new_v4()),
            Err(StoreError::NotFound { .. })
        ));
    }
}
