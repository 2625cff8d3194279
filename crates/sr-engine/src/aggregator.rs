//! Result aggregation.
//!
//! Turns a variant's search outcome into batch accounting: scores successful
//! responses, persists evaluation records and variant state in the
//! background, and tracks the best hybrid configuration per query. Once every
//! batch of a query has finalized the query's winner is reported, and once
//! every query of an experiment has reported the experiment's weight
//! distribution is reported. Each report fires at most once.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use crossbeam_channel::Sender;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sr_metrics::{
    primary_metric, weight_descriptor, AggregateReport, QueryBestConfiguration, WeightDistribution,
    UNKNOWN_WEIGHTS,
};
use sr_types::{
    ndcg_metric_name, EvaluationRecord, ExperimentType, ExperimentVariant, MetricsCalculator,
    Ratings, SearchError, SearchResponse, VariantStatus,
};

use crate::batch::{Completion, TaskBatch};
use crate::classifier::is_batch_fatal;
use crate::writer::BackgroundWriter;

/// Detail stored on a variant whose search returned nothing.
pub const NO_HITS_DETAIL: &str = "no search hits found";

/// Best metric before any variant has been scored.
const NO_METRIC: f64 = -1.0;

/// Identity of one query within an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub experiment_id: String,
    pub query_text: String,
}

impl QueryKey {
    pub fn new(experiment_id: impl Into<String>, query_text: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            query_text: query_text.into(),
        }
    }
}

/// Everything shared by the variants of one batch that scoring needs.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub experiment_id: String,
    pub search_configuration_id: String,
    pub query_text: String,
    pub judgment_ids: Vec<String>,
    pub ratings: Ratings,
    pub size: usize,
}

impl EvaluationContext {
    pub fn query_key(&self) -> QueryKey {
        QueryKey::new(&self.experiment_id, &self.query_text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BestConfiguration {
    /// Negative until a variant has been scored.
    pub best_metric: f64,
    pub search_configuration_id: Option<String>,
    pub parameters: Option<String>,
    pub weights: Option<String>,
    pub processed: usize,
}

impl BestConfiguration {
    pub fn has_metric(&self) -> bool {
        self.best_metric >= 0.0
    }
}

/// Best configuration seen so far for one query. Only a strictly greater
/// metric replaces the current best, so ties keep the first writer.
#[derive(Debug)]
pub struct BestConfigurationTracker {
    state: Mutex<BestConfiguration>,
}

impl Default for BestConfigurationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BestConfigurationTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BestConfiguration {
                best_metric: NO_METRIC,
                search_configuration_id: None,
                parameters: None,
                weights: None,
                processed: 0,
            }),
        }
    }

    /// Counts the variant and returns whether it became the new best.
    pub fn offer(&self, metric: f64, search_configuration_id: &str, parameters: &str) -> bool {
        let mut state = self.state.lock();
        state.processed += 1;
        if metric > state.best_metric {
            state.best_metric = metric;
            state.search_configuration_id = Some(search_configuration_id.to_string());
            state.parameters = Some(parameters.to_string());
            state.weights = Some(weight_descriptor(parameters));
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> BestConfiguration {
        self.state.lock().clone()
    }
}

pub struct ResultAggregator {
    metrics: Arc<dyn MetricsCalculator>,
    writer: BackgroundWriter,
    primary_metric_cutoff: Option<usize>,
    trackers: DashMap<QueryKey, Arc<BestConfigurationTracker>>,
    open_batches: DashMap<QueryKey, usize>,
    logged_queries: DashSet<QueryKey>,
    reported_queries: DashSet<QueryKey>,
    expected_queries: DashMap<String, HashSet<String>>,
    weight_stats: DashMap<String, WeightDistribution>,
    /// Serializes the completeness check with the cleanup that follows it.
    experiment_reports: Mutex<()>,
    reports: Option<Sender<AggregateReport>>,
}

impl ResultAggregator {
    pub fn new(
        metrics: Arc<dyn MetricsCalculator>,
        writer: BackgroundWriter,
        primary_metric_cutoff: Option<usize>,
        reports: Option<Sender<AggregateReport>>,
    ) -> Self {
        Self {
            metrics,
            writer,
            primary_metric_cutoff,
            trackers: DashMap::new(),
            open_batches: DashMap::new(),
            logged_queries: DashSet::new(),
            reported_queries: DashSet::new(),
            expected_queries: DashMap::new(),
            weight_stats: DashMap::new(),
            experiment_reports: Mutex::new(()),
            reports,
        }
    }

    /// Scores a response and records the variant's outcome in `batch`.
    pub fn on_search_response(
        &self,
        response: SearchResponse,
        variant: &ExperimentVariant,
        batch: &TaskBatch,
        context: &EvaluationContext,
    ) -> Completion {
        if response.is_empty() {
            warn!(
                experiment_id = %context.experiment_id,
                search_config_id = %context.search_configuration_id,
                variant_id = %variant.id,
                query_text = %context.query_text,
                "no hits for variant"
            );
            self.write_terminal(batch, variant, VariantStatus::Error, "details", NO_HITS_DETAIL);
            return batch.record_failure(variant.id);
        }

        let document_ids = response.doc_ids();
        let cutoff = self.primary_metric_cutoff.unwrap_or(context.size);
        let metrics = self.metrics.compute(&document_ids, &context.ratings, cutoff);
        let is_hybrid = variant.experiment_type == ExperimentType::HybridOptimizer;
        let parameters = variant.textual_parameters();

        let record = EvaluationRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            search_configuration_id: context.search_configuration_id.clone(),
            search_text: context.query_text.clone(),
            judgment_ids: context.judgment_ids.clone(),
            document_ids,
            metrics,
            experiment_id: Some(context.experiment_id.clone()),
            experiment_variant_id: Some(variant.id),
            experiment_variant_parameters: is_hybrid.then(|| parameters.clone()),
        };
        let evaluation_id = record.id;

        if is_hybrid {
            match primary_metric(&record.metrics, cutoff) {
                Some(value) if value >= 0.0 => {
                    let improved = self.tracker(context.query_key()).offer(
                        value,
                        &context.search_configuration_id,
                        &parameters,
                    );
                    if improved {
                        debug!(
                            experiment_id = %context.experiment_id,
                            query_text = %context.query_text,
                            variant_id = %variant.id,
                            metric = value,
                            "new best configuration for query"
                        );
                    }
                }
                _ => debug!(variant_id = %variant.id, cutoff, "no primary metric for variant"),
            }
        }

        self.writer.write_evaluation(record);
        self.write_terminal(
            batch,
            variant,
            VariantStatus::Completed,
            "evaluationResultId",
            &evaluation_id.to_string(),
        );
        batch.record_success(variant.id, evaluation_id)
    }

    /// Records a failed search. A batch-fatal error aborts the batch before
    /// the variant is counted.
    pub fn on_search_failure(
        &self,
        error: SearchError,
        variant: &ExperimentVariant,
        batch: &TaskBatch,
    ) -> Completion {
        let message = error.to_string();
        if is_batch_fatal(&error) {
            batch.abort(error);
        } else {
            warn!(
                batch_id = %batch.id(),
                variant_id = %variant.id,
                error = %message,
                "variant search failed"
            );
        }
        self.write_terminal(batch, variant, VariantStatus::Error, "error", &message);
        batch.record_failure(variant.id)
    }

    fn write_terminal(
        &self,
        batch: &TaskBatch,
        variant: &ExperimentVariant,
        status: VariantStatus,
        result_key: &str,
        result_value: &str,
    ) {
        let results = BTreeMap::from([(result_key.to_string(), result_value.to_string())]);
        match variant.finish(status, results) {
            Some(finished) => batch.schedule_result_write(finished),
            None => warn!(variant_id = %variant.id, ?status, "variant already terminal, not rewriting"),
        }
    }

    fn tracker(&self, key: QueryKey) -> Arc<BestConfigurationTracker> {
        Arc::clone(self.trackers.entry(key).or_default().value())
    }

    /// Snapshot of the best configuration tracked for `key`, if any variant
    /// of that query has been scored.
    pub fn best_configuration(&self, key: &QueryKey) -> Option<BestConfiguration> {
        self.trackers.get(key).map(|tracker| tracker.snapshot())
    }

    /// Declares every query text of an experiment so its summary waits for
    /// all of them.
    pub fn register_expected_queries(
        &self,
        experiment_id: &str,
        queries: impl IntoIterator<Item = String>,
    ) {
        self.expected_queries
            .entry(experiment_id.to_string())
            .or_default()
            .extend(queries);
    }

    /// Counts a batch of `key` that has not finalized yet.
    pub fn open_batch(&self, key: QueryKey) {
        *self.open_batches.entry(key).or_insert(0) += 1;
    }

    /// Keeps `key` open until the returned guard drops, so a query whose
    /// batches are still being submitted cannot report early.
    pub fn hold_query(self: &Arc<Self>, key: QueryKey) -> QueryHold {
        self.open_batch(key.clone());
        QueryHold {
            aggregator: Arc::clone(self),
            key,
        }
    }

    /// Closes one batch of `key`; the last one to close reports the query.
    pub fn close_batch(&self, key: &QueryKey) {
        let closed = match self.open_batches.entry(key.clone()) {
            Entry::Occupied(mut open) => {
                *open.get_mut() -= 1;
                if *open.get() == 0 {
                    open.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => {
                warn!(experiment_id = %key.experiment_id, query_text = %key.query_text, "closing a query with no open batches");
                false
            }
        };

        if closed {
            self.report_query(key);
        }
    }

    fn report_query(&self, key: &QueryKey) {
        if !self.logged_queries.insert(key.clone()) {
            return;
        }

        let tracker = self.trackers.get(key).map(|t| Arc::clone(t.value()));
        if let Some(tracker) = tracker {
            let best = tracker.snapshot();
            let cutoff_metric = self
                .primary_metric_cutoff
                .map(ndcg_metric_name)
                .unwrap_or_else(|| "NDCG".to_string());

            if best.has_metric() {
                info!(
                    experiment_id = %key.experiment_id,
                    query_text = %key.query_text,
                    metric = %cutoff_metric,
                    best_metric = best.best_metric,
                    search_config_id = best.search_configuration_id.as_deref().unwrap_or(""),
                    weights = best.weights.as_deref().unwrap_or(UNKNOWN_WEIGHTS),
                    variants = best.processed,
                    "best configuration for query"
                );
            } else {
                info!(
                    experiment_id = %key.experiment_id,
                    query_text = %key.query_text,
                    variants = best.processed,
                    "no valid metric for query"
                );
            }

            self.weight_stats
                .entry(key.experiment_id.clone())
                .or_default()
                .record(best.weights.as_deref().unwrap_or(UNKNOWN_WEIGHTS));

            self.emit(AggregateReport::Query(QueryBestConfiguration {
                id: Uuid::new_v4(),
                timestamp: Utc::now(),
                experiment_id: key.experiment_id.clone(),
                query_text: key.query_text.clone(),
                metric: cutoff_metric,
                best_metric: best.has_metric().then_some(best.best_metric),
                best_search_configuration_id: best.search_configuration_id,
                best_parameters: best.parameters,
                best_weights: best.weights,
                variants_processed: best.processed,
            }));
        }

        // Marked only after the weights are folded in, so an experiment
        // check that sees this query also sees its weights.
        self.reported_queries.insert(key.clone());
        self.report_experiment_if_complete(&key.experiment_id);
    }

    fn report_experiment_if_complete(&self, experiment_id: &str) {
        let _guard = self.experiment_reports.lock();

        let complete = match self.expected_queries.get(experiment_id) {
            Some(expected) => expected
                .iter()
                .all(|query| self.reported_queries.contains(&QueryKey::new(experiment_id, query.as_str()))),
            None => {
                let mut tracked = self
                    .trackers
                    .iter()
                    .filter(|entry| entry.key().experiment_id == experiment_id)
                    .peekable();
                // No scored query yet: later queries may still produce one.
                let any_tracked = tracked.peek().is_some();
                let all_reported = tracked.all(|entry| self.reported_queries.contains(entry.key()));
                any_tracked && all_reported
            }
        };
        if !complete {
            return;
        }

        let best_metrics: Vec<f64> = self
            .trackers
            .iter()
            .filter(|entry| entry.key().experiment_id == experiment_id)
            .map(|entry| entry.value().snapshot().best_metric)
            .collect();
        let distribution = self
            .weight_stats
            .remove(experiment_id)
            .map(|(_, distribution)| distribution)
            .unwrap_or_default();

        self.trackers.retain(|key, _| key.experiment_id != experiment_id);
        self.expected_queries.remove(experiment_id);
        self.logged_queries.retain(|key| key.experiment_id != experiment_id);
        self.reported_queries.retain(|key| key.experiment_id != experiment_id);

        if distribution.is_empty() {
            debug!(experiment_id = %experiment_id, "no weight statistics for experiment");
            return;
        }

        let summary = distribution.summarize(experiment_id, &best_metrics);
        info!(
            experiment_id = %experiment_id,
            total_queries = summary.total_queries,
            most_common_weights = summary
                .most_common_weights
                .as_ref()
                .map_or(UNKNOWN_WEIGHTS, |wc| wc.weights.as_str()),
            most_common_share_pct = summary.most_common_share_pct.unwrap_or(0.0),
            mean_best_metric = summary.mean_best_metric.unwrap_or(NO_METRIC),
            "experiment weight distribution"
        );
        self.emit(AggregateReport::Experiment(summary));
    }

    fn emit(&self, report: AggregateReport) {
        if let Some(sender) = &self.reports {
            if sender.try_send(report).is_err() {
                debug!("aggregate report receiver unavailable, dropping report");
            }
        }
    }

    /// Queries with batches that have not finalized yet.
    pub fn open_queries(&self) -> usize {
        self.open_batches.len()
    }
}

impl std::fmt::Debug for ResultAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultAggregator")
            .field("primary_metric_cutoff", &self.primary_metric_cutoff)
            .field("tracked_queries", &self.trackers.len())
            .field("open_queries", &self.open_batches.len())
            .field("reported_queries", &self.reported_queries.len())
            .finish()
    }
}

/// Keeps a query open while its batches are being submitted.
#[derive(Debug)]
pub struct QueryHold {
    aggregator: Arc<ResultAggregator>,
    key: QueryKey,
}

impl Drop for QueryHold {
    fn drop(&mut self) {
        self.aggregator.close_batch(&self.key);
    }
}
