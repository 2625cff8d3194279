//! Aggregate report types emitted once a query or an experiment has finished.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Weight descriptor used for variants whose parameters carry no weights.
pub const UNKNOWN_WEIGHTS: &str = "unknown";

/// Extracts the display weight descriptor from a variant's textual parameter
/// encoding (`"min_max, arithmetic_mean, 0.3;0.7"` becomes `"0.3/0.7"`).
pub fn weight_descriptor(textual_parameters: &str) -> String {
    match textual_parameters.rsplit_once(',') {
        Some((_, last)) if !matches!(last.trim(), "" | "none") => last.trim().replace(';', "/"),
        _ => UNKNOWN_WEIGHTS.to_string(),
    }
}

/// Best hybrid configuration found for one `(experiment, query text)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryBestConfiguration {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub experiment_id: String,
    pub query_text: String,
    pub metric: String,
    /// `None` when no variant produced a valid metric.
    pub best_metric: Option<f64>,
    pub best_search_configuration_id: Option<String>,
    pub best_parameters: Option<String>,
    pub best_weights: Option<String>,
    pub variants_processed: usize,
}

/// How many queries picked a given weight descriptor as their best.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightCount {
    pub weights: String,
    pub queries: usize,
}

/// Experiment-level roll-up of every query's best configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub experiment_id: String,
    /// Sorted by weight descriptor.
    pub weight_distribution: Vec<WeightCount>,
    pub total_queries: usize,
    pub most_common_weights: Option<WeightCount>,
    /// Share of queries that picked [`Self::most_common_weights`], 0-100.
    pub most_common_share_pct: Option<f64>,
    pub mean_best_metric: Option<f64>,
}

/// Report emitted by the result aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregateReport {
    Query(QueryBestConfiguration),
    Experiment(ExperimentSummary),
}

/// Per-experiment tally of winning weight descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightDistribution {
    counts: BTreeMap<String, usize>,
}

impl WeightDistribution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one query's winner. Unknown weights are not tallied.
    pub fn record(&mut self, weights: &str) {
        if weights == UNKNOWN_WEIGHTS {
            return;
        }
        *self.counts.entry(weights.to_string()).or_insert(0) += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total_queries(&self) -> usize {
        self.counts.values().sum()
    }

    /// Highest count; ties go to the lexicographically smallest descriptor.
    pub fn most_common(&self) -> Option<WeightCount> {
        let mut best: Option<(&String, usize)> = None;
        for (weights, &count) in &self.counts {
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((weights, count));
            }
        }
        best.map(|(weights, queries)| WeightCount {
            weights: weights.clone(),
            queries,
        })
    }

    /// Builds the summary. `best_metrics` holds each query's best value;
    /// negative sentinels are skipped when averaging.
    pub fn summarize(&self, experiment_id: &str, best_metrics: &[f64]) -> ExperimentSummary {
        let total_queries = self.total_queries();
        let most_common = self.most_common();
        let most_common_share_pct = most_common
            .as_ref()
            .filter(|_| total_queries > 0)
            .map(|wc| wc.queries as f64 * 100.0 / total_queries as f64);

        let valid: Vec<f64> = best_metrics.iter().copied().filter(|m| *m >= 0.0).collect();
        let mean_best_metric = if valid.is_empty() {
            None
        } else {
            Some(valid.iter().sum::<f64>() / valid.len() as f64)
        };

        ExperimentSummary {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            experiment_id: experiment_id.to_string(),
            weight_distribution: self
                .counts
                .iter()
                .map(|(weights, &queries)| WeightCount {
                    weights: weights.clone(),
                    queries,
                })
                .collect(),
            total_queries,
            most_common_weights: most_common,
            most_common_share_pct,
            mean_best_metric,
        }
    }
}
