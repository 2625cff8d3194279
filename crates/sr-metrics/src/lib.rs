//! Relevance metrics and aggregate reporting for search relevance experiments.
//!
//! Provides:
//! - Coverage, Precision, MAP and NDCG at a cutoff over a ranked list
//! - Primary metric selection for comparing variants
//! - Per-query best configuration and per-experiment weight distribution reports

pub mod metrics;
pub mod reports;

pub use metrics::{primary_metric, EvaluationMetrics};
pub use reports::{
    weight_descriptor, AggregateReport, ExperimentSummary, QueryBestConfiguration, WeightCount,
    WeightDistribution, UNKNOWN_WEIGHTS,
};
