//! Relevance metrics computation.
//!
//! [`EvaluationMetrics`] takes a ranked list of document ids and the graded
//! ratings for the query and produces the metric set stored on every
//! evaluation record.

use tracing::trace;

use sr_types::{find_metric, ndcg_metric_name, MetricValue, MetricsCalculator, Ratings};

pub const METRIC_COVERAGE_AT: &str = "Coverage@";
pub const METRIC_PRECISION_AT: &str = "Precision@";
pub const METRIC_MAP_AT: &str = "MAP@";

/// Stateless calculator for Coverage, Precision, MAP and NDCG at a cutoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationMetrics;

impl EvaluationMetrics {
    pub fn new() -> Self {
        Self
    }

    /// Fraction of the top-k documents that carry any rating.
    pub fn coverage(ranked: &[String], ratings: &Ratings) -> f64 {
        if ranked.is_empty() {
            return 0.0;
        }
        let rated = ranked.iter().filter(|doc| ratings.contains_key(*doc)).count();
        rated as f64 / ranked.len() as f64
    }

    /// Fraction of the top-k documents rated above zero.
    pub fn precision(ranked: &[String], ratings: &Ratings) -> f64 {
        if ranked.is_empty() {
            return 0.0;
        }
        let relevant = ranked.iter().filter(|doc| is_relevant(doc, ratings)).count();
        relevant as f64 / ranked.len() as f64
    }

    /// Mean of the precision at each relevant position, over the relevant
    /// documents retrieved.
    pub fn average_precision(ranked: &[String], ratings: &Ratings) -> f64 {
        let mut relevant_seen = 0usize;
        let mut precision_sum = 0.0;
        for (i, doc) in ranked.iter().enumerate() {
            if is_relevant(doc, ratings) {
                relevant_seen += 1;
                precision_sum += relevant_seen as f64 / (i + 1) as f64;
            }
        }
        if relevant_seen == 0 {
            0.0
        } else {
            precision_sum / relevant_seen as f64
        }
    }

    /// Normalized discounted cumulative gain with exponential gain.
    ///
    /// The ideal ordering is built from every known rating, not only from the
    /// retrieved documents, so missing a highly rated document costs score.
    pub fn ndcg(ranked: &[String], ratings: &Ratings, cutoff: usize) -> f64 {
        let gains: Vec<f64> = ranked
            .iter()
            .map(|doc| ratings.get(doc).copied().unwrap_or(0.0))
            .collect();
        let dcg = discounted_gain(&gains);

        let mut ideal: Vec<f64> = ratings.values().copied().collect();
        ideal.sort_by(|a, b| b.total_cmp(a));
        ideal.truncate(cutoff);
        let idcg = discounted_gain(&ideal);

        if idcg <= 0.0 {
            0.0
        } else {
            dcg / idcg
        }
    }
}

impl MetricsCalculator for EvaluationMetrics {
    fn compute(&self, ranked_doc_ids: &[String], ratings: &Ratings, cutoff: usize) -> Vec<MetricValue> {
        let top = &ranked_doc_ids[..ranked_doc_ids.len().min(cutoff)];
        trace!(docs = top.len(), rated = ratings.len(), cutoff, "computing evaluation metrics");

        vec![
            MetricValue::new(
                format!("{METRIC_COVERAGE_AT}{cutoff}"),
                Self::coverage(top, ratings),
            ),
            MetricValue::new(
                format!("{METRIC_PRECISION_AT}{cutoff}"),
                Self::precision(top, ratings),
            ),
            MetricValue::new(
                format!("{METRIC_MAP_AT}{cutoff}"),
                Self::average_precision(top, ratings),
            ),
            MetricValue::new(ndcg_metric_name(cutoff), Self::ndcg(top, ratings, cutoff)),
        ]
    }
}

/// The metric used to rank variants against each other: NDCG at `cutoff`.
pub fn primary_metric(metrics: &[MetricValue], cutoff: usize) -> Option<f64> {
    find_metric(metrics, &ndcg_metric_name(cutoff))
}

fn is_relevant(doc: &str, ratings: &Ratings) -> bool {
    ratings.get(doc).is_some_and(|rating| *rating > 0.0)
}

fn discounted_gain(ratings: &[f64]) -> f64 {
    ratings
        .iter()
        .enumerate()
        .map(|(i, rel)| (2f64.powf(*rel) - 1.0) / ((i + 2) as f64).log2())
        .sum()
}
