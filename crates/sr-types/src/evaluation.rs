//! Evaluation records, relevance ratings and search request/response shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::experiment::VariantId;

/// Graded relevance rating per document id.
pub type Ratings = HashMap<String, f64>;

/// Metric name prefix for normalized discounted cumulative gain.
pub const METRIC_NDCG_AT: &str = "NDCG@";

/// Name of the NDCG metric computed at `cutoff`.
pub fn ndcg_metric_name(cutoff: usize) -> String {
    format!("{METRIC_NDCG_AT}{cutoff}")
}

/// A single named metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub metric: String,
    pub value: f64,
}

impl MetricValue {
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
        }
    }
}

/// Look up a metric by name.
pub fn find_metric(metrics: &[MetricValue], name: &str) -> Option<f64> {
    metrics.iter().find(|m| m.metric == name).map(|m| m.value)
}

/// Stored result of scoring one ranked list for one query text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub search_configuration_id: String,
    pub search_text: String,
    pub judgment_ids: Vec<String>,
    pub document_ids: Vec<String>,
    pub metrics: Vec<MetricValue>,
    pub experiment_id: Option<String>,
    pub experiment_variant_id: Option<VariantId>,
    /// Only set for hybrid optimizer variants.
    pub experiment_variant_parameters: Option<String>,
}

/// A fully built search request for one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub index: String,
    /// Query body with the query text already substituted.
    pub source: serde_json::Value,
    /// Temporary search pipeline applied to this request only.
    pub pipeline: Option<serde_json::Value>,
    pub query_text: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub total_hits: u64,
    pub hits: Vec<SearchHit>,
    pub took_ms: u64,
}

impl SearchResponse {
    pub fn from_hits(hits: Vec<SearchHit>) -> Self {
        Self {
            total_hits: hits.len() as u64,
            hits,
            took_ms: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_hits == 0 || self.hits.is_empty()
    }

    /// Ranked document ids, best first.
    pub fn doc_ids(&self) -> Vec<String> {
        self.hits.iter().map(|hit| hit.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_metric_by_name() {
        let metrics = vec![
            MetricValue::new("Precision@10", 0.4),
            MetricValue::new(ndcg_metric_name(10), 0.87),
        ];
        assert_eq!(find_metric(&metrics, "NDCG@10"), Some(0.87));
        assert_eq!(find_metric(&metrics, "NDCG@5"), None);
    }

    #[test]
    fn empty_response_has_no_doc_ids() {
        let response = SearchResponse::default();
        assert!(response.is_empty());
        assert!(response.doc_ids().is_empty());
    }

    #[test]
    fn doc_ids_keep_rank_order() {
        let response = SearchResponse::from_hits(vec![
            SearchHit { id: "b".into(), score: 2.0 },
            SearchHit { id: "a".into(), score: 1.0 },
        ]);
        assert_eq!(response.doc_ids(), vec!["b".to_string(), "a".to_string()]);
        assert_eq!(response.total_hits, 2);
    }
}
