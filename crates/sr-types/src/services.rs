//! Interfaces to the collaborators an experiment run depends on.
//!
//! The orchestrator never talks to a search cluster, a metric formula or a
//! storage backend directly; it goes through these traits so each can be
//! swapped for an in-memory implementation.

use async_trait::async_trait;

use crate::errors::{SearchError, StoreError};
use crate::evaluation::{EvaluationRecord, MetricValue, Ratings, SearchRequest, SearchResponse};
use crate::experiment::ExperimentVariant;

/// Executes one search request.
///
/// Implementations must not block the calling thread while waiting on the
/// cluster.
#[async_trait]
pub trait SearchExecutor: Send + Sync {
    async fn execute(&self, request: SearchRequest) -> Result<SearchResponse, SearchError>;
}

/// Computes relevance metrics for a ranked list. Pure, no side effects.
pub trait MetricsCalculator: Send + Sync {
    fn compute(&self, ranked_doc_ids: &[String], ratings: &Ratings, cutoff: usize) -> Vec<MetricValue>;
}

/// Persists evaluation records and variant state.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put_evaluation(&self, record: EvaluationRecord) -> Result<(), StoreError>;

    async fn put_variant(&self, variant: ExperimentVariant) -> Result<(), StoreError>;
}

/// Resolves relevance ratings for a query text from a set of judgment lists.
#[async_trait]
pub trait RatingsProvider: Send + Sync {
    async fn ratings_for(&self, query_text: &str, judgment_ids: &[String]) -> Result<Ratings, StoreError>;
}
