//! # sr-engine
//!
//! Bounded-concurrency orchestration of search relevance experiments.
//!
//! A [`TaskManager`] turns each batch request (every variant of one search
//! configuration for one query text) into tasks that pass a node-wide
//! [`ConcurrencyGate`], run on the [`WorkerDispatcher`]'s pool, and report
//! back into a [`TaskBatch`]. The [`ResultAggregator`] scores responses and
//! tracks the best hybrid configuration per query; the failure classifier
//! decides whether an error fails one variant or the whole batch.

pub mod aggregator;
pub mod batch;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod experiment;
pub mod gate;
pub mod manager;
pub mod writer;

pub use aggregator::{
    BestConfiguration, BestConfigurationTracker, EvaluationContext, QueryHold, QueryKey,
    ResultAggregator, NO_HITS_DETAIL,
};
pub use batch::{
    BatchHandle, BatchKey, BatchOutcome, BatchPhase, BatchStatus, BatchSummary, Completion,
    TaskBatch, VariantResultRef,
};
pub use classifier::{classify, is_batch_fatal, FailureClass};
pub use config::ExecutorConfig;
pub use dispatcher::{DispatchTask, WorkerDispatcher};
pub use experiment::{ExperimentProcessor, QueryResults, SearchConfigurationResult};
pub use gate::{AdmissionPermit, ConcurrencyGate};
pub use manager::{BatchRequest, Collaborators, ConcurrencyMetrics, TaskManager};
pub use writer::BackgroundWriter;
