//! Task manager: the entry point that turns a batch request into admitted,
//! dispatched and aggregated variant tasks.

use std::collections::HashSet;
use std::sync::Arc;

use crossbeam_channel::Sender;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinError;
use tracing::{debug, info};
use uuid::Uuid;

use sr_metrics::AggregateReport;
use sr_optimizer::{build_hybrid_request, build_search_request, temporary_search_pipeline};
use sr_types::{
    config_error, ExperimentType, ExperimentVariant, MetricsCalculator, Ratings, ResultStore,
    SearchError, SearchExecutor, SearchRequest, SrResult,
};

use crate::aggregator::{EvaluationContext, QueryKey, ResultAggregator};
use crate::batch::{BatchHandle, BatchKey, Completion, TaskBatch};
use crate::classifier::is_batch_fatal;
use crate::config::ExecutorConfig;
use crate::dispatcher::{DispatchTask, WorkerDispatcher};
use crate::gate::{AdmissionPermit, ConcurrencyGate};
use crate::writer::BackgroundWriter;

/// External services a task manager drives.
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchExecutor>,
    pub metrics: Arc<dyn MetricsCalculator>,
    pub store: Arc<dyn ResultStore>,
}

/// All variants to evaluate for one search configuration and query text.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub experiment_id: String,
    pub search_configuration_id: String,
    pub index: String,
    /// Query template containing the query text placeholder.
    pub query_definition: String,
    pub query_text: String,
    pub size: usize,
    pub variants: Vec<ExperimentVariant>,
    pub judgment_ids: Vec<String>,
    pub ratings: Ratings,
}

/// Point-in-time view of scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyMetrics {
    pub active_batches: usize,
    pub active_tasks: usize,
    pub max_concurrent: usize,
    pub available_permits: usize,
    pub queued_retries: usize,
    pub worker_queue_depth: usize,
}

/// State every variant task needs after it leaves the manager.
struct Shared {
    search: Arc<dyn SearchExecutor>,
    aggregator: Arc<ResultAggregator>,
    batches: DashMap<Uuid, Arc<TaskBatch>>,
    runtime: Handle,
}

impl Shared {
    fn complete(&self, batch: &TaskBatch, completion: Completion) {
        if completion == Completion::Last {
            self.finish_batch(batch);
        }
    }

    fn finish_batch(&self, batch: &TaskBatch) {
        let key = batch.key();
        self.aggregator
            .close_batch(&QueryKey::new(&key.experiment_id, &key.query_text));
        batch.finalize();
        self.retire(batch);
    }

    /// Drops `batch` from the registry. Tasks still queued for it keep their
    /// own reference.
    fn retire(&self, batch: &TaskBatch) {
        if self.batches.remove(&batch.id()).is_some() {
            debug!(batch_id = %batch.id(), remaining_batches = self.batches.len(), "batch retired");
        }
    }
}

pub struct TaskManager {
    config: ExecutorConfig,
    shared: Arc<Shared>,
    dispatcher: Arc<WorkerDispatcher>,
    writer: BackgroundWriter,
}

impl TaskManager {
    /// Builds a manager on the current tokio runtime.
    pub fn new(
        config: ExecutorConfig,
        collaborators: Collaborators,
        reports: Option<Sender<AggregateReport>>,
    ) -> SrResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| config_error!("task manager needs a tokio runtime: {}", e))?;
        Self::with_runtime(config, collaborators, reports, runtime)
    }

    pub fn with_runtime(
        config: ExecutorConfig,
        collaborators: Collaborators,
        reports: Option<Sender<AggregateReport>>,
        runtime: Handle,
    ) -> SrResult<Self> {
        config.validate()?;

        let gate = ConcurrencyGate::new(config.max_concurrent_tasks);
        let dispatcher = Arc::new(WorkerDispatcher::new(&config, gate, runtime.clone())?);
        let writer = BackgroundWriter::new(collaborators.store, runtime.clone());
        let aggregator = Arc::new(ResultAggregator::new(
            collaborators.metrics,
            writer.clone(),
            config.primary_metric_cutoff,
            reports,
        ));

        info!(
            max_concurrent = config.max_concurrent_tasks,
            worker_threads = config.worker_threads,
            retry_delay_ms = config.retry_delay.as_millis() as u64,
            "task manager started"
        );

        Ok(Self {
            config,
            shared: Arc::new(Shared {
                search: collaborators.search,
                aggregator,
                batches: DashMap::new(),
                runtime,
            }),
            dispatcher,
            writer,
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn aggregator(&self) -> &Arc<ResultAggregator> {
        &self.shared.aggregator
    }

    /// Schedules every variant of `request` and returns the batch's handle
    /// without waiting for any of them.
    pub fn submit_batch(&self, request: BatchRequest) -> BatchHandle {
        let key = BatchKey {
            experiment_id: request.experiment_id.clone(),
            search_config_id: request.search_configuration_id.clone(),
            query_text: request.query_text.clone(),
        };
        let (batch, handle) =
            TaskBatch::new(key, request.variants.iter().map(|v| v.id), self.writer.clone());
        let batch = Arc::new(batch);
        self.shared.batches.insert(batch.id(), Arc::clone(&batch));
        batch.activate();

        let context = Arc::new(EvaluationContext {
            experiment_id: request.experiment_id,
            search_configuration_id: request.search_configuration_id,
            query_text: request.query_text,
            judgment_ids: request.judgment_ids,
            ratings: request.ratings,
            size: request.size,
        });
        self.shared.aggregator.open_batch(context.query_key());

        info!(
            batch_id = %batch.id(),
            experiment_id = %context.experiment_id,
            search_config_id = %context.search_configuration_id,
            query_text = %context.query_text,
            variants = batch.total(),
            "submitting batch"
        );

        if batch.total() == 0 {
            self.shared.finish_batch(&batch);
            return handle;
        }

        let index: Arc<str> = request.index.into();
        let query_definition: Arc<str> = request.query_definition.into();
        let mut seen = HashSet::with_capacity(batch.total());
        for variant in request.variants {
            if !seen.insert(variant.id) {
                debug!(batch_id = %batch.id(), variant_id = %variant.id, "skipping duplicate variant");
                continue;
            }
            self.dispatcher.submit(Box::new(VariantTask {
                shared: Arc::clone(&self.shared),
                batch: Arc::clone(&batch),
                context: Arc::clone(&context),
                index: Arc::clone(&index),
                query_definition: Arc::clone(&query_definition),
                variant,
            }));
        }
        handle
    }

    pub fn concurrency_metrics(&self) -> ConcurrencyMetrics {
        let gate = self.dispatcher.gate();
        ConcurrencyMetrics {
            active_batches: self.shared.batches.len(),
            active_tasks: gate.in_flight(),
            max_concurrent: gate.max_concurrent(),
            available_permits: gate.available_permits(),
            queued_retries: self.dispatcher.queued_retries(),
            worker_queue_depth: self.dispatcher.queue_depth(),
        }
    }

    /// Background store writes not yet finished.
    pub fn pending_writes(&self) -> usize {
        self.writer.pending()
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("config", &self.config)
            .field("metrics", &self.concurrency_metrics())
            .finish()
    }
}

/// Search, score and record one variant of a batch.
struct VariantTask {
    shared: Arc<Shared>,
    batch: Arc<TaskBatch>,
    context: Arc<EvaluationContext>,
    index: Arc<str>,
    query_definition: Arc<str>,
    variant: ExperimentVariant,
}

impl VariantTask {
    fn build_request(&self) -> Result<SearchRequest, SearchError> {
        if self.variant.experiment_type == ExperimentType::HybridOptimizer {
            build_hybrid_request(
                &self.index,
                &self.query_definition,
                temporary_search_pipeline(&self.variant),
                &self.context.query_text,
                self.context.size,
            )
        } else {
            build_search_request(
                &self.index,
                &self.query_definition,
                None,
                &self.context.query_text,
                self.context.size,
            )
        }
    }

    fn fail(self, error: SearchError) {
        // Out of the registry before the abort rejects the caller's handle.
        if is_batch_fatal(&error) {
            self.shared.retire(&self.batch);
        }
        let completion = self
            .shared
            .aggregator
            .on_search_failure(error, &self.variant, &self.batch);
        self.shared.complete(&self.batch, completion);
    }
}

impl DispatchTask for VariantTask {
    fn label(&self) -> String {
        format!("{}/{}", self.batch.id(), self.variant.id)
    }

    fn is_cancelled(&self) -> bool {
        self.batch.is_aborted()
    }

    fn cancel(self: Box<Self>) {
        debug!(batch_id = %self.batch.id(), variant_id = %self.variant.id, "skipping variant of aborted batch");
        let completion = self.batch.record_failure(self.variant.id);
        self.shared.complete(&self.batch, completion);
    }

    fn run(self: Box<Self>, permit: AdmissionPermit) {
        if self.is_cancelled() {
            drop(permit);
            self.cancel();
            return;
        }

        let request = match self.build_request() {
            Ok(request) => request,
            Err(error) => {
                drop(permit);
                self.fail(error);
                return;
            }
        };

        let task = *self;
        let runtime = task.shared.runtime.clone();
        runtime.spawn(async move {
            let search = Arc::clone(&task.shared.search);
            // The search runs in its own task so a panic surfaces as a
            // join error instead of unwinding through batch accounting.
            let outcome = task
                .shared
                .runtime
                .spawn(async move { search.execute(request).await })
                .await;
            drop(permit);

            match outcome {
                Ok(Ok(response)) => {
                    let completion = task.shared.aggregator.on_search_response(
                        response,
                        &task.variant,
                        &task.batch,
                        &task.context,
                    );
                    task.shared.complete(&task.batch, completion);
                }
                Ok(Err(error)) => task.fail(error),
                Err(join_error) => task.fail(SearchError::TaskPanicked {
                    message: panic_message(join_error),
                }),
            }
        });
    }
}

fn panic_message(error: JoinError) -> String {
    if error.is_cancelled() {
        return "search task cancelled".to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "search task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use sr_data::{sample_corpus, FixtureSearchExecutor, InMemoryResultStore, ScriptedFailure};
    use sr_metrics::EvaluationMetrics;
    use sr_optimizer::{HybridVariantFactory, VariantFactory};
    use sr_types::{BatchError, SearchHit, SearchResponse, VariantStatus};

    use crate::batch::BatchStatus;

    const TEMPLATE: &str = r#"{
        "query": {
            "hybrid": {
                "queries": [
                    { "match": { "text": "%SearchText%" } },
                    { "neural": { "embedding": { "query_text": "%SearchText%", "k": 10 } } }
                ]
            }
        }
    }"#;

    /// Search that parks every call until the test releases it.
    struct GatedSearch {
        release: Semaphore,
        started: AtomicUsize,
    }

    impl GatedSearch {
        fn new() -> Self {
            Self {
                release: Semaphore::new(0),
                started: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SearchExecutor for GatedSearch {
        async fn execute(&self, _request: SearchRequest) -> Result<SearchResponse, SearchError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
            Ok(SearchResponse::from_hits(vec![SearchHit {
                id: "p1".into(),
                score: 1.0,
            }]))
        }
    }

    fn config(max: usize) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_max_concurrent_tasks(max)
            .with_worker_threads(2)
            .with_retry_delay(Duration::from_millis(20))
    }

    fn manager(
        config: ExecutorConfig,
        search: Arc<dyn SearchExecutor>,
        store: Arc<InMemoryResultStore>,
    ) -> TaskManager {
        TaskManager::new(
            config,
            Collaborators {
                search,
                metrics: Arc::new(EvaluationMetrics::new()),
                store,
            },
            None,
        )
        .unwrap()
    }

    fn fixture_search() -> FixtureSearchExecutor {
        sample_corpus()
            .into_iter()
            .fold(FixtureSearchExecutor::new(), |search, (index, docs)| {
                search.with_index(&index, docs)
            })
    }

    fn request(config_id: &str, index: &str, query: &str, variants: Vec<ExperimentVariant>) -> BatchRequest {
        BatchRequest {
            experiment_id: "exp".into(),
            search_configuration_id: config_id.into(),
            index: index.into(),
            query_definition: TEMPLATE.into(),
            query_text: query.into(),
            size: 5,
            variants,
            judgment_ids: vec!["judgments".into()],
            ratings: Ratings::from([("p1".to_string(), 3.0), ("p3".to_string(), 1.0)]),
        }
    }

    fn variants(n: usize) -> Vec<ExperimentVariant> {
        HybridVariantFactory::default()
            .variants("exp")
            .into_iter()
            .take(n)
            .collect()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn excess_variants_wait_for_released_permits() {
        let search = Arc::new(GatedSearch::new());
        let store = Arc::new(InMemoryResultStore::new());
        let manager = manager(config(8), search.clone(), store);

        let handle = manager.submit_batch(request("cfg", "products", "red shoes", variants(10)));

        wait_for(|| search.started.load(Ordering::SeqCst) == 8).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(search.started.load(Ordering::SeqCst), 8);
        let metrics = manager.concurrency_metrics();
        assert_eq!(metrics.active_tasks, 8);
        assert_eq!(metrics.available_permits, 0);
        assert!(metrics.queued_retries >= 1);

        search.release.add_permits(2);
        wait_for(|| search.started.load(Ordering::SeqCst) == 10).await;

        search.release.add_permits(8);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.summary.total, 10);
        assert_eq!(outcome.summary.succeeded, 10);
        assert_eq!(outcome.status, BatchStatus::Success);
        assert_eq!(manager.concurrency_metrics().active_batches, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_hits_fails_variant_without_error() {
        let search = fixture_search();
        search.fail_index("products", ScriptedFailure::NoHits);
        let store = Arc::new(InMemoryResultStore::new());
        let manager = manager(config(4), Arc::new(search), store.clone());

        let batch_variants = variants(1);
        let variant_id = batch_variants[0].id;
        let outcome = manager
            .submit_batch(request("cfg", "products", "red shoes", batch_variants))
            .await
            .unwrap();
        assert_eq!(outcome.status, BatchStatus::AllFailed);
        assert_eq!(outcome.summary.failed, 1);

        wait_for(|| manager.pending_writes() == 0).await;
        let stored = store.variant(&variant_id).unwrap();
        assert_eq!(stored.status, VariantStatus::Error);
        assert!(stored.results["details"].contains("no search hits"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn circuit_breaking_aborts_and_stops_admission() {
        let search = Arc::new(
            fixture_search().with_latency(Duration::from_millis(20)),
        );
        search.fail_index(
            "products",
            ScriptedFailure::error(|| {
                SearchError::wrap(
                    "all shards failed",
                    SearchError::CircuitBreaking {
                        message: "[parent] Data too large".into(),
                    },
                )
            }),
        );
        let store = Arc::new(InMemoryResultStore::new());
        let manager = manager(
            config(2).with_retry_delay(Duration::from_millis(500)),
            search.clone(),
            store,
        );

        let handle = manager.submit_batch(request("cfg", "products", "red shoes", variants(6)));
        match handle.await {
            Err(BatchError::Aborted { search_config_id, source, .. }) => {
                assert_eq!(search_config_id, "cfg");
                assert!(source.to_string().contains("all shards failed"));
            }
            other => panic!("expected aborted batch, got {other:?}"),
        }

        // Deferred variants are still waiting on the retry timer.
        assert_eq!(manager.concurrency_metrics().active_batches, 0);
        wait_for(|| manager.concurrency_metrics().active_tasks == 0).await;
        assert!(search.call_count() <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panicking_search_is_task_local() {
        let search = fixture_search();
        search.fail_when(
            |request| request.query_text == "boom",
            ScriptedFailure::Panic("search exploded".into()),
        );
        let store = Arc::new(InMemoryResultStore::new());
        let manager = manager(config(4), Arc::new(search), store.clone());

        let batch_variants = variants(3);
        let first = batch_variants[0].id;
        let outcome = manager
            .submit_batch(request("cfg", "products", "boom", batch_variants))
            .await
            .unwrap();
        assert_eq!(outcome.status, BatchStatus::AllFailed);

        wait_for(|| manager.pending_writes() == 0).await;
        assert!(store.variant(&first).unwrap().results["error"].contains("search exploded"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn invalid_template_fails_each_variant() {
        let store = Arc::new(InMemoryResultStore::new());
        let manager = manager(config(4), Arc::new(fixture_search()), store);

        let mut bad = request("cfg", "products", "red shoes", variants(2));
        bad.query_definition = r#"{"query": {"match": {"text": "%SearchText%"}}}"#.into();
        let outcome = tokio_test::assert_ok!(manager.submit_batch(bad).await);
        assert_eq!(outcome.status, BatchStatus::AllFailed);
        assert_eq!(outcome.summary.failed, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn duplicate_variants_are_searched_once() {
        let search = Arc::new(fixture_search());
        let store = Arc::new(InMemoryResultStore::new());
        let manager = manager(config(4), search.clone(), store.clone());

        let mut batch_variants = variants(2);
        batch_variants.push(batch_variants[0].clone());
        let outcome = tokio_test::assert_ok!(
            manager
                .submit_batch(request("cfg", "products", "red shoes", batch_variants))
                .await
        );
        assert_eq!(outcome.summary.total, 2);
        assert_eq!(outcome.summary.succeeded, 2);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(search.call_count(), 2);

        wait_for(|| manager.pending_writes() == 0).await;
        assert_eq!(store.evaluation_count(), 2);
    }

    #[tokio::test]
    async fn empty_batch_resolves_immediately() {
        let store = Arc::new(InMemoryResultStore::new());
        let manager = manager(config(2), Arc::new(fixture_search()), store);

        let outcome =
            tokio_test::assert_ok!(manager.submit_batch(request("cfg", "products", "red shoes", vec![])).await);
        assert_eq!(outcome.status, BatchStatus::Success);
        assert_eq!(outcome.summary.total, 0);
        assert_eq!(manager.concurrency_metrics().active_batches, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_batches_account_every_variant_once() {
        let search = Arc::new(fixture_search().with_latency(Duration::from_millis(2)));
        let store = Arc::new(InMemoryResultStore::new());
        let manager = manager(config(3), search.clone(), store.clone());

        let mut submitted = Vec::new();
        let mut handles = Vec::new();
        for (i, query) in ["red shoes", "waterproof boots", "running"].iter().enumerate() {
            for index in ["products", "products-v2"] {
                let batch_variants = variants(12);
                submitted.push(batch_variants.iter().map(|v| v.id).collect::<HashSet<_>>());
                handles.push(manager.submit_batch(request(
                    &format!("cfg-{i}-{index}"),
                    index,
                    query,
                    batch_variants,
                )));
            }
        }

        for (handle, ids) in handles.into_iter().zip(submitted) {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.summary.succeeded + outcome.summary.failed, 12);
            let returned: HashSet<_> = outcome.results.iter().map(|r| r.variant_id).collect();
            assert_eq!(returned.len(), outcome.results.len());
            assert!(returned.is_subset(&ids));
        }

        assert!(search.peak_in_flight() <= 3);
        wait_for(|| manager.pending_writes() == 0).await;
        assert_eq!(store.variant_count(), 72);

        let metrics = manager.concurrency_metrics();
        assert_eq!(metrics.active_batches, 0);
        assert_eq!(metrics.active_tasks, 0);
        assert_eq!(metrics.max_concurrent, 3);
        assert_eq!(metrics.available_permits, 3);
    }
}
