use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sr_data::{sample_corpus, FixtureSearchExecutor, InMemoryResultStore, JudgmentCatalog, JudgmentSet};
use sr_engine::{Collaborators, ExecutorConfig, ExperimentProcessor, TaskManager};
use sr_metrics::EvaluationMetrics;
use sr_optimizer::HybridVariantFactory;
use sr_types::SearchConfiguration;

const RESULT_SIZE: usize = 5;

const HYBRID_QUERY: &str = r#"{
    "query": {
        "hybrid": {
            "queries": [
                { "match": { "text": { "query": "%SearchText%" } } },
                { "neural": { "embedding": { "query_text": "%SearchText%", "k": 50 } } }
            ]
        }
    },
    "size": 5
}"#;

fn judgments() -> JudgmentSet {
    JudgmentSet::new("demo-judgments")
        .with_query(
            "red running shoes",
            &[("p1", 3.0), ("p2", 2.0), ("p7", 2.0), ("p4", 1.0), ("p5", 0.0)],
        )
        .with_query(
            "waterproof boots",
            &[("p6", 3.0), ("p3", 2.0), ("p4", 1.0)],
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ExecutorConfig::from_env().context("invalid executor configuration")?;
    let experiment_id = std::env::var("SR_EXPERIMENT_ID").unwrap_or_else(|_| "demo-experiment".to_string());

    let search = sample_corpus()
        .into_iter()
        .fold(FixtureSearchExecutor::new(), |search, (index, documents)| {
            search.with_index(&index, documents)
        })
        .with_latency(Duration::from_millis(5));
    let store = Arc::new(InMemoryResultStore::new());
    let catalog = JudgmentCatalog::new();
    catalog.register(judgments());

    let (reports_tx, reports_rx) = crossbeam_channel::unbounded();
    let manager = Arc::new(TaskManager::new(
        config,
        Collaborators {
            search: Arc::new(search),
            metrics: Arc::new(EvaluationMetrics::new()),
            store: store.clone(),
        },
        Some(reports_tx),
    )?);
    let processor = ExperimentProcessor::new(
        Arc::clone(&manager),
        Arc::new(HybridVariantFactory::default()),
        Arc::new(catalog),
    );

    let configurations = vec![
        SearchConfiguration::new("products-hybrid", "products", HYBRID_QUERY).with_name("Products hybrid"),
        SearchConfiguration::new("products-v2-hybrid", "products-v2", HYBRID_QUERY)
            .with_name("Products v2 hybrid"),
    ];
    let queries = vec!["red running shoes".to_string(), "waterproof boots".to_string()];

    let results = processor
        .run_experiment(
            &experiment_id,
            &queries,
            &configurations,
            &["demo-judgments".to_string()],
            RESULT_SIZE,
        )
        .await
        .context("experiment failed")?;

    while manager.pending_writes() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let reports: Vec<_> = reports_rx.try_iter().collect();
    let stats = store.get_stats();
    info!(
        evaluations = store.evaluation_count(),
        variants = store.variant_count(),
        write_failures = stats.failures,
        "experiment finished"
    );

    let output = json!({
        "experiment_id": experiment_id,
        "results": results,
        "reports": reports,
        "concurrency": manager.concurrency_metrics(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
