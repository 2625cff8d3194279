//! Experiment fan-out: one batch per search configuration for every query
//! text of an experiment.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use sr_optimizer::VariantFactory;
use sr_types::{RatingsProvider, SearchConfiguration, SrResult};

use crate::aggregator::QueryKey;
use crate::batch::VariantResultRef;
use crate::manager::{BatchRequest, TaskManager};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfigurationResult {
    pub search_configuration_id: String,
    pub evaluation_results: Vec<VariantResultRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResults {
    pub query_text: String,
    /// Configurations whose batch produced no evaluation are left out.
    pub search_configuration_results: Vec<SearchConfigurationResult>,
}

pub struct ExperimentProcessor {
    manager: Arc<TaskManager>,
    factory: Arc<dyn VariantFactory>,
    ratings: Arc<dyn RatingsProvider>,
}

impl ExperimentProcessor {
    pub fn new(
        manager: Arc<TaskManager>,
        factory: Arc<dyn VariantFactory>,
        ratings: Arc<dyn RatingsProvider>,
    ) -> Self {
        Self {
            manager,
            factory,
            ratings,
        }
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    /// Evaluates every variant for `query_text` against every configuration.
    ///
    /// All batches are submitted before any is awaited. A batch-fatal failure
    /// in any of them fails the whole query.
    pub async fn process_query(
        &self,
        experiment_id: &str,
        query_text: &str,
        configurations: &[SearchConfiguration],
        judgment_ids: &[String],
        size: usize,
    ) -> SrResult<QueryResults> {
        let aggregator = self.manager.aggregator();
        let hold = aggregator.hold_query(QueryKey::new(experiment_id, query_text));

        let ratings = self.ratings.ratings_for(query_text, judgment_ids).await?;

        let handles: Vec<_> = configurations
            .iter()
            .map(|configuration| {
                self.manager.submit_batch(BatchRequest {
                    experiment_id: experiment_id.to_string(),
                    search_configuration_id: configuration.id.clone(),
                    index: configuration.index.clone(),
                    query_definition: configuration.query.clone(),
                    query_text: query_text.to_string(),
                    size,
                    variants: self.factory.variants(experiment_id),
                    judgment_ids: judgment_ids.to_vec(),
                    ratings: ratings.clone(),
                })
            })
            .collect();
        drop(hold);

        let mut search_configuration_results = Vec::with_capacity(handles.len());
        // Every batch is already running; awaiting in order only orders the results.
        for handle in handles {
            match handle.await {
                Ok(outcome) if outcome.results.is_empty() => {}
                Ok(outcome) => search_configuration_results.push(SearchConfigurationResult {
                    search_configuration_id: outcome.search_configuration_id,
                    evaluation_results: outcome.results,
                }),
                Err(e) => {
                    error!(
                        experiment_id = %experiment_id,
                        query_text = %query_text,
                        error = %e,
                        "query evaluation failed"
                    );
                    return Err(e.into());
                }
            }
        }

        Ok(QueryResults {
            query_text: query_text.to_string(),
            search_configuration_results,
        })
    }

    /// Runs every query of an experiment one after another.
    pub async fn run_experiment(
        &self,
        experiment_id: &str,
        queries: &[String],
        configurations: &[SearchConfiguration],
        judgment_ids: &[String],
        size: usize,
    ) -> SrResult<Vec<QueryResults>> {
        self.manager
            .aggregator()
            .register_expected_queries(experiment_id, queries.iter().cloned());

        info!(
            experiment_id = %experiment_id,
            queries = queries.len(),
            configurations = configurations.len(),
            variant_source = self.factory.name(),
            "running experiment"
        );

        let mut results = Vec::with_capacity(queries.len());
        for query_text in queries {
            results.push(
                self.process_query(experiment_id, query_text, configurations, judgment_ids, size)
                    .await?,
            );
        }
        Ok(results)
    }
}
