//! Variant factories: turn an option space into the variants of one batch.

use std::collections::BTreeMap;

use sr_types::{
    ExperimentType, ExperimentVariant, PARAM_COMBINATION_TECHNIQUE, PARAM_NORMALIZATION_TECHNIQUE,
    PARAM_WEIGHTS_FOR_COMBINATION,
};

use crate::options::{HybridCombination, HybridSearchOptions};

/// Supplies the fixed list of variants for a batch.
///
/// Every call returns fresh variants with new identifiers, so two batches
/// never share a variant.
pub trait VariantFactory: Send + Sync {
    fn variants(&self, experiment_id: &str) -> Vec<ExperimentVariant>;

    /// Human-readable factory name.
    fn name(&self) -> &str;
}

/// Exhaustive sweep over a [`HybridSearchOptions`] space.
#[derive(Debug, Clone)]
pub struct HybridVariantFactory {
    options: HybridSearchOptions,
    include_weights: bool,
}

impl HybridVariantFactory {
    pub fn new(options: HybridSearchOptions) -> Self {
        Self {
            options,
            include_weights: true,
        }
    }

    /// Keep the default 0.5/0.5 weights instead of sweeping them.
    pub fn without_weight_sweep(mut self) -> Self {
        self.include_weights = false;
        self
    }

    pub fn options(&self) -> &HybridSearchOptions {
        &self.options
    }

    fn to_variant(experiment_id: &str, combo: HybridCombination) -> ExperimentVariant {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            PARAM_NORMALIZATION_TECHNIQUE.to_string(),
            serde_json::Value::String(combo.normalization_technique),
        );
        parameters.insert(
            PARAM_COMBINATION_TECHNIQUE.to_string(),
            serde_json::Value::String(combo.combination_technique),
        );
        parameters.insert(
            PARAM_WEIGHTS_FOR_COMBINATION.to_string(),
            serde_json::json!(combo.weights),
        );
        ExperimentVariant::new(experiment_id, ExperimentType::HybridOptimizer, parameters)
    }
}

impl Default for HybridVariantFactory {
    fn default() -> Self {
        Self::new(HybridSearchOptions::default())
    }
}

impl VariantFactory for HybridVariantFactory {
    fn variants(&self, experiment_id: &str) -> Vec<ExperimentVariant> {
        self.options
            .parameter_combinations(self.include_weights)
            .into_iter()
            .map(|combo| Self::to_variant(experiment_id, combo))
            .collect()
    }

    fn name(&self) -> &str {
        "hybrid"
    }
}
