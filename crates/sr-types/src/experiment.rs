//! Experiments, search configurations and the variants evaluated for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique experiment variant identifier.
pub type VariantId = Uuid;

/// Parameter key for the score normalization technique of a hybrid query.
pub const PARAM_NORMALIZATION_TECHNIQUE: &str = "normalization";
/// Parameter key for the score combination technique of a hybrid query.
pub const PARAM_COMBINATION_TECHNIQUE: &str = "combination";
/// Parameter key for the per-sub-query combination weights.
pub const PARAM_WEIGHTS_FOR_COMBINATION: &str = "weights";

/// Placeholder substituted with the query text inside a search configuration.
pub const QUERY_TEXT_PLACEHOLDER: &str = "%SearchText%";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentType {
    PairwiseComparison,
    PointwiseEvaluation,
    HybridOptimizer,
}

/// Lifecycle of a single variant.
///
/// A variant starts out `Processing` and moves exactly once to `Completed` or
/// `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VariantStatus {
    Processing,
    Completed,
    Error,
}

impl VariantStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Processing)
    }
}

/// A stored search configuration: which index to hit and the query template
/// to run against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfiguration {
    pub id: String,
    pub name: String,
    pub index: String,
    /// JSON query body containing [`QUERY_TEXT_PLACEHOLDER`].
    pub query: String,
}

impl SearchConfiguration {
    pub fn new(id: impl Into<String>, index: impl Into<String>, query: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            index: index.into(),
            query: query.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// One parameter combination evaluated for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentVariant {
    pub id: VariantId,
    pub timestamp: DateTime<Utc>,
    pub experiment_type: ExperimentType,
    pub status: VariantStatus,
    pub experiment_id: String,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub results: BTreeMap<String, String>,
}

impl ExperimentVariant {
    pub fn new(
        experiment_id: impl Into<String>,
        experiment_type: ExperimentType,
        parameters: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            experiment_type,
            status: VariantStatus::Processing,
            experiment_id: experiment_id.into(),
            parameters,
            results: BTreeMap::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Build the terminal record for this variant.
    ///
    /// Returns `None` if this variant is already terminal or `status` is not a
    /// terminal status; a terminal variant is never rewritten.
    pub fn finish(&self, status: VariantStatus, results: BTreeMap<String, String>) -> Option<Self> {
        if self.is_terminal() || !status.is_terminal() {
            return None;
        }
        Some(Self {
            id: self.id,
            timestamp: Utc::now(),
            experiment_type: self.experiment_type,
            status,
            experiment_id: self.experiment_id.clone(),
            parameters: self.parameters.clone(),
            results,
        })
    }

    /// Hybrid combination weights, if present.
    pub fn weights(&self) -> Option<Vec<f64>> {
        self.parameters
            .get(PARAM_WEIGHTS_FOR_COMBINATION)?
            .as_array()?
            .iter()
            .map(|v| v.as_f64())
            .collect()
    }

    /// Human-readable parameter encoding:
    /// `"{normalization}, {combination}, {w0};{w1}"` for hybrid variants.
    pub fn textual_parameters(&self) -> String {
        let technique = |key: &str| {
            self.parameters
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string()
        };

        let weights = match self.weights() {
            Some(weights) => weights
                .iter()
                .map(|w| format_weight(*w))
                .collect::<Vec<_>>()
                .join(";"),
            None => "none".to_string(),
        };

        format!(
            "{}, {}, {}",
            technique(PARAM_NORMALIZATION_TECHNIQUE),
            technique(PARAM_COMBINATION_TECHNIQUE),
            weights
        )
    }
}

/// Weights are generated on a decimal grid; trim float noise for display.
fn format_weight(weight: f64) -> String {
    let rounded = (weight * 1000.0).round() / 1000.0;
    format!("{rounded}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hybrid_variant(weights: [f64; 2]) -> ExperimentVariant {
        let mut params = BTreeMap::new();
        params.insert(PARAM_NORMALIZATION_TECHNIQUE.into(), serde_json::json!("min_max"));
        params.insert(PARAM_COMBINATION_TECHNIQUE.into(), serde_json::json!("arithmetic_mean"));
        params.insert(PARAM_WEIGHTS_FOR_COMBINATION.into(), serde_json::json!(weights));
        ExperimentVariant::new("exp-1", ExperimentType::HybridOptimizer, params)
    }

    #[test]
    fn textual_parameters_encode_techniques_and_weights() {
        let variant = hybrid_variant([0.3, 0.7]);
        assert_eq!(variant.textual_parameters(), "min_max, arithmetic_mean, 0.3;0.7");
    }

    #[test]
    fn textual_parameters_trim_float_noise() {
        let variant = hybrid_variant([0.1 + 0.2, 1.0 - (0.1 + 0.2)]);
        assert_eq!(variant.textual_parameters(), "min_max, arithmetic_mean, 0.3;0.7");
    }

    #[test]
    fn variant_lifecycle_is_one_way() {
        let variant = hybrid_variant([0.5, 0.5]);
        assert_eq!(variant.status, VariantStatus::Processing);
        assert!(variant.finish(VariantStatus::Processing, BTreeMap::new()).is_none());

        let done = variant
            .finish(VariantStatus::Completed, BTreeMap::new())
            .unwrap();
        assert_eq!(done.status, VariantStatus::Completed);
        assert_eq!(done.id, variant.id);
        assert!(done.finish(VariantStatus::Error, BTreeMap::new()).is_none());
    }

    #[test]
    fn weights_are_read_back() {
        let variant = hybrid_variant([0.2, 0.8]);
        assert_eq!(variant.weights(), Some(vec![0.2, 0.8]));

        let plain = ExperimentVariant::new("exp", ExperimentType::PointwiseEvaluation, BTreeMap::new());
        assert_eq!(plain.weights(), None);
        assert_eq!(plain.textual_parameters(), "unknown, unknown, none");
    }

    #[test]
    fn status_serializes_upper_case() {
        let json = serde_json::to_string(&VariantStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
    }
}
