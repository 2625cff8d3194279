//! Hybrid search option space and its exhaustive parameter sweep.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// Weight pair used when weights are not part of the sweep.
pub const DEFAULT_WEIGHTS: [f64; 2] = [0.5, 0.5];

/// Rounding applied to generated weights so `0.1 * 3` reads as `0.3`.
const WEIGHT_PRECISION: f64 = 1_000_000.0;

/// Ranges with more grid points than this are treated as degenerate.
pub const MAX_WEIGHT_STEPS: usize = 10_001;

/// Inclusive range of first-sub-query weights `[min, max]` walked in steps
/// of `increment`. The second sub-query gets `1 - w`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightsRange {
    pub min: f64,
    pub max: f64,
    pub increment: f64,
}

impl Default for WeightsRange {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 1.0,
            increment: 0.1,
        }
    }
}

impl WeightsRange {
    pub fn new(min: f64, max: f64, increment: f64) -> Self {
        Self { min, max, increment }
    }

    /// Number of grid points (returns 0 for an empty or degenerate range).
    pub fn steps(&self) -> usize {
        let finite = self.min.is_finite() && self.max.is_finite() && self.increment.is_finite();
        if !finite || self.increment <= 0.0 || self.max < self.min {
            return 0;
        }
        // Small epsilon so 1.0 / 0.1 counts as 10 full steps, not 9.999...
        let intervals = ((self.max - self.min) / self.increment + 1e-9).floor();
        if intervals >= MAX_WEIGHT_STEPS as f64 {
            warn!(
                min = self.min,
                max = self.max,
                increment = self.increment,
                "weight range has too many steps, ignoring it"
            );
            return 0;
        }
        intervals as usize + 1
    }

    /// All weight pairs in the range, first sub-query weight ascending.
    pub fn weight_pairs(&self) -> Vec<[f64; 2]> {
        (0..self.steps())
            .map(|i| {
                let w = round_weight(self.min + i as f64 * self.increment);
                [w, round_weight(1.0 - w)]
            })
            .collect()
    }
}

fn round_weight(weight: f64) -> f64 {
    (weight * WEIGHT_PRECISION).round() / WEIGHT_PRECISION
}

/// One concrete hybrid search parameter combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridCombination {
    pub normalization_technique: String,
    pub combination_technique: String,
    pub weights: [f64; 2],
}

/// The option space a hybrid optimizer experiment sweeps over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridSearchOptions {
    pub normalization_techniques: BTreeSet<String>,
    pub combination_techniques: BTreeSet<String>,
    pub weights_range: WeightsRange,
}

impl Default for HybridSearchOptions {
    fn default() -> Self {
        Self::new()
            .add_normalization("min_max")
            .add_normalization("l2")
            .add_combination("arithmetic_mean")
            .add_combination("harmonic_mean")
            .add_combination("geometric_mean")
            .with_weights_range(WeightsRange::default())
    }
}

impl HybridSearchOptions {
    /// Empty option space; add techniques with the builder methods.
    pub fn new() -> Self {
        Self {
            normalization_techniques: BTreeSet::new(),
            combination_techniques: BTreeSet::new(),
            weights_range: WeightsRange::default(),
        }
    }

    pub fn add_normalization(mut self, technique: impl Into<String>) -> Self {
        self.normalization_techniques.insert(technique.into());
        self
    }

    pub fn add_combination(mut self, technique: impl Into<String>) -> Self {
        self.combination_techniques.insert(technique.into());
        self
    }

    pub fn with_weights_range(mut self, range: WeightsRange) -> Self {
        self.weights_range = range;
        self
    }

    /// Size of the sweep without materializing it.
    pub fn combination_count(&self, include_weights: bool) -> usize {
        let weight_axis = if include_weights {
            self.weights_range.steps()
        } else {
            1
        };
        self.normalization_techniques
            .len()
            .saturating_mul(self.combination_techniques.len())
            .saturating_mul(weight_axis)
    }

    /// Cartesian product normalization × combination × weights.
    ///
    /// With `include_weights == false` every combination uses
    /// [`DEFAULT_WEIGHTS`].
    pub fn parameter_combinations(&self, include_weights: bool) -> Vec<HybridCombination> {
        let weight_axis = if include_weights {
            self.weights_range.weight_pairs()
        } else {
            vec![DEFAULT_WEIGHTS]
        };

        let mut result = Vec::with_capacity(self.combination_count(include_weights));
        for normalization in &self.normalization_techniques {
            for combination in &self.combination_techniques {
                for weights in &weight_axis {
                    result.push(HybridCombination {
                        normalization_technique: normalization.clone(),
                        combination_technique: combination.clone(),
                        weights: *weights,
                    });
                }
            }
        }
        result
    }
}
