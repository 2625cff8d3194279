//! # sr-optimizer
//!
//! Hybrid search option sweeps for search relevance experiments.
//!
//! Provides the normalization/combination/weights option space, the
//! factories that expand it into experiment variants, and the temporary
//! search pipeline each variant's request is sent with.

mod factory;
mod options;
mod pipeline;

pub use factory::{HybridVariantFactory, VariantFactory};
pub use options::{
    HybridCombination, HybridSearchOptions, WeightsRange, DEFAULT_WEIGHTS, MAX_WEIGHT_STEPS,
};
pub use pipeline::{
    build_hybrid_request, build_search_request, temporary_search_pipeline, validate_hybrid_query,
    HYBRID_SUBQUERY_COUNT,
};
