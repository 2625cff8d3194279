use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use sr_types::{SearchError, SearchExecutor, SearchHit, SearchRequest, SearchResponse};

/// Floor applied to min-max normalized scores so the lowest match still counts
const MIN_NORMALIZED_SCORE: f64 = 0.001;

/// A document in a fixture index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureDocument {
    pub id: String,
    pub text: String,
    /// Score the neural sub-query gives this document, independent of the query text
    pub semantic_score: f64,
}

impl FixtureDocument {
    pub fn new(id: &str, text: &str, semantic_score: f64) -> Self {
        Self {
            id: id.to_string(),
            text: text.to_string(),
            semantic_score,
        }
    }

    /// Number of query terms found in the document text
    fn lexical_score(&self, query_text: &str) -> f64 {
        let text = self.text.to_lowercase();
        let terms: Vec<&str> = text.split_whitespace().collect();
        query_text
            .to_lowercase()
            .split_whitespace()
            .filter(|term| terms.contains(term))
            .count() as f64
    }
}

type RequestMatcher = Arc<dyn Fn(&SearchRequest) -> bool + Send + Sync>;
type ErrorFactory = Arc<dyn Fn() -> SearchError + Send + Sync>;

/// What a scripted request does instead of searching
#[derive(Clone)]
pub enum ScriptedFailure {
    Error(ErrorFactory),
    Panic(String),
    NoHits,
}

impl ScriptedFailure {
    pub fn error(factory: impl Fn() -> SearchError + Send + Sync + 'static) -> Self {
        Self::Error(Arc::new(factory))
    }
}

impl std::fmt::Debug for ScriptedFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(_) => f.write_str("Error(..)"),
            Self::Panic(message) => write!(f, "Panic({message:?})"),
            Self::NoHits => f.write_str("NoHits"),
        }
    }
}

/// Hybrid scoring parameters read from a temporary search pipeline
#[derive(Debug, Clone, PartialEq)]
struct HybridScoring {
    normalization: String,
    combination: String,
    weights: [f64; 2],
}

impl HybridScoring {
    fn from_pipeline(pipeline: Option<&Value>) -> Self {
        let processor = pipeline
            .and_then(|p| p.get("phase_results_processors"))
            .and_then(|p| p.get(0))
            .and_then(|p| p.get("normalization-processor"));

        let technique = |section: &str, default: &str| {
            processor
                .and_then(|p| p.get(section))
                .and_then(|s| s.get("technique"))
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };

        let weights = processor
            .and_then(|p| p.pointer("/combination/parameters/weights"))
            .and_then(Value::as_array)
            .and_then(|w| Some([w.first()?.as_f64()?, w.get(1)?.as_f64()?]))
            .unwrap_or([0.5, 0.5]);

        Self {
            normalization: technique("normalization", "min_max"),
            combination: technique("combination", "arithmetic_mean"),
            weights,
        }
    }

    fn normalize(&self, scores: &[f64]) -> Vec<f64> {
        match self.normalization.as_str() {
            "l2" => {
                let norm = scores.iter().map(|s| s * s).sum::<f64>().sqrt();
                scores
                    .iter()
                    .map(|s| if norm > 0.0 { s / norm } else { 0.0 })
                    .collect()
            }
            _ => {
                let matched = scores.iter().copied().filter(|s| *s > 0.0);
                let min = matched.clone().fold(f64::INFINITY, f64::min);
                let max = matched.fold(f64::NEG_INFINITY, f64::max);
                scores
                    .iter()
                    .map(|s| {
                        if *s <= 0.0 {
                            0.0
                        } else if max > min {
                            ((s - min) / (max - min)).max(MIN_NORMALIZED_SCORE)
                        } else {
                            1.0
                        }
                    })
                    .collect()
            }
        }
    }

    /// Combines the normalized sub-query scores of one document. Sub-queries
    /// that did not match the document are left out.
    fn combine(&self, scores: [f64; 2]) -> f64 {
        let matched: Vec<(f64, f64)> = scores
            .iter()
            .zip(self.weights.iter())
            .filter(|(score, _)| **score > 0.0)
            .map(|(score, weight)| (*score, *weight))
            .collect();
        let weight_sum: f64 = matched.iter().map(|(_, w)| w).sum();
        if matched.is_empty() || weight_sum <= 0.0 {
            return 0.0;
        }

        match self.combination.as_str() {
            "harmonic_mean" => weight_sum / matched.iter().map(|(s, w)| w / s).sum::<f64>(),
            "geometric_mean" => {
                (matched.iter().map(|(s, w)| w * s.ln()).sum::<f64>() / weight_sum).exp()
            }
            _ => matched.iter().map(|(s, w)| w * s).sum::<f64>() / weight_sum,
        }
    }
}

/// Deterministic search executor over in-memory indices.
///
/// Each document gets a lexical score (query term overlap) and a semantic
/// score; the two are normalized and combined the way the request's
/// temporary pipeline asks for.
#[derive(Default)]
pub struct FixtureSearchExecutor {
    indices: DashMap<String, Vec<FixtureDocument>>,
    scripts: RwLock<Vec<(RequestMatcher, ScriptedFailure)>>,
    latency: RwLock<Option<Duration>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FixtureSearchExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(self, index: &str, documents: Vec<FixtureDocument>) -> Self {
        self.indices.insert(index.to_string(), documents);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.write() = Some(latency);
        self
    }

    /// Scripts every request matching `matcher` to fail in the given way.
    /// The first matching script wins.
    pub fn fail_when(
        &self,
        matcher: impl Fn(&SearchRequest) -> bool + Send + Sync + 'static,
        failure: ScriptedFailure,
    ) {
        self.scripts.write().push((Arc::new(matcher), failure));
    }

    pub fn fail_index(&self, index: &str, failure: ScriptedFailure) {
        let index = index.to_string();
        self.fail_when(move |request| request.index == index, failure);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most requests ever executing at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn scripted(&self, request: &SearchRequest) -> Option<ScriptedFailure> {
        self.scripts
            .read()
            .iter()
            .find(|(matcher, _)| matcher(request))
            .map(|(_, failure)| failure.clone())
    }

    fn rank(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let documents = self
            .indices
            .get(&request.index)
            .ok_or_else(|| SearchError::IndexNotFound {
                index: request.index.clone(),
            })?;

        let scoring = HybridScoring::from_pipeline(request.pipeline.as_ref());
        let lexical: Vec<f64> = documents
            .iter()
            .map(|doc| doc.lexical_score(&request.query_text))
            .collect();
        let semantic: Vec<f64> = documents.iter().map(|doc| doc.semantic_score.max(0.0)).collect();
        let lexical = scoring.normalize(&lexical);
        let semantic = scoring.normalize(&semantic);

        let mut hits: Vec<SearchHit> = documents
            .iter()
            .enumerate()
            .map(|(i, doc)| SearchHit {
                id: doc.id.clone(),
                score: scoring.combine([lexical[i], semantic[i]]),
            })
            .filter(|hit| hit.score > 0.0)
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(request.size);

        trace!(index = %request.index, hits = hits.len(), ?scoring, "ranked fixture documents");
        Ok(SearchResponse::from_hits(hits))
    }

    async fn run(&self, request: SearchRequest) -> Result<SearchResponse, SearchError> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match self.scripted(&request) {
            Some(ScriptedFailure::Error(factory)) => {
                debug!(index = %request.index, "scripted search failure");
                Err(factory())
            }
            Some(ScriptedFailure::Panic(message)) => panic!("{message}"),
            Some(ScriptedFailure::NoHits) => Ok(SearchResponse::default()),
            None => self.rank(&request),
        }
    }
}

#[async_trait]
impl SearchExecutor for FixtureSearchExecutor {
    async fn execute(&self, request: SearchRequest) -> Result<SearchResponse, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let _guard = InFlightGuard(&self.in_flight);
        self.run(request).await
    }
}

/// Decrements the in-flight count even if the search panics
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Small product corpus used by the demo binary and tests
pub fn sample_corpus() -> HashMap<String, Vec<FixtureDocument>> {
    let mut indices = HashMap::new();
    indices.insert(
        "products".to_string(),
        vec![
            FixtureDocument::new("p1", "red running shoes", 0.62),
            FixtureDocument::new("p2", "blue running shoes", 0.48),
            FixtureDocument::new("p3", "red leather boots", 0.91),
            FixtureDocument::new("p4", "trail shoes waterproof", 0.77),
            FixtureDocument::new("p5", "red wool socks", 0.15),
            FixtureDocument::new("p6", "hiking boots waterproof", 0.83),
        ],
    );
    indices.insert(
        "products-v2".to_string(),
        vec![
            FixtureDocument::new("p1", "red running shoes lightweight", 0.70),
            FixtureDocument::new("p3", "red leather boots", 0.88),
            FixtureDocument::new("p4", "trail running shoes waterproof", 0.81),
            FixtureDocument::new("p6", "hiking boots waterproof", 0.79),
            FixtureDocument::new("p7", "red canvas sneakers", 0.55),
        ],
    );
    indices
}
