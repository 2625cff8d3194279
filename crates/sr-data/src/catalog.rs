use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sr_types::{Ratings, RatingsProvider, StoreError};

/// One rated document in a judgment list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocRating {
    pub doc_id: String,
    pub rating: f64,
}

/// Ratings collected for a single query text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryJudgment {
    pub query_text: String,
    pub ratings: Vec<DocRating>,
}

/// A named judgment list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentSet {
    pub id: String,
    pub name: String,
    pub judgments: Vec<QueryJudgment>,
}

impl JudgmentSet {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            judgments: Vec::new(),
        }
    }

    pub fn with_query(mut self, query_text: &str, ratings: &[(&str, f64)]) -> Self {
        self.judgments.push(QueryJudgment {
            query_text: query_text.to_string(),
            ratings: ratings
                .iter()
                .map(|(doc_id, rating)| DocRating {
                    doc_id: doc_id.to_string(),
                    rating: *rating,
                })
                .collect(),
        });
        self
    }

    /// Ratings of the first judgment entry matching `query_text`.
    pub fn ratings_for(&self, query_text: &str) -> Option<&[DocRating]> {
        self.judgments
            .iter()
            .find(|judgment| judgment.query_text == query_text)
            .map(|judgment| judgment.ratings.as_slice())
    }
}

/// Catalog of judgment lists, resolving ratings per query text
#[derive(Debug, Default)]
pub struct JudgmentCatalog {
    sets: DashMap<String, JudgmentSet>,
}

impl JudgmentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, set: JudgmentSet) {
        debug!(judgment_id = %set.id, queries = set.judgments.len(), "registered judgment set");
        self.sets.insert(set.id.clone(), set);
    }

    pub fn contains(&self, judgment_id: &str) -> bool {
        self.sets.contains_key(judgment_id)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Merges ratings for `query_text` across the listed judgment sets.
    ///
    /// Later sets override earlier ones for the same document. Unknown
    /// judgment ids are skipped.
    pub fn merged_ratings(&self, query_text: &str, judgment_ids: &[String]) -> Ratings {
        let mut merged: HashMap<String, f64> = HashMap::new();

        for judgment_id in judgment_ids {
            let Some(set) = self.sets.get(judgment_id) else {
                warn!(judgment_id = %judgment_id, "unknown judgment list, skipping");
                continue;
            };
            if let Some(ratings) = set.ratings_for(query_text) {
                for rating in ratings {
                    merged.insert(rating.doc_id.clone(), rating.rating);
                }
            }
        }

        if merged.is_empty() {
            warn!(query_text = %query_text, judgments = judgment_ids.len(), "no ratings found for query");
        }
        merged
    }
}

#[async_trait]
impl RatingsProvider for JudgmentCatalog {
    async fn ratings_for(&self, query_text: &str, judgment_ids: &[String]) -> Result<Ratings, StoreError> {
        Ok(self.merged_ratings(query_text, judgment_ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> JudgmentCatalog {
        let catalog = JudgmentCatalog::new();
        catalog.register(
            JudgmentSet::new("j1")
                .with_query("red shoes", &[("d1", 3.0), ("d2", 1.0)])
                .with_query("red shoes", &[("d9", 2.0)])
                .with_query("boots", &[("d5", 2.0)]),
        );
        catalog.register(JudgmentSet::new("j2").with_query("red shoes", &[("d2", 2.0), ("d3", 1.0)]));
        catalog
    }

    #[test]
    fn first_matching_query_entry_wins_within_a_set() {
        let ratings = catalog().merged_ratings("red shoes", &["j1".to_string()]);
        assert_eq!(ratings.len(), 2);
        assert!(!ratings.contains_key("d9"));
    }

    #[test]
    fn ratings_merge_across_sets() {
        let ratings = catalog().merged_ratings("red shoes", &["j1".to_string(), "j2".to_string()]);
        assert_eq!(ratings.len(), 3);
        assert_eq!(ratings["d2"], 2.0);
        assert_eq!(ratings["d1"], 3.0);
    }

    #[tokio::test]
    async fn unknown_judgment_and_query_yield_empty_ratings() {
        let catalog = catalog();
        let ratings = catalog
            .ratings_for("red shoes", &["missing".to_string()])
            .await
            .unwrap();
        assert!(ratings.is_empty());

        let ratings = catalog
            .ratings_for("sandals", &["j1".to_string()])
            .await
            .unwrap();
        assert!(ratings.is_empty());
    }
}
