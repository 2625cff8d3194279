//! Temporary search pipelines and hybrid request building.

use serde_json::{json, Map, Value};
use tracing::debug;

use sr_types::{
    ExperimentVariant, SearchError, SearchRequest, PARAM_COMBINATION_TECHNIQUE,
    PARAM_NORMALIZATION_TECHNIQUE, PARAM_WEIGHTS_FOR_COMBINATION, QUERY_TEXT_PLACEHOLDER,
};

/// A hybrid query combines exactly this many sub-queries.
pub const HYBRID_SUBQUERY_COUNT: usize = 2;

const QUERY_FIELD: &str = "query";
const SEARCH_PIPELINE_FIELD: &str = "search_pipeline";

/// Definition of the per-request pipeline that applies a variant's
/// normalization and combination.
pub fn temporary_search_pipeline(variant: &ExperimentVariant) -> Value {
    let parameter = |name: &str| variant.parameters.get(name).cloned().unwrap_or(Value::Null);

    let mut combination = Map::new();
    combination.insert(
        "technique".to_string(),
        parameter(PARAM_COMBINATION_TECHNIQUE),
    );
    if let Some(weights) = variant.weights() {
        combination.insert("parameters".to_string(), json!({ "weights": weights }));
    }

    json!({
        "phase_results_processors": [{
            "normalization-processor": {
                "normalization": { "technique": parameter(PARAM_NORMALIZATION_TECHNIQUE) },
                "combination": Value::Object(combination),
            }
        }]
    })
}

/// Checks that a parsed query body is a hybrid query with two sub-queries.
pub fn validate_hybrid_query(body: &Value) -> Result<(), SearchError> {
    let query = body
        .get(QUERY_FIELD)
        .filter(|q| q.is_object())
        .ok_or_else(|| invalid("search configuration must have at least one query"))?;
    let hybrid = query
        .get("hybrid")
        .filter(|h| h.is_object())
        .ok_or_else(|| invalid("query in search configuration must be of type hybrid"))?;
    let queries = hybrid
        .get("queries")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("hybrid query in search configuration does not have sub-queries"))?;

    if queries.len() != HYBRID_SUBQUERY_COUNT {
        return Err(invalid(format!(
            "invalid hybrid query: expected exactly [{}] sub-queries but found [{}]",
            HYBRID_SUBQUERY_COUNT,
            queries.len()
        )));
    }
    Ok(())
}

/// Builds a search request from a search configuration's query template.
///
/// Every `%SearchText%` placeholder is replaced with the JSON-escaped query
/// text. A template that embeds its own `search_pipeline` is rejected; the
/// only pipeline a request carries is the one passed in.
pub fn build_search_request(
    index: &str,
    query_template: &str,
    pipeline: Option<Value>,
    query_text: &str,
    size: usize,
) -> Result<SearchRequest, SearchError> {
    let escaped = serde_json::to_string(query_text)
        .map_err(|e| invalid(format!("query text cannot be encoded: {e}")))?;
    // to_string wraps the text in quotes; the placeholder already sits inside a string literal
    let escaped = &escaped[1..escaped.len() - 1];
    let processed = query_template.replace(QUERY_TEXT_PLACEHOLDER, escaped);

    let source: Value = serde_json::from_str(&processed)
        .map_err(|e| invalid(format!("query is not valid JSON: {e}")))?;

    if source
        .get(SEARCH_PIPELINE_FIELD)
        .is_some_and(|p| !p.is_null() && p.as_object().map_or(true, |o| !o.is_empty()))
    {
        return Err(invalid("search pipeline is not allowed in search request"));
    }

    if let Some(declared) = source.get("size").and_then(Value::as_u64) {
        if declared as usize != size {
            debug!(declared, size, "query size differs from requested size, using requested size");
        }
    }

    Ok(SearchRequest {
        index: index.to_string(),
        source,
        pipeline,
        query_text: query_text.to_string(),
        size,
    })
}

/// Builds the search request for one hybrid variant: a validated hybrid
/// query sent with the variant's temporary pipeline.
pub fn build_hybrid_request(
    index: &str,
    query_template: &str,
    pipeline: Value,
    query_text: &str,
    size: usize,
) -> Result<SearchRequest, SearchError> {
    let request = build_search_request(index, query_template, Some(pipeline), query_text, size)?;
    validate_hybrid_query(&request.source)?;
    Ok(request)
}

fn invalid(message: impl Into<String>) -> SearchError {
    SearchError::InvalidQuery {
        message: message.into(),
    }
}
