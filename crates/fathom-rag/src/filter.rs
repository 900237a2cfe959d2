//! Relevance, token-budget, and diversity filtering of reranked results.
//!
//! Three gates run in sequence: a score threshold (with a top-m floor so an
//! answer always has material), a cumulative token budget, and an optional
//! diversity pass that caps each source collection at two records. Output
//! preserves the incoming relative order.

use std::collections::HashMap;
use std::sync::Arc;

use crate::tokens::TokenCounter;
use crate::types::RerankResult;

#[derive(Debug, Clone)]
pub struct FilterParams {
    pub max_tokens: usize,
    pub relevance_threshold: f32,
    pub min_results: usize,
    pub preserve_diversity: bool,
}

pub struct ResultFilter {
    counter: Arc<TokenCounter>,
}

impl ResultFilter {
    pub fn new(counter: Arc<TokenCounter>) -> Self {
        Self { counter }
    }

    pub fn filter(&self, results: Vec<RerankResult>, params: &FilterParams) -> Vec<RerankResult> {
        if results.is_empty() {
            return results;
        }

        let mut results = results;
        for result in &mut results {
            if result.tokens == 0 {
                result.tokens = self.counter.count(&result.content);
            }
        }

        let total = results.len();
        let gated = relevance_gate(results, params.relevance_threshold, params.min_results);
        let budgeted = token_gate(gated, params.max_tokens, params.min_results);

        let filtered = if params.preserve_diversity && budgeted.len() > params.min_results {
            diversity_pass(budgeted, params.max_tokens)
        } else {
            budgeted
        };

        tracing::debug!(input = total, output = filtered.len(), "result filtering complete");
        filtered
    }
}

/// Keep records at or above the threshold; if fewer than `min_results`
/// survive, fall back to the top of the original (score-ordered) list.
fn relevance_gate(
    results: Vec<RerankResult>,
    threshold: f32,
    min_results: usize,
) -> Vec<RerankResult> {
    let survivors: Vec<RerankResult> = results
        .iter()
        .filter(|r| r.final_score >= threshold)
        .cloned()
        .collect();
    if survivors.len() < min_results {
        let mut fallback = results;
        fallback.truncate(min_results);
        return fallback;
    }
    survivors
}

/// Accumulate records while the token sum stays within budget. Records past
/// the budget are force-included only to satisfy `min_results`.
fn token_gate(results: Vec<RerankResult>, max_tokens: usize, min_results: usize) -> Vec<RerankResult> {
    let mut included = Vec::new();
    let mut total_tokens = 0usize;

    for result in results {
        if total_tokens + result.tokens <= max_tokens {
            total_tokens += result.tokens;
            included.push(result);
        } else if included.len() < min_results {
            tracing::warn!("token budget exceeded to satisfy minimum result count");
            total_tokens += result.tokens;
            included.push(result);
        } else {
            break;
        }
    }
    included
}

/// Two admission passes: first one record per collection, then a second
/// round allowing each collection up to two records, all within the token
/// budget. Original relative order is preserved in the output.
fn diversity_pass(results: Vec<RerankResult>, max_tokens: usize) -> Vec<RerankResult> {
    let mut per_collection: HashMap<String, usize> = HashMap::new();
    let mut admitted = vec![false; results.len()];
    let mut total_tokens = 0usize;

    for (i, result) in results.iter().enumerate() {
        if per_collection.contains_key(&result.collection_id) {
            continue;
        }
        if total_tokens + result.tokens > max_tokens {
            break;
        }
        admitted[i] = true;
        per_collection.insert(result.collection_id.clone(), 1);
        total_tokens += result.tokens;
    }

    if total_tokens < max_tokens {
        for (i, result) in results.iter().enumerate() {
            if admitted[i] {
                continue;
            }
            let count = per_collection.get(&result.collection_id).copied().unwrap_or(0);
            if count < 2 && total_tokens + result.tokens <= max_tokens {
                admitted[i] = true;
                per_collection.insert(result.collection_id.clone(), count + 1);
                total_tokens += result.tokens;
            }
        }
    }

    results
        .into_iter()
        .zip(admitted)
        .filter_map(|(result, keep)| keep.then_some(result))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    fn record(id: &str, collection: &str, score: f32, tokens: usize) -> RerankResult {
        RerankResult {
            data_id: id.into(),
            collection_id: collection.into(),
            content: format!("content {id}"),
            original_score: score,
            rerank_score: score,
            final_score: score,
            metadata: Metadata::new(),
            tokens,
        }
    }

    fn params(max_tokens: usize, threshold: f32, diversity: bool) -> FilterParams {
        FilterParams {
            max_tokens,
            relevance_threshold: threshold,
            min_results: 1,
            preserve_diversity: diversity,
        }
    }

    fn filter() -> ResultFilter {
        ResultFilter::new(Arc::new(TokenCounter::new()))
    }

    #[test]
    fn token_budget_cuts_at_limit() {
        let results = vec![
            record("a", "x", 0.9, 1500),
            record("b", "y", 0.8, 1800),
            record("c", "z", 0.7, 1200),
        ];
        let out = filter().filter(results, &params(4000, 0.0, false));
        let ids: Vec<&str> = out.iter().map(|r| r.data_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(out.iter().map(|r| r.tokens).sum::<usize>() <= 4000);
    }

    #[test]
    fn oversized_records_keep_only_first() {
        let results = vec![
            record("a", "x", 0.9, 3000),
            record("b", "y", 0.8, 3000),
            record("c", "z", 0.7, 3000),
        ];
        let out = filter().filter(results, &params(4000, 0.0, false));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data_id, "a");
    }

    #[test]
    fn below_threshold_record_survives_via_min_results() {
        let results = vec![record("a", "x", 0.2, 100)];
        let out = filter().filter(results, &params(4000, 0.6, false));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data_id, "a");
    }

    #[test]
    fn relevance_gate_drops_low_scores_when_enough_survive() {
        let results = vec![
            record("a", "x", 0.9, 100),
            record("b", "y", 0.3, 100),
            record("c", "z", 0.7, 100),
        ];
        let out = filter().filter(results, &params(4000, 0.6, false));
        let ids: Vec<&str> = out.iter().map(|r| r.data_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn diversity_caps_collections_at_two_and_keeps_order() {
        // Collections X,X,Y,X,Z with 100 tokens each under a 1000 budget:
        // pass one admits the first X, Y, and Z; pass two admits the second
        // X; the third X stays out.
        let results = vec![
            record("r0", "x", 0.9, 100),
            record("r1", "x", 0.8, 100),
            record("r2", "y", 0.7, 100),
            record("r3", "x", 0.6, 100),
            record("r4", "z", 0.5, 100),
        ];
        let out = filter().filter(results, &params(1000, 0.0, true));
        let ids: Vec<&str> = out.iter().map(|r| r.data_id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1", "r2", "r4"]);

        let mut per_collection: HashMap<&str, usize> = HashMap::new();
        for r in &out {
            *per_collection.entry(r.collection_id.as_str()).or_default() += 1;
        }
        assert!(per_collection.values().all(|&n| n <= 2));
        // Every collection in the input appears at least once.
        for collection in ["x", "y", "z"] {
            assert!(per_collection.contains_key(collection));
        }
    }

    #[test]
    fn diversity_respects_token_budget() {
        let results = vec![
            record("r0", "x", 0.9, 400),
            record("r1", "y", 0.8, 400),
            record("r2", "z", 0.7, 400),
        ];
        let out = filter().filter(results, &params(800, 0.0, true));
        let ids: Vec<&str> = out.iter().map(|r| r.data_id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1"]);
    }

    #[test]
    fn zero_token_records_are_counted() {
        let results = vec![record("a", "x", 0.9, 0)];
        let out = filter().filter(results, &params(4000, 0.0, false));
        assert!(out[0].tokens > 0);
    }

    #[test]
    fn empty_input_passes_through() {
        let out = filter().filter(Vec::new(), &params(4000, 0.6, true));
        assert!(out.is_empty());
    }
}
