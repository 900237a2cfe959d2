//! Rank fusion primitives.
//!
//! Two stages run here: collapsing multiple vectors of the same data row
//! into one record (max score wins), and weighted Reciprocal Rank Fusion
//! across ranked lists. Fusion is applied after per-list collapsing so a
//! chunk's several embeddings count as one entrant per list.

use serde_json::json;
use std::collections::HashMap;

use crate::types::{RetrievalResult, RetrievalSource};

fn recorded_vector_count(result: &RetrievalResult) -> u64 {
    result
        .metadata
        .get("vector_count")
        .and_then(|v| v.as_u64())
        .unwrap_or(1)
}

fn recorded_scores(result: &RetrievalResult) -> Vec<f32> {
    result
        .metadata
        .get("all_scores")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_f64())
                .map(|v| v as f32)
                .collect()
        })
        .unwrap_or_else(|| vec![result.score])
}

/// Collapse a ranked list so each data_id appears at most once.
///
/// The survivor keeps the maximum per-vector score and the earliest (best)
/// position among the collapsed entries; its metadata accumulates
/// `vector_count` and the full score vector, so applying the merge twice
/// changes nothing.
pub fn merge_multi_vector(results: Vec<RetrievalResult>) -> Vec<RetrievalResult> {
    let mut merged: Vec<RetrievalResult> = Vec::with_capacity(results.len());
    let mut counts: Vec<u64> = Vec::new();
    let mut scores: Vec<Vec<f32>> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();

    for result in results {
        match position.get(&result.data_id) {
            Some(&i) => {
                counts[i] += recorded_vector_count(&result);
                scores[i].extend(recorded_scores(&result));
                if result.score > merged[i].score {
                    merged[i].score = result.score;
                }
            }
            None => {
                position.insert(result.data_id.clone(), merged.len());
                counts.push(recorded_vector_count(&result));
                scores.push(recorded_scores(&result));
                merged.push(result);
            }
        }
    }

    for (i, entry) in merged.iter_mut().enumerate() {
        entry
            .metadata
            .insert("vector_count".to_string(), json!(counts[i]));
        entry
            .metadata
            .insert("all_scores".to_string(), json!(scores[i]));
    }
    merged
}

/// Weighted Reciprocal Rank Fusion across ranked lists.
///
/// Each record scores `Σ w_i / (k + rank_i)` over the lists it appears in,
/// with 1-based ranks. Output is the union sorted by descending score; ties
/// break by first occurrence across the input lists.
pub fn reciprocal_rank_fusion(
    lists: Vec<(Vec<RetrievalResult>, f32)>,
    k: f32,
) -> Vec<RetrievalResult> {
    struct Fused {
        result: RetrievalResult,
        score: f32,
        first_seen: usize,
    }

    let mut entries: Vec<Fused> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for (list, weight) in lists {
        for (rank0, result) in list.into_iter().enumerate() {
            let contribution = weight / (k + (rank0 + 1) as f32);
            match by_id.get(&result.data_id) {
                Some(&i) => {
                    entries[i].score += contribution;
                    for (key, value) in result.metadata {
                        entries[i].result.metadata.entry(key).or_insert(value);
                    }
                }
                None => {
                    by_id.insert(result.data_id.clone(), entries.len());
                    let first_seen = entries.len();
                    entries.push(Fused {
                        result,
                        score: contribution,
                        first_seen,
                    });
                }
            }
        }
    }

    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.first_seen.cmp(&b.first_seen))
    });

    entries
        .into_iter()
        .map(|mut fused| {
            fused.result.score = fused.score;
            fused.result.source = RetrievalSource::Fused;
            fused
                .result
                .metadata
                .insert("rrf_score".to_string(), json!(fused.score));
            fused.result
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    fn result(data_id: &str, score: f32) -> RetrievalResult {
        RetrievalResult {
            data_id: data_id.into(),
            collection_id: "c1".into(),
            content: format!("text {data_id}"),
            score,
            source: RetrievalSource::Dense,
            metadata: Metadata::new(),
            tokens: 10,
        }
    }

    #[test]
    fn collapse_keeps_max_score_and_earliest_position() {
        // v1->A 0.90, v2->A 0.80, v3->B 0.85
        let merged = merge_multi_vector(vec![
            result("A", 0.90),
            result("A", 0.80),
            result("B", 0.85),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].data_id, "A");
        assert!((merged[0].score - 0.90).abs() < 1e-6);
        assert_eq!(merged[0].metadata["vector_count"], json!(2));
        assert_eq!(merged[0].metadata["all_scores"], json!([0.90f32, 0.80f32]));
        assert_eq!(merged[1].data_id, "B");
        assert_eq!(merged[1].metadata["vector_count"], json!(1));
    }

    #[test]
    fn collapse_is_idempotent() {
        let once = merge_multi_vector(vec![
            result("A", 0.90),
            result("A", 0.80),
            result("B", 0.85),
        ]);
        let twice = merge_multi_vector(once.clone());

        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.data_id, b.data_id);
            assert_eq!(a.score, b.score);
            assert_eq!(a.metadata["vector_count"], b.metadata["vector_count"]);
            assert_eq!(a.metadata["all_scores"], b.metadata["all_scores"]);
        }
    }

    #[test]
    fn rrf_two_list_exact_scores() {
        // dense: A, B, C at ranks 1..3; lexical: B, D, A at ranks 1..3
        let dense = vec![result("A", 0.9), result("B", 0.7), result("C", 0.5)];
        let lexical = vec![result("B", 0.0), result("D", 0.0), result("A", 0.0)];
        let fused = reciprocal_rank_fusion(vec![(dense, 0.6), (lexical, 0.4)], 60.0);

        let ids: Vec<&str> = fused.iter().map(|r| r.data_id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A", "C", "D"]);

        let score_of = |id: &str| fused.iter().find(|r| r.data_id == id).unwrap().score;
        assert!((score_of("B") - (0.6 / 62.0 + 0.4 / 61.0)).abs() < 1e-6);
        assert!((score_of("A") - (0.6 / 61.0 + 0.4 / 63.0)).abs() < 1e-6);
        assert!((score_of("C") - 0.6 / 63.0).abs() < 1e-6);
        assert!((score_of("D") - 0.4 / 62.0).abs() < 1e-6);

        // Output is sorted non-increasing.
        for pair in fused.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn rrf_single_list_rank_r_scores_exactly() {
        let list = vec![result("A", 0.9), result("B", 0.5)];
        let fused = reciprocal_rank_fusion(vec![(list, 1.0)], 60.0);
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-7);
        assert!((fused[1].score - 1.0 / 62.0).abs() < 1e-7);
    }

    #[test]
    fn rrf_ties_break_by_first_occurrence() {
        // Two lists, symmetric weights: X and Y score identically.
        let a = vec![result("X", 0.9)];
        let b = vec![result("Y", 0.9)];
        let fused = reciprocal_rank_fusion(vec![(a, 0.5), (b, 0.5)], 60.0);
        assert_eq!(fused[0].data_id, "X");
        assert_eq!(fused[1].data_id, "Y");
    }

    #[test]
    fn rrf_of_empty_lists_is_empty() {
        let fused = reciprocal_rank_fusion(vec![(Vec::new(), 0.6), (Vec::new(), 0.4)], 60.0);
        assert!(fused.is_empty());
    }
}
