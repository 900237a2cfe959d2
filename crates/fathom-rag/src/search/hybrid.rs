//! Hybrid retrieval: fan out one query to every backend concurrently,
//! collapse multi-vector duplicates per list, then fuse with weighted RRF.
//!
//! A failed or timed-out backend is absorbed — the surviving weights are
//! renormalized to sum to 1.0 and retrieval proceeds. Only when every
//! backend fails does the query come back empty.

use std::sync::Arc;
use std::time::Duration;

use crate::types::RetrievalResult;

use super::fusion::{merge_multi_vector, reciprocal_rank_fusion};
use super::SearchBackend;

pub struct HybridRetriever {
    backends: Vec<(Arc<dyn SearchBackend>, f32)>,
    deadline: Duration,
    rrf_k: f32,
}

impl HybridRetriever {
    pub fn new(backends: Vec<(Arc<dyn SearchBackend>, f32)>, deadline: Duration, rrf_k: f32) -> Self {
        Self {
            backends,
            deadline,
            rrf_k,
        }
    }

    pub async fn retrieve(&self, query: &str, top_k: usize) -> Vec<RetrievalResult> {
        let tasks = self.backends.iter().map(|(backend, weight)| {
            let backend = backend.clone();
            let weight = *weight;
            async move {
                match tokio::time::timeout(self.deadline, backend.search(query, top_k)).await {
                    Ok(Ok(results)) => Some((results, weight)),
                    Ok(Err(e)) => {
                        tracing::warn!(backend = backend.name(), "backend failed: {e}");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(
                            backend = backend.name(),
                            timeout_secs = self.deadline.as_secs(),
                            "backend timed out"
                        );
                        None
                    }
                }
            }
        });

        let settled = futures::future::join_all(tasks).await;
        let mut lists: Vec<(Vec<RetrievalResult>, f32)> = settled.into_iter().flatten().collect();
        if lists.is_empty() {
            return Vec::new();
        }

        let total_weight: f32 = lists.iter().map(|(_, w)| w).sum();
        if total_weight > 0.0 {
            for entry in &mut lists {
                entry.1 /= total_weight;
            }
        }

        let collapsed = lists
            .into_iter()
            .map(|(results, weight)| (merge_multi_vector(results), weight))
            .collect();
        reciprocal_rank_fusion(collapsed, self.rrf_k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RagError, Result};
    use crate::types::{Metadata, RetrievalSource};
    use async_trait::async_trait;

    struct FixedBackend {
        name: &'static str,
        results: Vec<(&'static str, f32)>,
    }

    #[async_trait]
    impl SearchBackend for FixedBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<RetrievalResult>> {
            Ok(self
                .results
                .iter()
                .map(|(id, score)| RetrievalResult {
                    data_id: id.to_string(),
                    collection_id: "c1".into(),
                    content: id.to_string(),
                    score: *score,
                    source: RetrievalSource::Dense,
                    metadata: Metadata::new(),
                    tokens: 1,
                })
                .collect())
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl SearchBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<RetrievalResult>> {
            Err(RagError::BackendUnavailable("down".into()))
        }
    }

    fn fixed(name: &'static str, results: Vec<(&'static str, f32)>) -> Arc<dyn SearchBackend> {
        Arc::new(FixedBackend { name, results })
    }

    #[tokio::test]
    async fn fuses_two_backends() {
        let retriever = HybridRetriever::new(
            vec![
                (fixed("dense", vec![("A", 0.9), ("B", 0.7)]), 0.6),
                (fixed("lexical", vec![("B", 3.0), ("C", 2.0)]), 0.4),
            ],
            Duration::from_secs(30),
            60.0,
        );

        let fused = retriever.retrieve("q", 10).await;
        let ids: Vec<&str> = fused.iter().map(|r| r.data_id.as_str()).collect();
        // B: 0.6/62 + 0.4/61 beats A: 0.6/61.
        assert_eq!(ids, vec!["B", "A", "C"]);
    }

    #[tokio::test]
    async fn failed_branch_renormalizes_survivor() {
        let retriever = HybridRetriever::new(
            vec![
                (fixed("dense", vec![("A", 0.9)]), 0.6),
                (Arc::new(BrokenBackend), 0.4),
            ],
            Duration::from_secs(30),
            60.0,
        );

        let fused = retriever.retrieve("q", 10).await;
        assert_eq!(fused.len(), 1);
        // Surviving weight renormalized to 1.0: score is exactly 1/(60+1).
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-7);
    }

    #[tokio::test]
    async fn all_branches_failing_returns_empty() {
        let retriever = HybridRetriever::new(
            vec![
                (Arc::new(BrokenBackend) as Arc<dyn SearchBackend>, 0.6),
                (Arc::new(BrokenBackend), 0.4),
            ],
            Duration::from_secs(30),
            60.0,
        );
        assert!(retriever.retrieve("q", 10).await.is_empty());
    }
}
