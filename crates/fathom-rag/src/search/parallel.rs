//! Multi-variant fan-out on a bounded worker pool.
//!
//! Every query variant runs the full hybrid retrieval; at most `pool_size`
//! run at once and the rest queue on the semaphore. Each task carries its
//! own deadline. Dropping the returned future aborts outstanding and queued
//! tasks — cancellation is observed at the next suspension point.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::types::{Query, RetrievalResult};

use super::fusion::reciprocal_rank_fusion;
use super::HybridRetriever;

pub struct ParallelRetriever {
    hybrid: Arc<HybridRetriever>,
    pool: Arc<Semaphore>,
    task_deadline: Duration,
    rrf_k: f32,
}

impl ParallelRetriever {
    pub fn new(
        hybrid: Arc<HybridRetriever>,
        pool_size: usize,
        task_deadline: Duration,
        rrf_k: f32,
    ) -> Self {
        Self {
            hybrid,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            task_deadline,
            rrf_k,
        }
    }

    /// Dispatch all query variants, then fuse the surviving lists with equal
    /// weights. A single surviving list is returned unmodified; a task
    /// failure contributes nothing.
    pub async fn retrieve(&self, queries: &[String], base: &Query) -> Vec<RetrievalResult> {
        if queries.is_empty() {
            return Vec::new();
        }

        let mut tasks: JoinSet<Option<(usize, Vec<RetrievalResult>)>> = JoinSet::new();
        for (index, query) in queries.iter().enumerate() {
            let hybrid = self.hybrid.clone();
            let pool = self.pool.clone();
            let query = query.clone();
            let top_k = base.top_k;
            let deadline = self.task_deadline;
            tasks.spawn(async move {
                let _permit = pool.acquire_owned().await.ok()?;
                match tokio::time::timeout(deadline, hybrid.retrieve(&query, top_k)).await {
                    Ok(mut results) => {
                        for result in &mut results {
                            result.metadata.insert("query_index".to_string(), json!(index));
                            result
                                .metadata
                                .insert("query_text".to_string(), json!(query.clone()));
                        }
                        Some((index, results))
                    }
                    Err(_) => {
                        tracing::warn!(query_index = index, "variant retrieval timed out");
                        None
                    }
                }
            });
        }

        let mut lists: Vec<(usize, Vec<RetrievalResult>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some((index, results))) if !results.is_empty() => {
                    lists.push((index, results));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("variant retrieval task failed: {e}"),
            }
        }

        // Completion order is nondeterministic; fuse in dispatch order so
        // tie-breaking by first occurrence stays stable.
        lists.sort_by_key(|(index, _)| *index);

        match lists.len() {
            0 => Vec::new(),
            1 => lists.remove(0).1,
            n => {
                let weight = 1.0 / n as f32;
                reciprocal_rank_fusion(
                    lists.into_iter().map(|(_, results)| (results, weight)).collect(),
                    self.rrf_k,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::search::SearchBackend;
    use crate::types::{Metadata, RetrievalSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SearchBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn search(&self, query: &str, _top_k: usize) -> Result<Vec<RetrievalResult>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(25)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            Ok(vec![RetrievalResult {
                data_id: format!("doc-{}", query.len()),
                collection_id: "c1".into(),
                content: query.to_string(),
                score: 0.5,
                source: RetrievalSource::Dense,
                metadata: Metadata::new(),
                tokens: 1,
            }])
        }
    }

    fn base_query() -> Query {
        Query {
            id: "q".into(),
            question: "q".into(),
            optimized_question: "q".into(),
            expanded_queries: Vec::new(),
            concat_query: "q".into(),
            max_tokens: 4000,
            relevance_threshold: 0.6,
            top_k: 5,
        }
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(CountingBackend {
            active: active.clone(),
            peak: peak.clone(),
        });
        let hybrid = Arc::new(HybridRetriever::new(
            vec![(backend as Arc<dyn SearchBackend>, 1.0)],
            Duration::from_secs(5),
            60.0,
        ));
        let retriever = ParallelRetriever::new(hybrid, 2, Duration::from_secs(5), 60.0);

        let queries: Vec<String> = (0..6).map(|i| format!("variant {i}")).collect();
        let results = retriever.retrieve(&queries, &base_query()).await;

        assert!(!results.is_empty());
        assert!(peak.load(Ordering::SeqCst) <= 2, "pool exceeded its bound");
    }

    #[tokio::test]
    async fn single_survivor_returned_unmodified() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(CountingBackend { active, peak });
        let hybrid = Arc::new(HybridRetriever::new(
            vec![(backend as Arc<dyn SearchBackend>, 1.0)],
            Duration::from_secs(5),
            60.0,
        ));
        let retriever = ParallelRetriever::new(hybrid, 3, Duration::from_secs(5), 60.0);

        let results = retriever
            .retrieve(&["only one".to_string()], &base_query())
            .await;
        assert_eq!(results.len(), 1);
        // Not re-fused: the hybrid layer's RRF score is intact.
        assert!((results[0].score - 1.0 / 61.0).abs() < 1e-7);
    }

    #[tokio::test]
    async fn empty_variant_set_returns_empty() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(CountingBackend { active, peak });
        let hybrid = Arc::new(HybridRetriever::new(
            vec![(backend as Arc<dyn SearchBackend>, 1.0)],
            Duration::from_secs(5),
            60.0,
        ));
        let retriever = ParallelRetriever::new(hybrid, 3, Duration::from_secs(5), 60.0);
        assert!(retriever.retrieve(&[], &base_query()).await.is_empty());
    }
}
