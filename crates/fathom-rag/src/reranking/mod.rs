//! Cross-encoder reranking.
//!
//! `HttpReranker` is the wire client for a BGE-style rerank service;
//! `Reranker` blends its scores with the retrieval score and re-sorts.
//! Rerank failures never fail the pipeline: results degrade to identity
//! records carrying the original retrieval score.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{RagError, Result};
use crate::types::{RerankResult, RetrievalResult};

#[async_trait]
pub trait RerankBackend: Send + Sync {
    /// Score each document's relevance to the query. Returns one score per
    /// document, in input order.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

pub struct HttpReranker {
    client: reqwest::Client,
    api_url: String,
    model: String,
    access_token: Option<String>,
    timeout: Duration,
}

impl HttpReranker {
    pub fn new(
        base_url: &str,
        endpoint: &str,
        model: &str,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::Init(format!("rerank client build failed: {e}")))?;
        Ok(Self {
            client,
            api_url: format!("{}{}", base_url.trim_end_matches('/'), endpoint),
            model: model.to_string(),
            access_token,
            timeout,
        })
    }

    pub async fn health_check(&self) -> bool {
        self.score("health check", &["test document".to_string()])
            .await
            .is_ok()
    }

    /// Pull `(index, score)` pairs out of either response shape:
    /// `{results: [...]}` or `{data: [...]}`, each entry carrying
    /// `relevance_score` or `score`. Missing indices stay at 0.0.
    fn extract_scores(body: &serde_json::Value, len: usize) -> Vec<f32> {
        let mut scores = vec![0.0f32; len];
        let entries = body
            .get("results")
            .or_else(|| body.get("data"))
            .and_then(|v| v.as_array());
        if let Some(entries) = entries {
            for entry in entries {
                let index = entry.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let score = entry
                    .get("relevance_score")
                    .or_else(|| entry.get("score"))
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0) as f32;
                if index < scores.len() {
                    scores[index] = score;
                }
            }
        }
        scores
    }
}

#[async_trait]
impl RerankBackend for HttpReranker {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.client.post(&self.api_url).json(&json!({
            "model": self.model,
            "query": query,
            "documents": documents,
        }));
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RagError::from_http(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RagError::BackendUnavailable(format!(
                "rerank service returned HTTP {status}"
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RagError::MalformedResponse(format!("rerank body: {e}")))?;
        Ok(Self::extract_scores(&body, documents.len()))
    }
}

pub struct Reranker {
    backend: Arc<dyn RerankBackend>,
    score_weight: f32,
    batch_size: usize,
}

impl Reranker {
    pub fn new(backend: Arc<dyn RerankBackend>, score_weight: f32, batch_size: usize) -> Self {
        Self {
            backend,
            score_weight,
            batch_size: batch_size.max(1),
        }
    }

    /// Rerank the fused list. `final = (1 - w) * original + w * rerank`,
    /// sorted descending; ties keep the incoming order.
    pub async fn rerank(&self, query: &str, results: Vec<RetrievalResult>) -> Vec<RerankResult> {
        if results.is_empty() {
            return Vec::new();
        }

        let passages: Vec<String> = results.iter().map(|r| r.content.clone()).collect();
        let scores = match self.score_batched(query, &passages).await {
            Ok(scores) => scores,
            Err(e) => {
                tracing::warn!("rerank failed, falling back to retrieval scores: {e}");
                return Self::identity(results);
            }
        };

        let mut reranked: Vec<RerankResult> = results
            .into_iter()
            .zip(scores)
            .map(|(result, rerank_score)| {
                let final_score =
                    (1.0 - self.score_weight) * result.score + self.score_weight * rerank_score;
                RerankResult {
                    data_id: result.data_id,
                    collection_id: result.collection_id,
                    content: result.content,
                    original_score: result.score,
                    rerank_score,
                    final_score,
                    metadata: result.metadata,
                    tokens: result.tokens,
                }
            })
            .collect();

        reranked.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        reranked
    }

    async fn score_batched(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let mut all_scores = Vec::with_capacity(passages.len());
        for batch in passages.chunks(self.batch_size) {
            let scores = self.backend.score(query, batch).await?;
            if scores.len() != batch.len() {
                return Err(RagError::MalformedResponse(format!(
                    "rerank returned {} scores for {} documents",
                    scores.len(),
                    batch.len()
                )));
            }
            all_scores.extend(scores);
        }
        Ok(all_scores)
    }

    /// Identity conversion used when reranking is disabled or failed.
    pub fn identity(results: Vec<RetrievalResult>) -> Vec<RerankResult> {
        results.into_iter().map(RerankResult::from_retrieval).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, RetrievalSource};

    struct FixedScores(Vec<f32>);

    #[async_trait]
    impl RerankBackend for FixedScores {
        async fn score(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>> {
            Ok(self.0[..documents.len()].to_vec())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl RerankBackend for FailingBackend {
        async fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>> {
            Err(RagError::BackendUnavailable("down".into()))
        }
    }

    fn result(id: &str, score: f32) -> RetrievalResult {
        RetrievalResult {
            data_id: id.into(),
            collection_id: "c1".into(),
            content: format!("content {id}"),
            score,
            source: RetrievalSource::Fused,
            metadata: Metadata::new(),
            tokens: 10,
        }
    }

    #[tokio::test]
    async fn blends_and_resorts() {
        let reranker = Reranker::new(Arc::new(FixedScores(vec![0.1, 0.9])), 0.7, 10);
        let out = reranker
            .rerank("q", vec![result("a", 0.8), result("b", 0.2)])
            .await;
        // a: 0.3*0.8 + 0.7*0.1 = 0.31; b: 0.3*0.2 + 0.7*0.9 = 0.69
        assert_eq!(out[0].data_id, "b");
        assert!((out[0].final_score - 0.69).abs() < 1e-5);
        assert_eq!(out[1].data_id, "a");
        assert!((out[1].final_score - 0.31).abs() < 1e-5);
        assert!((out[0].original_score - 0.2).abs() < 1e-6);
        assert!((out[0].rerank_score - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn backend_failure_degrades_to_identity() {
        let reranker = Reranker::new(Arc::new(FailingBackend), 0.7, 10);
        let out = reranker.rerank("q", vec![result("a", 0.8)]).await;
        assert_eq!(out.len(), 1);
        assert!((out[0].final_score - 0.8).abs() < 1e-6);
        assert!((out[0].rerank_score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn extracts_both_response_shapes() {
        let results_shape = serde_json::json!({
            "results": [
                {"index": 1, "relevance_score": 0.7},
                {"index": 0, "score": 0.4},
            ]
        });
        assert_eq!(HttpReranker::extract_scores(&results_shape, 3), vec![0.4, 0.7, 0.0]);

        let data_shape = serde_json::json!({
            "data": [ {"index": 0, "score": 0.9} ]
        });
        assert_eq!(HttpReranker::extract_scores(&data_shape, 2), vec![0.9, 0.0]);
    }
}
