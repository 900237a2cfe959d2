//! Dense embedding client.
//!
//! Talks to an Ollama-compatible embedding service; the vector dimension is
//! discovered at connect time with a probe call and stays fixed for the
//! process lifetime. Recently embedded texts are cached so repeated query
//! variants do not re-hit the backend.

use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use crate::error::{RagError, Result};

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dimension(&self) -> usize;
}

pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
    dimension: usize,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Option<Vec<f32>>,
}

impl OllamaEmbedder {
    /// Connect and probe the service once to discover the vector dimension.
    pub async fn connect(
        base_url: &str,
        model: &str,
        timeout: Duration,
        cache_size: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::Init(format!("embedding client build failed: {e}")))?;

        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        let mut embedder = Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
            dimension: 0,
            cache: Mutex::new(LruCache::new(capacity)),
        };

        let probe = embedder
            .fetch("test")
            .await
            .map_err(|e| RagError::Init(format!("embedding service probe failed: {e}")))?;
        if probe.is_empty() {
            return Err(RagError::Init(
                "embedding service probe returned an empty vector".into(),
            ));
        }
        embedder.dimension = probe.len();
        tracing::info!(
            model = %embedder.model,
            dimension = embedder.dimension,
            "embedding service connected"
        );
        Ok(embedder)
    }

    async fn fetch(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|e| RagError::from_http(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RagError::BackendUnavailable(format!(
                "embedding service returned HTTP {status}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::MalformedResponse(format!("embedding body: {e}")))?;

        parsed.embedding.ok_or_else(|| {
            RagError::MalformedResponse("embedding response missing `embedding` field".into())
        })
    }

    pub async fn health_check(&self) -> bool {
        self.fetch("health check").await.is_ok()
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.cache.lock().get(text) {
            return Ok(cached.clone());
        }

        let vector = self.fetch(text).await?;
        if vector.len() != self.dimension {
            return Err(RagError::MalformedResponse(format!(
                "embedding dimension drift: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        self.cache.lock().put(text.to_string(), vector.clone());
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
