//! Dense retrieval: embed the query, ANN-search the vector store, then
//! resolve the owning data rows from the metadata store.
//!
//! A data row surfaced by several of its vectors appears once per vector at
//! this stage; collapsing is the fusion layer's job.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::embeddings::Embedder;
use crate::error::Result;
use crate::storage::{LanceVectorStore, MetadataStore};
use crate::types::{RetrievalResult, RetrievalSource};

use super::SearchBackend;

pub struct DenseRetriever {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<LanceVectorStore>,
    meta: Arc<MetadataStore>,
}

impl DenseRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<LanceVectorStore>,
        meta: Arc<MetadataStore>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            meta,
        }
    }
}

#[async_trait]
impl SearchBackend for DenseRetriever {
    fn name(&self) -> &'static str {
        "dense"
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResult>> {
        let query_vector = self.embedder.embed(query).await?;
        let hits = self.vectors.search(&query_vector, top_k).await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut distinct: Vec<String> = Vec::new();
        for hit in &hits {
            if !distinct.contains(&hit.data_id) {
                distinct.push(hit.data_id.clone());
            }
        }
        let rows = self.meta.get_data_by_ids(&distinct)?;
        let by_id: HashMap<&str, &crate::types::Data> =
            rows.iter().map(|d| (d.id.as_str(), d)).collect();

        let mut results = Vec::with_capacity(hits.len());
        for hit in &hits {
            let Some(data) = by_id.get(hit.data_id.as_str()) else {
                tracing::warn!(
                    vector_id = %hit.vector_id,
                    data_id = %hit.data_id,
                    "dangling vector: no matching data row"
                );
                continue;
            };
            let mut metadata = data.metadata.clone();
            metadata.insert("vector_id".to_string(), json!(hit.vector_id));
            metadata.insert("chunk_index".to_string(), json!(hit.chunk_index));
            if let Some(title) = &data.title {
                metadata.insert("title".to_string(), json!(title));
            }
            results.push(RetrievalResult {
                data_id: data.id.clone(),
                collection_id: data.collection_id.clone(),
                content: data.content.clone(),
                score: hit.score,
                source: RetrievalSource::Dense,
                metadata,
                tokens: data.tokens,
            });
        }
        tracing::debug!(count = results.len(), "dense search complete");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RagError;
    use crate::types::{EmbeddingVector, Metadata};
    use chrono::Utc;

    /// Deterministic embedder: maps known phrases onto fixed unit vectors.
    pub struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> crate::error::Result<Vec<f32>> {
            if text.contains("fail") {
                return Err(RagError::BackendUnavailable("stub down".into()));
            }
            Ok(if text.contains("alpha") {
                vec![1.0, 0.0, 0.0, 0.0]
            } else {
                vec![0.0, 1.0, 0.0, 0.0]
            })
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    fn data_row(id: &str, content: &str, vector_ids: Vec<String>) -> crate::types::Data {
        crate::types::Data {
            id: id.into(),
            collection_id: "c1".into(),
            content: content.into(),
            title: None,
            vector_ids,
            metadata: Metadata::new(),
            sequence: Some(0),
            tokens: 7,
            processed: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn resolves_hits_and_keeps_multi_vector_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let vectors = Arc::new(
            LanceVectorStore::open(dir.path().to_str().unwrap(), 4)
                .await
                .unwrap(),
        );
        let meta = Arc::new(MetadataStore::open_in_memory().unwrap());

        meta.insert_data_batch(&[
            data_row("d1", "alpha text", vec!["v1".into(), "v2".into()]),
            data_row("d2", "beta text", vec!["v3".into()]),
        ])
        .unwrap();

        vectors
            .insert_vectors(&[
                EmbeddingVector {
                    id: "v1".into(),
                    data_id: "d1".into(),
                    vector: vec![1.0, 0.0, 0.0, 0.0],
                    dimension: 4,
                    model: "stub".into(),
                    chunk_text: String::new(),
                    chunk_index: 0,
                },
                EmbeddingVector {
                    id: "v2".into(),
                    data_id: "d1".into(),
                    vector: vec![0.95, 0.05, 0.0, 0.0],
                    dimension: 4,
                    model: "stub".into(),
                    chunk_text: String::new(),
                    chunk_index: 1,
                },
                EmbeddingVector {
                    id: "v3".into(),
                    data_id: "d2".into(),
                    vector: vec![0.0, 1.0, 0.0, 0.0],
                    dimension: 4,
                    model: "stub".into(),
                    chunk_text: String::new(),
                    chunk_index: 0,
                },
            ])
            .await
            .unwrap();

        let retriever = DenseRetriever::new(Arc::new(StubEmbedder), vectors, meta);
        let results = retriever.search("alpha query", 3).await.unwrap();

        assert_eq!(results.len(), 3);
        // d1 surfaces twice — once per matching vector.
        assert_eq!(results.iter().filter(|r| r.data_id == "d1").count(), 2);
        assert_eq!(results[0].data_id, "d1");
        assert_eq!(results[0].content, "alpha text");
        assert!(results[0].metadata.contains_key("vector_id"));
    }

    #[tokio::test]
    async fn embed_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let vectors = Arc::new(
            LanceVectorStore::open(dir.path().to_str().unwrap(), 4)
                .await
                .unwrap(),
        );
        let meta = Arc::new(MetadataStore::open_in_memory().unwrap());
        let retriever = DenseRetriever::new(Arc::new(StubEmbedder), vectors, meta);

        let err = retriever.search("fail please", 3).await.unwrap_err();
        assert!(matches!(err, RagError::BackendUnavailable(_)));
    }
}
