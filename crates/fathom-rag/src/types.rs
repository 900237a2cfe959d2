use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form metadata bag carried by data rows and retrieval results.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A named corpus grouping collections of ingested files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub description: String,
    pub collection_count: i64,
    pub data_count: i64,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One source file's worth of chunks, bound to exactly one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub dataset_id: String,
    pub name: String,
    pub description: String,
    pub source_file: Option<String>,
    pub file_type: Option<String>,
    pub data_count: i64,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored text chunk — the retrieval unit.
///
/// One chunk may be represented by several embeddings (full content plus
/// sub-chunk views); `vector_ids` holds the ordered set of ids into the
/// vector store. `processed = false` marks rows awaiting vectorization,
/// which is how interrupted ingestion runs resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data {
    pub id: String,
    pub collection_id: String,
    pub content: String,
    pub title: Option<String>,
    pub vector_ids: Vec<String>,
    pub metadata: Metadata,
    pub sequence: Option<u32>,
    pub tokens: usize,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A dense vector derived from one textual view of a chunk.
/// `chunk_index` 0 is the full content; >= 1 are sub-chunk views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub id: String,
    pub data_id: String,
    pub vector: Vec<f32>,
    pub dimension: usize,
    pub model: String,
    pub chunk_text: String,
    pub chunk_index: u32,
}

/// One question/answer exchange within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub session_id: String,
    pub question: String,
    pub answer: String,
    pub retrieved_chunks: Vec<ChunkRef>,
    pub timestamp: DateTime<Utc>,
    pub tokens_used: usize,
    pub relevance_score: f32,
    pub response_time: f64,
}

/// Reference to a chunk that contributed to an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRef {
    pub data_id: String,
    pub collection_id: String,
    pub final_score: f32,
}

/// A processed query: the original question plus its transformed variants
/// and the per-request retrieval parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub question: String,
    pub optimized_question: String,
    pub expanded_queries: Vec<String>,
    pub concat_query: String,
    pub max_tokens: usize,
    pub relevance_threshold: f32,
    pub top_k: usize,
}

impl Query {
    /// All query variants to dispatch, deduplicated with order preserved.
    /// Guaranteed non-empty: falls back to the raw question.
    pub fn variant_set(&self) -> Vec<String> {
        let mut variants: Vec<String> = Vec::new();
        let mut push = |candidate: &str, out: &mut Vec<String>| {
            let trimmed = candidate.trim();
            if !trimmed.is_empty() && !out.iter().any(|v| v == trimmed) {
                out.push(trimmed.to_string());
            }
        };
        push(&self.optimized_question, &mut variants);
        for expanded in &self.expanded_queries {
            push(expanded, &mut variants);
        }
        push(&self.concat_query, &mut variants);
        if variants.is_empty() {
            push(&self.question, &mut variants);
        }
        if variants.is_empty() {
            variants.push(self.question.clone());
        }
        variants
    }
}

/// Which backend produced a retrieval result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalSource {
    Dense,
    Lexical,
    Fused,
}

/// One ranked hit from a retrieval backend or a fusion stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub data_id: String,
    pub collection_id: String,
    pub content: String,
    pub score: f32,
    pub source: RetrievalSource,
    pub metadata: Metadata,
    pub tokens: usize,
}

/// A retrieval result after cross-encoder blending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankResult {
    pub data_id: String,
    pub collection_id: String,
    pub content: String,
    pub original_score: f32,
    pub rerank_score: f32,
    pub final_score: f32,
    pub metadata: Metadata,
    pub tokens: usize,
}

impl RerankResult {
    /// Identity conversion used when reranking is disabled or unavailable.
    pub fn from_retrieval(result: RetrievalResult) -> Self {
        Self {
            data_id: result.data_id,
            collection_id: result.collection_id,
            content: result.content,
            original_score: result.score,
            rerank_score: result.score,
            final_score: result.score,
            metadata: result.metadata,
            tokens: result.tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_with(optimized: &str, expanded: &[&str], concat: &str) -> Query {
        Query {
            id: "q1".into(),
            question: "raw".into(),
            optimized_question: optimized.into(),
            expanded_queries: expanded.iter().map(|s| s.to_string()).collect(),
            concat_query: concat.into(),
            max_tokens: 4000,
            relevance_threshold: 0.6,
            top_k: 10,
        }
    }

    #[test]
    fn variant_set_dedupes_preserving_order() {
        let query = query_with("what is x", &["explain x", "what is x"], "what is x explain x");
        assert_eq!(
            query.variant_set(),
            vec!["what is x", "explain x", "what is x explain x"]
        );
    }

    #[test]
    fn variant_set_falls_back_to_question() {
        let query = query_with("", &[], "");
        assert_eq!(query.variant_set(), vec!["raw"]);
    }
}
