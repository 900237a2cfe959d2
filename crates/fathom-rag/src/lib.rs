//! fathom-rag: a hybrid-retrieval RAG engine.
//!
//! Questions are answered over a private corpus by fanning query variants
//! out across a dense vector index (LanceDB) and a BM25 index (Tantivy),
//! reconciling multi-vector chunks, fusing ranks with weighted RRF,
//! cross-encoder reranking, and fitting the survivors into a token budget
//! before prompting the chat model. Ingestion chunks `.txt` files into a
//! metadata store and a multi-vector embedding store, resumably.

pub mod chain;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod prompts;
pub mod query;
pub mod reranking;
pub mod search;
pub mod storage;
pub mod tokens;
pub mod types;

pub use chain::{QueryRequest, QueryResponse, RetrievalChain};
pub use config::AppConfig;
pub use engine::RagEngine;
pub use error::{RagError, Result};
pub use ingest::ImportPipeline;
pub use types::{
    Collection, ConversationTurn, Data, Dataset, EmbeddingVector, Query, RerankResult,
    RetrievalResult,
};
