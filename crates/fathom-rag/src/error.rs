use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

/// Error kinds recognized across the retrieval and ingestion paths.
///
/// Fan-out stages absorb component failures into empty lists; only the
/// orchestrator decides which of these surface to the caller.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("backend call timed out after {0:?}")]
    BackendTimeout(Duration),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("retrieval returned no results")]
    EmptyRetrieval,

    #[error("token encoder unavailable")]
    TokenizerUnavailable,

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("could not decode {0} with any supported encoding")]
    DecodeFailure(String),

    #[error("llm generation failed: {0}")]
    LlmFailure(String),

    #[error(transparent)]
    Metadata(#[from] rusqlite::Error),

    #[error(transparent)]
    VectorStore(#[from] lancedb::Error),

    #[error(transparent)]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error(transparent)]
    Lexical(#[from] tantivy::TantivyError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RagError {
    /// Map a reqwest transport error onto the timeout/unavailable split.
    pub fn from_http(err: reqwest::Error, deadline: Duration) -> Self {
        if err.is_timeout() {
            RagError::BackendTimeout(deadline)
        } else {
            RagError::BackendUnavailable(err.to_string())
        }
    }
}
