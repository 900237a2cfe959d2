pub mod dense;
pub mod fusion;
pub mod hybrid;
pub mod lexical;
pub mod parallel;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::RetrievalResult;

/// Capability interface shared by the retrieval backends. The hybrid
/// retriever is parameterized over an ordered, weighted set of these.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievalResult>>;
}

pub use dense::DenseRetriever;
pub use hybrid::HybridRetriever;
pub use lexical::{LexicalIndex, LexicalRetriever};
pub use parallel::ParallelRetriever;
