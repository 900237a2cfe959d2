pub mod lance_store;
pub mod metadata_store;

pub use lance_store::{LanceVectorStore, VectorHit};
pub use metadata_store::MetadataStore;
