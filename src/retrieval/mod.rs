pub mod embedder;
pub mod index;
pub mod ingest;
pub mod rerank;

pub use embedder::{EmbeddingModel, HashEmbedder};
pub use index::{InMemoryVectorIndex, ScoredPassage, VectorIndex};
pub use rerank::{LexicalReranker, Reranker};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Vector search failed: {0}")]
    SearchFailed(String),

    #[error("Rerank failed: {0}")]
    RerankFailed(String),

    #[error("Ingestion failed: {0}")]
    IngestFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
