use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecallError>;

#[derive(Error, Debug)]
pub enum RecallError {
    #[error(
        "Dimension mismatch in collection '{collection}': expected {expected}, got {actual}"
    )]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("Record '{id}' already exists in collection '{collection}'")]
    DuplicateRecord { collection: String, id: String },

    #[error("Record '{id}' not found in collection '{collection}'")]
    RecordNotFound { collection: String, id: String },

    #[error("Embedding timed out after {timeout_ms}ms")]
    EmbeddingTimeout { timeout_ms: u64 },

    #[error("Embedding model unavailable: {0}")]
    EmbeddingModelUnavailable(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Retrieval failed: {0}")]
    RetrievalFailure(String),

    #[error("Rerank failed: {0}")]
    RerankFailure(String),

    #[error("Critical hallucination flag: {0}")]
    CriticalHallucination(String),

    #[error("Pattern error: {0}")]
    Pattern(String),

    #[error("Vector store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Turn cancelled by caller")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub mod commands;
pub mod config;
pub mod embeddings;
pub mod guard;
pub mod ingest;
pub mod pipeline;
pub mod rerank;
pub mod retrieval;
pub mod safety;
pub mod store;
pub mod text;
