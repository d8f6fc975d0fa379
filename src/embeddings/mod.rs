// Embeddings module
// Ollama-backed embeddings with a deterministic fallback, caching and content chunking

pub mod cache;
pub mod chunking;
pub mod fallback;
pub mod ollama;
pub mod service;

use async_trait::async_trait;

use crate::Result;

pub use cache::{CacheStats, EmbeddingCache, EmbeddingSource};
pub use chunking::{ChunkingConfig, ContentChunk, chunk_text};
pub use fallback::FallbackEmbedder;
pub use ollama::OllamaClient;
pub use service::{EmbeddingConfig, EmbeddingMode, EmbeddingService};

/// A model that turns text into vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync + std::fmt::Debug {
    /// Short provider name for logs and health output
    fn name(&self) -> &str;

    /// Verify the provider is reachable and its model is usable
    async fn health_check(&self) -> Result<()>;

    /// Embed every text, returning vectors in input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
