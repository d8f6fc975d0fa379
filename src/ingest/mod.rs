// Ingest module
// Chunks incoming text, embeds each chunk and stores it in a collection

#[cfg(test)]
mod tests;

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::Result;
use crate::embeddings::{ChunkingConfig, EmbeddingService, chunk_text};
use crate::store::{Metadata, Record, VectorStore};

const DEFAULT_BATCH_SIZE: usize = 16;

/// What one ingest call stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub collection: String,
    /// Ids of the inserted records, in chunk order
    pub record_ids: Vec<String>,
    pub chunk_count: usize,
    /// Characters of source text consumed
    pub source_chars: usize,
}

/// Turns raw text into stored, embedded records
#[derive(Debug)]
pub struct Ingestor {
    store: Arc<VectorStore>,
    embeddings: Arc<EmbeddingService>,
    chunking: ChunkingConfig,
    collection: String,
    batch_size: usize,
}

impl Ingestor {
    #[inline]
    pub fn new(
        store: Arc<VectorStore>,
        embeddings: Arc<EmbeddingService>,
        chunking: ChunkingConfig,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            store,
            embeddings,
            chunking,
            collection: collection.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Default target collection
    #[inline]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Ingest into the default collection
    #[inline]
    pub async fn ingest(&self, text: &str, metadata: Metadata) -> Result<IngestReport> {
        self.ingest_into(&self.collection, text, metadata).await
    }

    /// Chunk, embed and insert `text`.
    ///
    /// Each record carries a copy of `metadata` plus `chunk_index` and
    /// `total_chunks`. A dimension conflict with an existing collection stops
    /// the ingest at the offending chunk.
    #[inline]
    pub async fn ingest_into(
        &self,
        collection: &str,
        text: &str,
        metadata: Metadata,
    ) -> Result<IngestReport> {
        let chunks = chunk_text(text, &self.chunking);
        if chunks.is_empty() {
            debug!("No chunks produced, nothing to ingest");
            return Ok(IngestReport {
                collection: collection.to_string(),
                record_ids: Vec::new(),
                chunk_count: 0,
                source_chars: text.chars().count(),
            });
        }

        let total_chunks = chunks.len();
        let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self
            .embeddings
            .embed_batch(
                &contents,
                self.batch_size,
                self.embeddings.config().batch_item_timeout(),
            )
            .await;

        let mut record_ids = Vec::with_capacity(total_chunks);
        for ((chunk, content), vector) in chunks.iter().zip(contents).zip(vectors) {
            let mut chunk_metadata = metadata.clone();
            chunk_metadata.insert("chunk_index".to_string(), json!(chunk.chunk_index));
            chunk_metadata.insert("total_chunks".to_string(), json!(total_chunks));

            let id = Uuid::new_v4().to_string();
            let record = Record::new(id.clone(), vector, content).with_metadata(chunk_metadata);
            self.store.insert(collection, record)?;
            record_ids.push(id);
        }

        info!(
            "Ingested {} chunks into collection '{}'",
            record_ids.len(),
            collection
        );
        Ok(IngestReport {
            collection: collection.to_string(),
            chunk_count: record_ids.len(),
            record_ids,
            source_chars: text.chars().count(),
        })
    }
}
