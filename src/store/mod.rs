// In-memory vector store
// Named collections of embedded records with cosine and keyword search

#[cfg(test)]
mod tests;

pub mod collection;
mod index;
pub mod similarity;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{RecallError, Result};

pub use collection::{Collection, IndexConfig};
pub use similarity::cosine_similarity;

/// Free-form record metadata
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A stored piece of text with its embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique within its collection
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Unix epoch milliseconds
    pub timestamp: u64,
}

impl Record {
    /// Create a record stamped with the current time
    #[inline]
    pub fn new(id: impl Into<String>, vector: Vec<f32>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vector,
            text: text.into(),
            metadata: Metadata::new(),
            timestamp: now_millis(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Caller-supplied importance prior from the `importance` metadata key
    #[inline]
    pub fn importance(&self) -> Option<f32> {
        self.metadata
            .get("importance")
            .and_then(serde_json::Value::as_f64)
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 1.0) as f32)
    }
}

/// A record returned by a search along with its score
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub record: Record,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub name: String,
    pub dimension: usize,
    pub records: usize,
    pub indexed_records: usize,
    pub pending_changes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StoreStats {
    pub collections: Vec<CollectionStats>,
    pub total_records: usize,
}

impl StoreStats {
    /// Record count of a single collection, zero when it does not exist
    #[inline]
    pub fn records_in(&self, collection: &str) -> usize {
        self.collections
            .iter()
            .find(|c| c.name == collection)
            .map_or(0, |c| c.records)
    }
}

type SharedCollection = Arc<RwLock<Collection>>;

/// Vector store holding every collection for the lifetime of the process.
///
/// Each collection sits behind its own lock: writers are exclusive per
/// collection and a reader never observes a half-inserted record. Callers
/// only ever receive clones of stored records.
#[derive(Debug, Default)]
pub struct VectorStore {
    collections: RwLock<HashMap<String, SharedCollection>>,
    index_config: IndexConfig,
}

impl VectorStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_index_config(index_config: IndexConfig) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            index_config,
        }
    }

    /// Create a collection, or confirm an existing one has the same dimension
    #[inline]
    pub fn create_collection(&self, name: &str, dimension: usize) -> Result<()> {
        if dimension == 0 {
            return Err(RecallError::Store(format!(
                "Collection '{}' must have a non-zero dimension",
                name
            )));
        }

        let collection = self.collection_or_create(name, dimension)?;
        let existing = read_lock(&collection)?.dimension();
        if existing != dimension {
            return Err(RecallError::DimensionMismatch {
                collection: name.to_string(),
                expected: existing,
                actual: dimension,
            });
        }
        Ok(())
    }

    /// Insert a record; a missing collection is created with the record's dimension
    #[inline]
    pub fn insert(&self, collection: &str, record: Record) -> Result<()> {
        if record.vector.is_empty() {
            return Err(RecallError::Store(format!(
                "Record '{}' has an empty vector",
                record.id
            )));
        }

        let shared = self.collection_or_create(collection, record.vector.len())?;
        let mut guard = write_lock(&shared)?;
        let id = record.id.clone();
        guard.insert(record).inspect_err(|e| {
            warn!("Rejected insert of '{}' into '{}': {}", id, collection, e);
        })?;
        debug!("Inserted record '{}' into '{}'", id, collection);
        Ok(())
    }

    /// Replace an existing record in place
    #[inline]
    pub fn update(&self, collection: &str, record: Record) -> Result<()> {
        let Some(shared) = self.collection(collection)? else {
            return Err(RecallError::RecordNotFound {
                collection: collection.to_string(),
                id: record.id,
            });
        };
        let mut guard = write_lock(&shared)?;
        guard.update(record)
    }

    #[inline]
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let Some(shared) = self.collection(collection)? else {
            return Ok(None);
        };
        let guard = read_lock(&shared)?;
        Ok(guard.get(id).cloned())
    }

    /// Remove a record, returning whether it existed
    #[inline]
    pub fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let Some(shared) = self.collection(collection)? else {
            return Ok(false);
        };
        let mut guard = write_lock(&shared)?;
        let removed = guard.delete(id);
        if removed {
            debug!("Deleted record '{}' from '{}'", id, collection);
        }
        Ok(removed)
    }

    /// Records whose cosine similarity to `query` is at least `score_threshold`
    #[inline]
    pub fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        self.search_until(collection, query, limit, score_threshold, None)
    }

    /// Like [`VectorStore::search`], abandoning the approximate index for an
    /// exact scan once `deadline` passes
    #[inline]
    pub fn search_until(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        score_threshold: f32,
        deadline: Option<Instant>,
    ) -> Result<Vec<SearchHit>> {
        let Some(shared) = self.collection(collection)? else {
            debug!("Search on missing collection '{}'", collection);
            return Ok(Vec::new());
        };
        let guard = read_lock(&shared)?;
        guard.search(query, limit, score_threshold, deadline)
    }

    /// Exhaustive search bypassing the approximate index
    #[inline]
    pub fn search_exact(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        let Some(shared) = self.collection(collection)? else {
            return Ok(Vec::new());
        };
        let guard = read_lock(&shared)?;
        guard.search_exact(query, limit, score_threshold)
    }

    #[inline]
    pub fn keyword_search(
        &self,
        collection: &str,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let Some(shared) = self.collection(collection)? else {
            return Ok(Vec::new());
        };
        let guard = read_lock(&shared)?;
        Ok(guard.keyword_search(terms, limit))
    }

    #[inline]
    pub fn rebuild_index(&self, collection: &str) -> Result<()> {
        let Some(shared) = self.collection(collection)? else {
            return Ok(());
        };
        let mut guard = write_lock(&shared)?;
        guard.rebuild_index();
        Ok(())
    }

    #[inline]
    pub fn dimension(&self, collection: &str) -> Result<Option<usize>> {
        let Some(shared) = self.collection(collection)? else {
            return Ok(None);
        };
        let guard = read_lock(&shared)?;
        Ok(Some(guard.dimension()))
    }

    #[inline]
    pub fn collection_names(&self) -> Result<Vec<String>> {
        let map = read_lock(&self.collections)?;
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    #[inline]
    pub fn stats(&self) -> Result<StoreStats> {
        let shared: Vec<SharedCollection> = {
            let map = read_lock(&self.collections)?;
            map.values().map(Arc::clone).collect()
        };

        let mut collections = Vec::with_capacity(shared.len());
        for collection in &shared {
            collections.push(read_lock(collection)?.stats());
        }
        collections.sort_by(|a, b| a.name.cmp(&b.name));

        let total_records = collections.iter().map(|c| c.records).sum();
        Ok(StoreStats {
            collections,
            total_records,
        })
    }

    fn collection(&self, name: &str) -> Result<Option<SharedCollection>> {
        let map = read_lock(&self.collections)?;
        Ok(map.get(name).map(Arc::clone))
    }

    fn collection_or_create(&self, name: &str, dimension: usize) -> Result<SharedCollection> {
        if let Some(existing) = self.collection(name)? {
            return Ok(existing);
        }

        let mut map = write_lock(&self.collections)?;
        let shared = map.entry(name.to_string()).or_insert_with(|| {
            info!(
                "Creating collection '{}' with dimension {}",
                name, dimension
            );
            Arc::new(RwLock::new(Collection::new(
                name,
                dimension,
                self.index_config,
            )))
        });
        Ok(Arc::clone(shared))
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| RecallError::Store("vector store lock poisoned".to_string()))
}

fn write_lock<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| RecallError::Store("vector store lock poisoned".to_string()))
}

/// Current Unix time in milliseconds
#[inline]
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}
