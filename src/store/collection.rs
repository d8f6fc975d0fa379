use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use itertools::Itertools;
use tracing::{debug, info};

use super::index::{DEFAULT_GRAPH_DEGREE, NeighborGraph};
use super::similarity::cosine_similarity;
use super::{CollectionStats, Record, SearchHit};
use crate::{RecallError, Result};

/// Tuning for the approximate neighbor-graph index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConfig {
    /// Collections smaller than this are always searched exactly
    pub min_records: usize,
    /// Number of writes since the last build that triggers a rebuild
    pub rebuild_threshold: usize,
    /// Neighbors kept per record
    pub degree: usize,
    /// Beam width used during traversal
    pub ef_search: usize,
}

impl Default for IndexConfig {
    #[inline]
    fn default() -> Self {
        Self {
            min_records: 100,
            rebuild_threshold: 32,
            degree: DEFAULT_GRAPH_DEGREE,
            ef_search: 64,
        }
    }
}

/// A named set of records sharing one vector dimensionality.
///
/// Records are keyed by an insertion sequence number so iteration order is
/// insertion order, which is also the tie-break order for every search.
#[derive(Debug)]
pub struct Collection {
    name: String,
    dimension: usize,
    records: BTreeMap<u64, Record>,
    ids: HashMap<String, u64>,
    next_seq: u64,
    index: Option<NeighborGraph>,
    /// Records written since the last index build; always scanned exactly
    dirty: BTreeSet<u64>,
    pending_changes: usize,
    index_config: IndexConfig,
}

impl Collection {
    pub fn new(name: &str, dimension: usize, index_config: IndexConfig) -> Self {
        Self {
            name: name.to_string(),
            dimension,
            records: BTreeMap::new(),
            ids: HashMap::new(),
            next_seq: 0,
            index: None,
            dirty: BTreeSet::new(),
            pending_changes: 0,
            index_config,
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        if actual != self.dimension {
            return Err(RecallError::DimensionMismatch {
                collection: self.name.clone(),
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }

    pub fn insert(&mut self, record: Record) -> Result<()> {
        self.check_dimension(record.vector.len())?;
        if self.ids.contains_key(&record.id) {
            return Err(RecallError::DuplicateRecord {
                collection: self.name.clone(),
                id: record.id,
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.ids.insert(record.id.clone(), seq);
        self.records.insert(seq, record);
        self.dirty.insert(seq);
        self.pending_changes += 1;
        self.maybe_rebuild_index();
        Ok(())
    }

    /// Replace an existing record, keeping its insertion position.
    pub fn update(&mut self, record: Record) -> Result<()> {
        self.check_dimension(record.vector.len())?;
        let Some(seq) = self.ids.get(&record.id).copied() else {
            return Err(RecallError::RecordNotFound {
                collection: self.name.clone(),
                id: record.id,
            });
        };

        self.records.insert(seq, record);
        self.dirty.insert(seq);
        self.pending_changes += 1;
        self.maybe_rebuild_index();
        Ok(())
    }

    #[inline]
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.ids.get(id).and_then(|seq| self.records.get(seq))
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let Some(seq) = self.ids.remove(id) else {
            return false;
        };
        self.records.remove(&seq);
        self.dirty.remove(&seq);
        self.pending_changes += 1;
        self.maybe_rebuild_index();
        true
    }

    fn maybe_rebuild_index(&mut self) {
        if self.records.len() < self.index_config.min_records {
            if self.index.is_some() {
                debug!(
                    "Collection '{}' shrank below {} records, dropping index",
                    self.name, self.index_config.min_records
                );
                self.index = None;
            }
            return;
        }

        if self.index.is_none() || self.pending_changes > self.index_config.rebuild_threshold {
            self.rebuild_index();
        }
    }

    pub fn rebuild_index(&mut self) {
        self.index = Some(NeighborGraph::build(
            &self.records,
            self.index_config.degree,
        ));
        self.dirty.clear();
        self.pending_changes = 0;
        info!(
            "Rebuilt neighbor index for collection '{}' ({} records)",
            self.name,
            self.records.len()
        );
    }

    /// Similarity search, ties broken by insertion order.
    ///
    /// Uses the neighbor graph for large collections unless `deadline`
    /// passes, in which case the answer comes from an exact scan.
    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
        score_threshold: f32,
        deadline: Option<Instant>,
    ) -> Result<Vec<SearchHit>> {
        self.check_dimension(query.len())?;
        if limit == 0 || self.records.is_empty() {
            return Ok(Vec::new());
        }

        let scored = match self.approximate_scores(query, limit, deadline) {
            Some(scored) => scored,
            None => self.exact_scores(query),
        };

        Ok(self.collect_hits(scored, limit, score_threshold))
    }

    /// Exhaustive search that never touches the index.
    pub fn search_exact(
        &self,
        query: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        self.check_dimension(query.len())?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self.collect_hits(self.exact_scores(query), limit, score_threshold))
    }

    fn exact_scores(&self, query: &[f32]) -> Vec<(u64, f32)> {
        self.records
            .iter()
            .map(|(seq, record)| (*seq, cosine_similarity(query, &record.vector)))
            .collect()
    }

    fn approximate_scores(
        &self,
        query: &[f32],
        limit: usize,
        deadline: Option<Instant>,
    ) -> Option<Vec<(u64, f32)>> {
        if self.records.len() < self.index_config.min_records {
            return None;
        }
        let index = self.index.as_ref()?;
        let ef = self.index_config.ef_search.max(limit.saturating_mul(4));

        let Some(mut scored) = index.search(&self.records, query, ef, deadline) else {
            debug!(
                "Approximate search on '{}' timed out, using exact search",
                self.name
            );
            return None;
        };

        // Writes since the last build may be missing or stale in the graph.
        scored.retain(|(seq, _)| !self.dirty.contains(seq));
        for seq in &self.dirty {
            if let Some(record) = self.records.get(seq) {
                scored.push((*seq, cosine_similarity(query, &record.vector)));
            }
        }
        Some(scored)
    }

    fn collect_hits(
        &self,
        mut scored: Vec<(u64, f32)>,
        limit: usize,
        score_threshold: f32,
    ) -> Vec<SearchHit> {
        scored.retain(|(_, score)| *score >= score_threshold);
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(limit)
            .filter_map(|(seq, score)| {
                self.records.get(&seq).map(|record| SearchHit {
                    record: record.clone(),
                    score,
                })
            })
            .collect()
    }

    /// Case-insensitive substring/token match; score is the fraction of
    /// distinct terms found in the record text.
    pub fn keyword_search(&self, terms: &[String], limit: usize) -> Vec<SearchHit> {
        let terms: Vec<String> = terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .unique()
            .collect();

        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }

        let total = terms.len() as f32;
        let mut hits: Vec<SearchHit> = self
            .records
            .values()
            .filter_map(|record| {
                let haystack = record.text.to_lowercase();
                let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (matched > 0).then(|| SearchHit {
                    record: record.clone(),
                    score: matched as f32 / total,
                })
            })
            .collect();

        // Stable sort keeps insertion order among equal scores.
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        hits
    }

    pub fn stats(&self) -> CollectionStats {
        CollectionStats {
            name: self.name.clone(),
            dimension: self.dimension,
            records: self.records.len(),
            indexed_records: self.index.as_ref().map_or(0, NeighborGraph::len),
            pending_changes: self.pending_changes,
        }
    }
}
