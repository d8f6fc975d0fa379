// Hybrid retrieval
// Expands a query, searches the store by vector and by keyword, and merges the hits


pub mod expansion;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::embeddings::EmbeddingService;
use crate::pipeline::ConversationTurn;
use crate::store::{Record, SearchHit, VectorStore};
use crate::{RecallError, Result};

pub use expansion::{Concept, ExpandedQuery, QueryExpander};

/// Which searches a retrieval runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Semantic,
    Keyword,
    #[default]
    Hybrid,
}

impl SearchMode {
    fn uses_semantic(self) -> bool {
        matches!(self, Self::Semantic | Self::Hybrid)
    }

    fn uses_keyword(self) -> bool {
        matches!(self, Self::Keyword | Self::Hybrid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub collection: String,
    pub mode: SearchMode,
    pub relevance_floor: f32,
    pub max_results: usize,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    pub include_history: bool,
    /// Number of recent user turns folded into the query
    pub history_turns: usize,
    pub min_token_len: usize,
    /// Budget for embedding plus semantic search
    pub semantic_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    #[inline]
    fn default() -> Self {
        Self {
            collection: "knowledge".to_string(),
            mode: SearchMode::Hybrid,
            relevance_floor: 0.5,
            max_results: 5,
            semantic_weight: 0.7,
            keyword_weight: 0.3,
            include_history: true,
            history_turns: 2,
            min_token_len: 3,
            semantic_timeout_ms: 2000,
        }
    }
}

/// Per-call retrieval parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalOptions {
    pub collection: String,
    pub mode: SearchMode,
    pub limit: usize,
    pub relevance_floor: f32,
    pub include_history: bool,
    pub timeout: Duration,
}

impl RetrievalOptions {
    #[inline]
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            collection: config.collection.clone(),
            mode: config.mode,
            limit: config.max_results,
            relevance_floor: config.relevance_floor,
            include_history: config.include_history,
            timeout: Duration::from_millis(config.semantic_timeout_ms),
        }
    }
}

impl Default for RetrievalOptions {
    #[inline]
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

/// A retrieved record before reranking
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalCandidate {
    pub record: Record,
    /// Cosine similarity from the vector search, 0 when only keyword search found it
    pub semantic_score: f32,
    /// Matched-term fraction from the keyword search, 0 when only vector search found it
    pub lexical_score: f32,
    /// Merged score the relevance floor applies to
    pub retrieval_score: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetrievalOutcome {
    pub candidates: Vec<RetrievalCandidate>,
    /// False when retrieval failed or found nothing above the floor
    pub was_applied: bool,
    pub terms: Vec<String>,
    pub concepts: Vec<Concept>,
}

impl RetrievalOutcome {
    #[inline]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Strict retrieval seam used by the pipeline
#[async_trait]
pub trait Retriever: Send + Sync + std::fmt::Debug {
    async fn try_retrieve(
        &self,
        query: &str,
        history: &[ConversationTurn],
        options: &RetrievalOptions,
    ) -> Result<RetrievalOutcome>;
}

#[derive(Debug)]
pub struct RetrievalOrchestrator {
    store: Arc<VectorStore>,
    embeddings: Arc<EmbeddingService>,
    expander: QueryExpander,
    config: RetrievalConfig,
}

impl RetrievalOrchestrator {
    #[inline]
    pub fn new(
        store: Arc<VectorStore>,
        embeddings: Arc<EmbeddingService>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        let expander = QueryExpander::new(config.min_token_len, config.history_turns)?;
        Ok(Self {
            store,
            embeddings,
            expander,
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    #[inline]
    pub fn expander(&self) -> &QueryExpander {
        &self.expander
    }

    /// Fail-soft retrieval: any error yields an empty, not-applied outcome
    #[inline]
    pub async fn retrieve(
        &self,
        query: &str,
        history: &[ConversationTurn],
        options: &RetrievalOptions,
    ) -> RetrievalOutcome {
        match self.try_retrieve(query, history, options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Retrieval failed, continuing without context: {}", e);
                RetrievalOutcome::empty()
            }
        }
    }

    async fn semantic_hits(
        &self,
        query: &str,
        options: &RetrievalOptions,
        pool: usize,
    ) -> Result<Vec<SearchHit>> {
        let deadline = Instant::now() + options.timeout;
        let vector = self.embeddings.embed_within(query, options.timeout).await;
        // Negative similarities never help; the relevance floor applies after merging.
        self.store
            .search_until(&options.collection, &vector, pool, 0.0, Some(deadline))
    }

    fn merge(
        &self,
        semantic: Vec<SearchHit>,
        keyword: Vec<SearchHit>,
        mode: SearchMode,
    ) -> Vec<RetrievalCandidate> {
        let mut candidates: Vec<RetrievalCandidate> =
            Vec::with_capacity(semantic.len() + keyword.len());
        let mut positions: HashMap<String, usize> = HashMap::new();

        for hit in semantic {
            positions.insert(hit.record.id.clone(), candidates.len());
            candidates.push(RetrievalCandidate {
                record: hit.record,
                semantic_score: hit.score,
                lexical_score: 0.0,
                retrieval_score: hit.score,
            });
        }

        for hit in keyword {
            match positions.get(&hit.record.id) {
                Some(&position) => {
                    if let Some(candidate) = candidates.get_mut(position) {
                        candidate.lexical_score = hit.score;
                        // A second match never ranks a record below either single match
                        let weighted = self.config.semantic_weight.mul_add(
                            candidate.semantic_score,
                            self.config.keyword_weight * hit.score,
                        );
                        candidate.retrieval_score =
                            weighted.max(candidate.semantic_score).max(hit.score);
                    }
                }
                None => {
                    positions.insert(hit.record.id.clone(), candidates.len());
                    candidates.push(RetrievalCandidate {
                        record: hit.record,
                        semantic_score: 0.0,
                        lexical_score: hit.score,
                        retrieval_score: hit.score,
                    });
                }
            }
        }

        debug!("Merged {} candidates in {:?} mode", candidates.len(), mode);
        candidates
    }
}

#[async_trait]
impl Retriever for RetrievalOrchestrator {
    async fn try_retrieve(
        &self,
        query: &str,
        history: &[ConversationTurn],
        options: &RetrievalOptions,
    ) -> Result<RetrievalOutcome> {
        let expanded = self.expander.expand(query, history, options.include_history);
        let terms = expanded.terms();
        let pool = options.limit.saturating_mul(4).max(options.limit);

        debug!(
            "Retrieving from '{}' with {} terms, concepts {:?}",
            options.collection,
            terms.len(),
            expanded.concepts
        );

        let semantic = if options.mode.uses_semantic() {
            self.semantic_hits(query, options, pool)
                .await
                .map_err(|e| RecallError::RetrievalFailure(format!("semantic search: {}", e)))?
        } else {
            Vec::new()
        };

        let keyword = if options.mode.uses_keyword() {
            self.store
                .keyword_search(&options.collection, &terms, pool)
                .map_err(|e| RecallError::RetrievalFailure(format!("keyword search: {}", e)))?
        } else {
            Vec::new()
        };

        let mut candidates = self.merge(semantic, keyword, options.mode);
        candidates.retain(|c| c.retrieval_score >= options.relevance_floor);
        // Stable: equal scores keep merge order, semantic hits first.
        candidates.sort_by(|a, b| b.retrieval_score.total_cmp(&a.retrieval_score));
        candidates.truncate(options.limit);

        debug!(
            "Retrieved {} candidates above floor {}",
            candidates.len(),
            options.relevance_floor
        );

        Ok(RetrievalOutcome {
            was_applied: !candidates.is_empty(),
            candidates,
            terms,
            concepts: expanded.concepts,
        })
    }
}
