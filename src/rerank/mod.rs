// Multi-signal reranking of retrieval candidates

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::embeddings::EmbeddingService;
use crate::retrieval::RetrievalCandidate;
use crate::store::similarity::unit_similarity;
use crate::store::{Metadata, now_millis};
use crate::text;
use crate::{RecallError, Result};

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Weights of the final score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankWeights {
    pub semantic: f32,
    pub lexical: f32,
    pub recency: f32,
    pub importance: f32,
    /// Strength of the multiplicative contextual boost
    pub contextual: f32,
}

impl Default for RerankWeights {
    #[inline]
    fn default() -> Self {
        Self {
            semantic: 0.6,
            lexical: 0.2,
            recency: 0.1,
            importance: 0.1,
            contextual: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub weights: RerankWeights,
    pub score_threshold: f32,
    pub top_k: usize,
    pub half_life_hours: f64,
    /// Number of previous session queries considered for context
    pub context_window: usize,
    /// Weight multiplier per step back in the query window
    pub context_decay: f32,
    pub contextual_boost_threshold: f32,
    pub default_importance: f32,
    pub timeout_ms: u64,
}

impl Default for RerankConfig {
    #[inline]
    fn default() -> Self {
        Self {
            weights: RerankWeights::default(),
            score_threshold: 0.1,
            top_k: 5,
            half_life_hours: 24.0,
            context_window: 5,
            context_decay: 0.7,
            contextual_boost_threshold: 0.6,
            default_importance: 0.5,
            timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FeatureScores {
    pub semantic: f32,
    pub lexical: f32,
    pub recency: f32,
    pub importance: f32,
    pub contextual: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub final_score: f32,
    pub feature_scores: FeatureScores,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RerankOutcome {
    pub results: Vec<RankedResult>,
    /// The importance-sorted fallback produced `results`
    pub used_fallback: bool,
}

#[derive(Debug)]
pub struct Reranker {
    embeddings: Arc<EmbeddingService>,
    config: RerankConfig,
}

impl Reranker {
    #[inline]
    pub fn new(embeddings: Arc<EmbeddingService>, config: RerankConfig) -> Self {
        Self { embeddings, config }
    }

    #[inline]
    pub fn config(&self) -> &RerankConfig {
        &self.config
    }

    /// Rerank against the current time.
    ///
    /// `context_history` holds previous queries of the session, oldest first.
    #[inline]
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievalCandidate>,
        context_history: &[String],
    ) -> RerankOutcome {
        self.rerank_at(query, candidates, context_history, now_millis())
            .await
    }

    /// Rerank with recency measured from `now_ms`.
    ///
    /// Never drops candidates on failure: a scoring error or a passed deadline
    /// returns the candidates sorted by importance instead.
    #[inline]
    pub async fn rerank_at(
        &self,
        query: &str,
        candidates: Vec<RetrievalCandidate>,
        context_history: &[String],
        now_ms: u64,
    ) -> RerankOutcome {
        let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);
        match self
            .try_rerank(query, &candidates, context_history, now_ms, deadline)
            .await
        {
            Ok(results) => RerankOutcome {
                results,
                used_fallback: false,
            },
            Err(e) => {
                warn!("Reranking failed, sorting by importance: {}", e);
                RerankOutcome {
                    results: self.importance_fallback(candidates),
                    used_fallback: true,
                }
            }
        }
    }

    /// Score every candidate; fails on a passed deadline or a non-finite score
    #[inline]
    pub async fn try_rerank(
        &self,
        query: &str,
        candidates: &[RetrievalCandidate],
        context_history: &[String],
        now_ms: u64,
        deadline: Instant,
    ) -> Result<Vec<RankedResult>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        check_deadline(deadline)?;

        let query_vector = self
            .embeddings
            .embed_within(query, remaining(deadline))
            .await;
        let context = self.context_vectors(context_history, deadline).await?;
        let lexical = LexicalScorer::new(query, candidates);

        let mut results = Vec::with_capacity(candidates.len());
        for (position, candidate) in candidates.iter().enumerate() {
            check_deadline(deadline)?;

            let record = &candidate.record;
            let vector = if record.vector.len() == query_vector.len() {
                record.vector.clone()
            } else {
                self.embeddings
                    .embed_within(&record.text, remaining(deadline))
                    .await
            };

            let features = FeatureScores {
                semantic: unit_similarity(&query_vector, &vector),
                lexical: lexical.score(position),
                recency: self.recency(record.timestamp, now_ms),
                importance: record
                    .importance()
                    .unwrap_or(self.config.default_importance),
                contextual: contextual_score(&vector, &context),
            };
            let final_score = self.final_score(&features);
            if !final_score.is_finite() {
                return Err(RecallError::RerankFailure(format!(
                    "non-finite score for record '{}'",
                    record.id
                )));
            }

            results.push(RankedResult {
                id: record.id.clone(),
                content: record.text.clone(),
                metadata: record.metadata.clone(),
                final_score,
                feature_scores: features,
            });
        }

        results.retain(|r| r.final_score >= self.config.score_threshold);
        // Stable: ties keep the original candidate order.
        results.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
        results.truncate(self.config.top_k);

        debug!(
            "Reranked {} candidates into {} results",
            candidates.len(),
            results.len()
        );
        Ok(results)
    }

    /// Weighted feature sum, boosted when the conversation context agrees
    #[inline]
    pub fn final_score(&self, features: &FeatureScores) -> f32 {
        let weights = &self.config.weights;
        let base = weights.semantic * features.semantic
            + weights.lexical * features.lexical
            + weights.recency * features.recency
            + weights.importance * features.importance;

        if features.contextual > self.config.contextual_boost_threshold {
            base * weights.contextual.mul_add(features.contextual, 1.0)
        } else {
            base
        }
    }

    fn recency(&self, timestamp: u64, now_ms: u64) -> f32 {
        let age_hours = now_ms.saturating_sub(timestamp) as f64 / MILLIS_PER_HOUR;
        let half_life = self.config.half_life_hours.max(f64::EPSILON);
        0.5_f64.powf(age_hours / half_life) as f32
    }

    /// Embeddings of the last `context_window` queries with their decay weights,
    /// most recent first
    async fn context_vectors(
        &self,
        context_history: &[String],
        deadline: Instant,
    ) -> Result<Vec<(Vec<f32>, f32)>> {
        let mut context = Vec::new();
        let mut weight = 1.0_f32;
        for query in context_history
            .iter()
            .rev()
            .take(self.config.context_window)
        {
            check_deadline(deadline)?;
            let vector = self
                .embeddings
                .embed_within(query, remaining(deadline))
                .await;
            context.push((vector, weight));
            weight *= self.config.context_decay;
        }
        Ok(context)
    }

    fn importance_fallback(&self, candidates: Vec<RetrievalCandidate>) -> Vec<RankedResult> {
        let mut results: Vec<RankedResult> = candidates
            .into_iter()
            .map(|candidate| {
                let importance = candidate
                    .record
                    .importance()
                    .unwrap_or(self.config.default_importance);
                RankedResult {
                    id: candidate.record.id,
                    content: candidate.record.text,
                    metadata: candidate.record.metadata,
                    final_score: importance,
                    feature_scores: FeatureScores {
                        semantic: candidate.semantic_score,
                        lexical: candidate.lexical_score,
                        importance,
                        ..FeatureScores::default()
                    },
                }
            })
            .collect();

        results.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
        results.truncate(self.config.top_k);
        results
    }
}

/// Token-overlap scorer; longer and rarer query terms weigh more
struct LexicalScorer {
    /// Query terms with their weights
    terms: Vec<(String, f32)>,
    documents: Vec<HashSet<String>>,
}

impl LexicalScorer {
    fn new(query: &str, candidates: &[RetrievalCandidate]) -> Self {
        let documents: Vec<HashSet<String>> = candidates
            .iter()
            .map(|c| text::tokenize(&c.record.text).into_iter().collect())
            .collect();
        let total = documents.len() as f32;

        let terms = text::content_tokens(query, 2)
            .into_iter()
            .map(|term| {
                let df = documents.iter().filter(|d| d.contains(&term)).count().max(1);
                let rarity = (total / df as f32).ln_1p();
                let length = (term.chars().count() as f32).ln_1p();
                let weight = rarity * length;
                (term, weight)
            })
            .collect();

        Self { terms, documents }
    }

    fn score(&self, position: usize) -> f32 {
        let Some(document) = self.documents.get(position) else {
            return 0.0;
        };
        let total: f32 = self.terms.iter().map(|(_, w)| w).sum();
        if total <= f32::EPSILON {
            return 0.0;
        }
        let matched: f32 = self
            .terms
            .iter()
            .filter(|(term, _)| document.contains(term))
            .map(|(_, w)| w)
            .sum();
        (matched / total).clamp(0.0, 1.0)
    }
}

fn contextual_score(vector: &[f32], context: &[(Vec<f32>, f32)]) -> f32 {
    let total: f32 = context.iter().map(|(_, w)| w).sum();
    if total <= f32::EPSILON {
        return 0.0;
    }
    let weighted: f32 = context
        .iter()
        .map(|(query, weight)| weight * unit_similarity(vector, query))
        .sum();
    (weighted / total).clamp(0.0, 1.0)
}

fn check_deadline(deadline: Instant) -> Result<()> {
    if Instant::now() >= deadline {
        return Err(RecallError::RerankFailure(
            "reranking deadline exceeded".to_string(),
        ));
    }
    Ok(())
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
