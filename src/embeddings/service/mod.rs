
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::cache::{CacheStats, EmbeddingCache, EmbeddingSource};
use super::fallback::FallbackEmbedder;
use super::EmbeddingProvider;
use crate::{RecallError, Result};

/// Embedding cache and timeout settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub cache_max_entries: usize,
    pub cache_ttl_secs: u64,
    /// Per-call budget for a model embedding before the fallback answers
    pub embed_timeout_ms: u64,
    /// Per-item budget inside `embed_batch`
    pub batch_item_timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            cache_max_entries: 1000,
            cache_ttl_secs: 3600,
            embed_timeout_ms: 5000,
            batch_item_timeout_ms: 10_000,
        }
    }
}

impl EmbeddingConfig {
    #[inline]
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    #[inline]
    pub fn batch_item_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_item_timeout_ms)
    }
}

/// Which generator answers uncached requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    Model,
    Fallback,
}

impl std::fmt::Display for EmbeddingMode {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug)]
struct ServiceState {
    mode: EmbeddingMode,
    last_error: Option<String>,
}

/// Turns text into fixed-length vectors.
///
/// Uses the model provider while it behaves. The first model failure (after
/// the client's own retries) or a vector of the wrong length switches the
/// service to the deterministic fallback for the rest of the process, unless
/// [`EmbeddingService::force_reinitialize`] restores the model. A call that
/// only times out answers from the fallback without changing mode.
#[derive(Debug)]
pub struct EmbeddingService {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    fallback: FallbackEmbedder,
    cache: Arc<EmbeddingCache>,
    state: RwLock<ServiceState>,
    dimension: usize,
    config: EmbeddingConfig,
}

impl EmbeddingService {
    #[inline]
    pub fn new(
        provider: Option<Arc<dyn EmbeddingProvider>>,
        dimension: usize,
        config: EmbeddingConfig,
    ) -> Self {
        let mode = if provider.is_some() {
            EmbeddingMode::Model
        } else {
            EmbeddingMode::Fallback
        };
        let cache = EmbeddingCache::new(
            config.cache_max_entries,
            Duration::from_secs(config.cache_ttl_secs),
        );

        Self {
            provider,
            fallback: FallbackEmbedder::new(dimension),
            cache: Arc::new(cache),
            state: RwLock::new(ServiceState {
                mode,
                last_error: None,
            }),
            dimension: dimension.max(1),
            config,
        }
    }

    /// A service that never calls a model
    #[inline]
    pub fn fallback_only(dimension: usize, config: EmbeddingConfig) -> Self {
        Self::new(None, dimension, config)
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn mode(&self) -> EmbeddingMode {
        self.state.read().unwrap_or_else(PoisonError::into_inner).mode
    }

    /// The failure that caused the last downgrade, if any
    #[inline]
    pub fn last_error(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone()
    }

    #[inline]
    pub fn provider_name(&self) -> Option<&str> {
        self.provider.as_deref().map(|p| p.name())
    }

    #[inline]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[inline]
    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    /// Run the provider health check once at startup, downgrading on failure
    #[inline]
    pub async fn initialize(&self) -> EmbeddingMode {
        let Some(provider) = &self.provider else {
            info!("No embedding provider configured, using fallback embeddings");
            return EmbeddingMode::Fallback;
        };

        match provider.health_check().await {
            Ok(()) => {
                info!("Embedding provider '{}' is available", provider.name());
            }
            Err(e) => self.downgrade(&e),
        }
        self.mode()
    }

    /// Retry the model after a downgrade.
    ///
    /// On a passing health check the service returns to model mode and drops
    /// every fallback-sourced cache entry so those texts are re-embedded.
    #[inline]
    pub async fn force_reinitialize(&self) -> EmbeddingMode {
        let Some(provider) = &self.provider else {
            return EmbeddingMode::Fallback;
        };

        match provider.health_check().await {
            Ok(()) => {
                let purged = self.cache.purge_source(EmbeddingSource::Fallback);
                let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                state.mode = EmbeddingMode::Model;
                state.last_error = None;
                info!(
                    "Embedding provider '{}' restored, purged {} fallback cache entries",
                    provider.name(),
                    purged
                );
            }
            Err(e) => {
                warn!("Embedding provider still unavailable: {}", e);
                let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                state.mode = EmbeddingMode::Fallback;
                state.last_error = Some(e.to_string());
            }
        }
        self.mode()
    }

    /// Embed with the configured per-call timeout
    #[inline]
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        self.embed_within(text, self.config.embed_timeout()).await
    }

    /// Embed, answering from the fallback if the model takes longer than `timeout`.
    ///
    /// A timed-out model call keeps running and caches its result when it lands.
    #[inline]
    pub async fn embed_within(&self, text: &str, timeout: Duration) -> Vec<f32> {
        if let Some((vector, _)) = self.cache.get(text) {
            debug!("Embedding cache hit");
            return vector;
        }

        let provider = match (&self.provider, self.mode()) {
            (Some(provider), EmbeddingMode::Model) => Arc::clone(provider),
            _ => return self.fallback_embedding(text),
        };

        let task = tokio::spawn(model_embeddings(
            provider,
            Arc::clone(&self.cache),
            vec![text.to_string()],
            self.dimension,
        ));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(mut vectors))) => vectors
                .pop()
                .unwrap_or_else(|| self.fallback_embedding(text)),
            Ok(Ok(Err(e))) => {
                self.downgrade(&e);
                self.fallback_embedding(text)
            }
            Ok(Err(join_error)) => {
                self.downgrade(&RecallError::Embedding(join_error.to_string()));
                self.fallback_embedding(text)
            }
            Err(_) => {
                let error = RecallError::EmbeddingTimeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                };
                warn!("{}, answering from fallback", error);
                // Not cached: the model result fills the slot once it arrives.
                self.fallback.embed(text)
            }
        }
    }

    /// Embed many texts, `batch_size` at a time.
    ///
    /// The uncached texts of a batch go to the model in one call. If that call
    /// misses `per_item_timeout`, each item races its own call instead, so an
    /// item that loses degrades to the fallback vector alone. Output order
    /// matches input.
    #[inline]
    pub async fn embed_batch(
        &self,
        texts: &[String],
        batch_size: usize,
        per_item_timeout: Duration,
    ) -> Vec<Vec<f32>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size.max(1)) {
            vectors.extend(self.embed_group(batch, per_item_timeout).await);
        }
        debug!("Embedded batch of {} texts", texts.len());
        vectors
    }

    async fn embed_group(&self, batch: &[String], per_item_timeout: Duration) -> Vec<Vec<f32>> {
        let cached: Vec<Option<Vec<f32>>> = batch
            .iter()
            .map(|text| self.cache.get(text).map(|(vector, _)| vector))
            .collect();
        let missing: Vec<String> = batch
            .iter()
            .zip(&cached)
            .filter(|(_, hit)| hit.is_none())
            .map(|(text, _)| text.clone())
            .collect();

        let provider = match (&self.provider, self.mode()) {
            (Some(provider), EmbeddingMode::Model) if missing.len() > 1 => Arc::clone(provider),
            _ => return self.embed_each(batch, per_item_timeout).await,
        };

        let task = tokio::spawn(model_embeddings(
            provider,
            Arc::clone(&self.cache),
            missing,
            self.dimension,
        ));

        match tokio::time::timeout(per_item_timeout, task).await {
            Ok(Ok(Ok(fresh))) => {
                let mut fresh = fresh.into_iter();
                cached
                    .into_iter()
                    .zip(batch)
                    .map(|(hit, text)| match hit {
                        Some(vector) => vector,
                        None => fresh
                            .next()
                            .unwrap_or_else(|| self.fallback_embedding(text)),
                    })
                    .collect()
            }
            Ok(Ok(Err(e))) => {
                self.downgrade(&e);
                self.fill_with_fallback(cached, batch)
            }
            Ok(Err(join_error)) => {
                self.downgrade(&RecallError::Embedding(join_error.to_string()));
                self.fill_with_fallback(cached, batch)
            }
            Err(_) => {
                debug!(
                    "Batch of {} texts missed its {:?} budget, embedding items one by one",
                    batch.len(),
                    per_item_timeout
                );
                self.embed_each(batch, per_item_timeout).await
            }
        }
    }

    async fn embed_each(&self, batch: &[String], per_item_timeout: Duration) -> Vec<Vec<f32>> {
        join_all(
            batch
                .iter()
                .map(|text| self.embed_within(text, per_item_timeout)),
        )
        .await
    }

    fn fill_with_fallback(&self, cached: Vec<Option<Vec<f32>>>, batch: &[String]) -> Vec<Vec<f32>> {
        cached
            .into_iter()
            .zip(batch)
            .map(|(hit, text)| hit.unwrap_or_else(|| self.fallback_embedding(text)))
            .collect()
    }

    fn fallback_embedding(&self, text: &str) -> Vec<f32> {
        let vector = self.fallback.embed(text);
        self.cache
            .insert(text, vector.clone(), EmbeddingSource::Fallback);
        vector
    }

    fn downgrade(&self, error: &RecallError) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.mode == EmbeddingMode::Model {
            warn!(
                "Embedding model unavailable, switching to fallback embeddings: {}",
                error
            );
        }
        state.mode = EmbeddingMode::Fallback;
        state.last_error = Some(error.to_string());
    }
}

async fn model_embeddings(
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    texts: Vec<String>,
    dimension: usize,
) -> Result<Vec<Vec<f32>>> {
    let vectors = provider.embed_batch(&texts).await?;
    if vectors.len() != texts.len() {
        return Err(RecallError::Embedding(format!(
            "provider returned {} vectors for {} texts",
            vectors.len(),
            texts.len()
        )));
    }

    if let Some(wrong) = vectors.iter().find(|vector| vector.len() != dimension) {
        return Err(RecallError::EmbeddingModelUnavailable(format!(
            "provider returned a {}-dimensional vector, expected {}",
            wrong.len(),
            dimension
        )));
    }

    for (text, vector) in texts.iter().zip(&vectors) {
        cache.insert(text, vector.clone(), EmbeddingSource::Model);
    }
    Ok(vectors)
}
