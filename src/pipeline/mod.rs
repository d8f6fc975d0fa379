// Pipeline module
// Runs one user turn through safety check, retrieval, reranking, assembly and verification


pub mod assembler;
pub mod context;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embeddings::{
    ChunkingConfig, EmbeddingMode, EmbeddingProvider, EmbeddingService, OllamaClient,
};
use crate::guard::{FlagKind, GuardConfig, HallucinationFlag, HallucinationGuard};
use crate::ingest::{IngestReport, Ingestor};
use crate::rerank::{RerankConfig, RerankOutcome, Reranker};
use crate::retrieval::{
    RetrievalCandidate, RetrievalConfig, RetrievalOptions, RetrievalOrchestrator,
    RetrievalOutcome, Retriever,
};
use crate::safety::{CRISIS_RESPONSE, SAFE_DEFAULT_REPLY, SafetyCheck};
use crate::store::{Metadata, Record, VectorStore};
use crate::{RecallError, Result};

pub use assembler::{AssembledResponse, AssemblyRequest, ResponseAssembler, TemplateAssembler};
pub use context::{AuditTrail, ConversationTurn, PipelineContext, PipelineState, Role};

/// Confidence of a stage that ran but had nothing to judge
const NEUTRAL_CONFIDENCE: f32 = 0.5;
const RERANK_FALLBACK_CONFIDENCE: f32 = 0.4;
const HEALTH_PROBE: &str = "health check";

/// Weights of each stage in the aggregate confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageWeights {
    pub retrieve: f32,
    pub rerank: f32,
    pub assemble: f32,
    pub verify: f32,
}

impl Default for StageWeights {
    #[inline]
    fn default() -> Self {
        Self {
            retrieve: 0.3,
            rerank: 0.2,
            assemble: 0.2,
            verify: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Conversation turns kept per request
    pub history_window: usize,
    pub retrieve_timeout_ms: u64,
    pub assemble_timeout_ms: u64,
    pub verify_timeout_ms: u64,
    pub stage_weights: StageWeights,
}

impl Default for PipelineConfig {
    #[inline]
    fn default() -> Self {
        Self {
            history_window: 10,
            retrieve_timeout_ms: 3000,
            assemble_timeout_ms: 2000,
            verify_timeout_ms: 3000,
            stage_weights: StageWeights::default(),
        }
    }
}

/// Result of one user turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResponse {
    pub text: String,
    pub confidence: f32,
    pub flags: Vec<HallucinationFlag>,
    pub audit: Vec<String>,
    pub short_circuited: bool,
    /// Knowledge record ids the reply drew on
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub per_stage: BTreeMap<String, bool>,
    pub embedding_mode: EmbeddingMode,
}

/// Shared flag a caller sets to abandon a turn between stages
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn ensure_active(&self, stage: PipelineState) -> Result<()> {
        if self.is_cancelled() {
            info!("Turn cancelled before {}", stage);
            return Err(RecallError::Cancelled);
        }
        Ok(())
    }
}

/// Assembles a [`PipelineOrchestrator`] from its parts
#[derive(Debug)]
pub struct PipelineBuilder {
    store: Arc<VectorStore>,
    embeddings: Arc<EmbeddingService>,
    retriever: Option<Arc<dyn Retriever>>,
    assembler: Option<Arc<dyn ResponseAssembler>>,
    retrieval: RetrievalConfig,
    rerank: RerankConfig,
    guard: GuardConfig,
    chunking: ChunkingConfig,
    batch_size: usize,
    pipeline: PipelineConfig,
}

impl PipelineBuilder {
    #[inline]
    #[must_use]
    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    #[inline]
    #[must_use]
    pub fn assembler(mut self, assembler: Arc<dyn ResponseAssembler>) -> Self {
        self.assembler = Some(assembler);
        self
    }

    #[inline]
    #[must_use]
    pub fn retrieval_config(mut self, config: RetrievalConfig) -> Self {
        self.retrieval = config;
        self
    }

    #[inline]
    #[must_use]
    pub fn rerank_config(mut self, config: RerankConfig) -> Self {
        self.rerank = config;
        self
    }

    #[inline]
    #[must_use]
    pub fn guard_config(mut self, config: GuardConfig) -> Self {
        self.guard = config;
        self
    }

    #[inline]
    #[must_use]
    pub fn chunking_config(mut self, config: ChunkingConfig, batch_size: usize) -> Self {
        self.chunking = config;
        self.batch_size = batch_size;
        self
    }

    #[inline]
    #[must_use]
    pub fn pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.pipeline = config;
        self
    }

    #[inline]
    pub fn build(self) -> Result<PipelineOrchestrator> {
        let safety = Arc::new(SafetyCheck::new()?);

        let retriever: Arc<dyn Retriever> = match self.retriever {
            Some(retriever) => retriever,
            None => Arc::new(RetrievalOrchestrator::new(
                Arc::clone(&self.store),
                Arc::clone(&self.embeddings),
                self.retrieval.clone(),
            )?),
        };

        let mut guard = HallucinationGuard::new(self.guard.clone(), Arc::clone(&safety))?;
        if self.guard.unverified_claims {
            guard = guard.with_knowledge(Arc::clone(&self.store), Arc::clone(&self.embeddings));
        }

        let assembler: Arc<dyn ResponseAssembler> = match self.assembler {
            Some(assembler) => assembler,
            None => Arc::new(TemplateAssembler::new()),
        };

        let ingestor = Ingestor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.embeddings),
            self.chunking,
            self.retrieval.collection.clone(),
        )
        .with_batch_size(self.batch_size);

        Ok(PipelineOrchestrator {
            reranker: Reranker::new(Arc::clone(&self.embeddings), self.rerank),
            retrieval_options: RetrievalOptions::from_config(&self.retrieval),
            store: self.store,
            embeddings: self.embeddings,
            retriever,
            guard,
            assembler,
            safety,
            ingestor,
            sessions: Mutex::new(HashMap::new()),
            config: self.pipeline,
        })
    }
}

/// Staged, fail-soft processing of user turns.
///
/// No stage failure escapes: each boundary catches the error, notes
/// `<stage>-error-fallback` in the audit trail and continues with the stage's
/// neutral output. Only caller cancellation ends a turn early with an error.
#[derive(Debug)]
pub struct PipelineOrchestrator {
    store: Arc<VectorStore>,
    embeddings: Arc<EmbeddingService>,
    retriever: Arc<dyn Retriever>,
    retrieval_options: RetrievalOptions,
    reranker: Reranker,
    guard: HallucinationGuard,
    assembler: Arc<dyn ResponseAssembler>,
    safety: Arc<SafetyCheck>,
    ingestor: Ingestor,
    /// Recent queries per session, oldest first
    sessions: Mutex<HashMap<String, VecDeque<String>>>,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    #[inline]
    pub fn builder(store: Arc<VectorStore>, embeddings: Arc<EmbeddingService>) -> PipelineBuilder {
        PipelineBuilder {
            store,
            embeddings,
            retriever: None,
            assembler: None,
            retrieval: RetrievalConfig::default(),
            rerank: RerankConfig::default(),
            guard: GuardConfig::default(),
            chunking: ChunkingConfig::default(),
            batch_size: 16,
            pipeline: PipelineConfig::default(),
        }
    }

    /// Build every component from loaded settings, with an empty store
    #[inline]
    pub fn from_config(config: &Config) -> Result<Self> {
        let provider: Option<Arc<dyn EmbeddingProvider>> = if config.ollama.enabled {
            Some(Arc::new(OllamaClient::new(&config.ollama)?))
        } else {
            None
        };
        let dimension = usize::try_from(config.ollama.embedding_dimension)
            .map_err(|e| RecallError::Config(format!("embedding dimension: {}", e)))?;
        let embeddings = Arc::new(EmbeddingService::new(
            provider,
            dimension,
            config.embedding.clone(),
        ));

        Self::builder(Arc::new(VectorStore::new()), embeddings)
            .retrieval_config(config.retrieval.clone())
            .rerank_config(config.rerank.clone())
            .guard_config(config.guard.clone())
            .chunking_config(config.chunking.clone(), config.ollama.batch_size as usize)
            .pipeline_config(config.pipeline.clone())
            .build()
    }

    #[inline]
    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    #[inline]
    pub fn embeddings(&self) -> &Arc<EmbeddingService> {
        &self.embeddings
    }

    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Chunk, embed and store knowledge in the retrieval collection
    #[inline]
    pub async fn add_content(&self, text: &str, metadata: Metadata) -> Result<IngestReport> {
        self.ingestor.ingest(text, metadata).await
    }

    /// Run one turn to completion
    #[inline]
    pub async fn retrieve_and_verify(
        &self,
        user_input: &str,
        history: &[ConversationTurn],
        session_id: &str,
    ) -> PipelineResponse {
        let never = CancelFlag::new();
        match self
            .retrieve_and_verify_cancellable(user_input, history, session_id, &never)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Turn ended without a response: {}", e);
                PipelineResponse {
                    text: SAFE_DEFAULT_REPLY.to_string(),
                    confidence: 0.0,
                    flags: Vec::new(),
                    audit: vec!["pipeline-error-fallback".to_string()],
                    short_circuited: false,
                    sources: Vec::new(),
                }
            }
        }
    }

    /// Run one turn, stopping between stages once `cancel` is set.
    ///
    /// An in-flight embedding call is not interrupted; it may still finish and
    /// populate the cache.
    #[inline]
    pub async fn retrieve_and_verify_cancellable(
        &self,
        user_input: &str,
        history: &[ConversationTurn],
        session_id: &str,
        cancel: &CancelFlag,
    ) -> Result<PipelineResponse> {
        let mut ctx =
            PipelineContext::new(user_input, history, self.config.history_window, session_id);
        let weights = &self.config.stage_weights;

        cancel.ensure_active(PipelineState::SafetyCheck)?;
        ctx.enter(PipelineState::SafetyCheck);
        let assessment = self.safety.assess(user_input);
        if assessment.is_crisis {
            ctx.enter(PipelineState::ShortCircuit);
            ctx.add_confidence(1.0, 1.0);
            ctx.enter(PipelineState::Done);
            info!(
                "Safety short-circuit for session '{}': {:?}",
                session_id, assessment.signals
            );
            return Ok(PipelineResponse {
                text: CRISIS_RESPONSE.to_string(),
                confidence: ctx.confidence(),
                flags: Vec::new(),
                audit: ctx.into_audit(),
                short_circuited: true,
                sources: Vec::new(),
            });
        }

        cancel.ensure_active(PipelineState::Retrieve)?;
        ctx.enter(PipelineState::Retrieve);
        let retrieval = match self.retrieve_stage(&mut ctx).await {
            Some(outcome) => {
                ctx.add_confidence(retrieval_confidence(&outcome), weights.retrieve);
                outcome
            }
            None => {
                ctx.add_confidence(0.0, weights.retrieve);
                RetrievalOutcome::empty()
            }
        };

        cancel.ensure_active(PipelineState::Rerank)?;
        ctx.enter(PipelineState::Rerank);
        let has_candidates = !retrieval.candidates.is_empty();
        let ranked = self.rerank_stage(&mut ctx, retrieval.candidates).await;
        if has_candidates {
            ctx.add_confidence(rerank_confidence(&ranked), weights.rerank);
        }

        cancel.ensure_active(PipelineState::Assemble)?;
        ctx.enter(PipelineState::Assemble);
        let request = AssemblyRequest {
            user_input,
            history: ctx.history(),
            concepts: &retrieval.concepts,
            context: &ranked.results,
        };
        let assembled = match tokio::time::timeout(
            Duration::from_millis(self.config.assemble_timeout_ms),
            self.assembler.assemble(&request),
        )
        .await
        {
            Ok(Ok(assembled)) => Some(assembled),
            Ok(Err(e)) => {
                warn!("Response assembly failed: {}", e);
                None
            }
            Err(_) => {
                warn!(
                    "Response assembly timed out after {}ms",
                    self.config.assemble_timeout_ms
                );
                None
            }
        };
        let assembly_failed = assembled.is_none();
        let (mut text, sources) = match assembled {
            Some(assembled) => {
                ctx.add_confidence(assembled.confidence, weights.assemble);
                (assembled.text, assembled.sources)
            }
            None => {
                ctx.record_fallback();
                ctx.add_confidence(0.0, weights.assemble);
                (SAFE_DEFAULT_REPLY.to_string(), Vec::new())
            }
        };

        cancel.ensure_active(PipelineState::Verify)?;
        ctx.enter(PipelineState::Verify);
        let flags = match tokio::time::timeout(
            Duration::from_millis(self.config.verify_timeout_ms),
            self.guard.scan(&text, user_input, ctx.history()),
        )
        .await
        {
            Ok(Ok(report)) => {
                ctx.add_confidence(report.confidence(), weights.verify);
                if report.has_critical() {
                    warn!("Discarding response with a critical flag");
                    ctx.record("verify-critical-rejected");
                    text = if report.has_kind(FlagKind::CrisisMismatch) {
                        CRISIS_RESPONSE.to_string()
                    } else {
                        SAFE_DEFAULT_REPLY.to_string()
                    };
                }
                for flag in report.flags.iter().filter(|f| !f.is_critical()) {
                    ctx.record(format!("flag:{}", flag.kind));
                }
                report.flags
            }
            Ok(Err(e)) => {
                warn!("Verification failed: {}", e);
                ctx.record_fallback();
                ctx.add_confidence(0.0, weights.verify);
                Vec::new()
            }
            Err(_) => {
                warn!(
                    "Verification timed out after {}ms",
                    self.config.verify_timeout_ms
                );
                ctx.record_fallback();
                ctx.add_confidence(0.0, weights.verify);
                Vec::new()
            }
        };

        ctx.enter(PipelineState::Done);
        let confidence = if assembly_failed {
            0.0
        } else {
            ctx.confidence()
        };
        debug!(
            "Turn finished with confidence {:.2} and {} flags",
            confidence,
            flags.len()
        );

        Ok(PipelineResponse {
            text,
            confidence,
            flags,
            audit: ctx.into_audit(),
            short_circuited: false,
            sources,
        })
    }

    /// `None` when retrieval failed or timed out
    async fn retrieve_stage(&self, ctx: &mut PipelineContext) -> Option<RetrievalOutcome> {
        let attempt = tokio::time::timeout(
            Duration::from_millis(self.config.retrieve_timeout_ms),
            self.retriever
                .try_retrieve(&ctx.user_input, ctx.history(), &self.retrieval_options),
        )
        .await;

        match attempt {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                warn!("Retrieval failed, continuing without context: {}", e);
                ctx.record_fallback();
                None
            }
            Err(_) => {
                warn!(
                    "Retrieval timed out after {}ms",
                    self.config.retrieve_timeout_ms
                );
                ctx.record_fallback();
                None
            }
        }
    }

    async fn rerank_stage(
        &self,
        ctx: &mut PipelineContext,
        candidates: Vec<RetrievalCandidate>,
    ) -> RerankOutcome {
        let window = self.session_queries(&ctx.session_id);
        let outcome = self
            .reranker
            .rerank(&ctx.user_input, candidates, &window)
            .await;
        self.remember_query(&ctx.session_id, &ctx.user_input);

        if outcome.used_fallback {
            ctx.record_fallback();
        }
        outcome
    }

    /// Previous queries of a session, oldest first
    #[inline]
    pub fn session_queries(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map(|queries| queries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the query window of a finished session
    #[inline]
    pub fn forget_session(&self, session_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    fn remember_query(&self, session_id: &str, query: &str) {
        let limit = self.reranker.config().context_window;
        if limit == 0 {
            return;
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let queries = sessions.entry(session_id.to_string()).or_default();
        queries.push_back(query.to_string());
        while queries.len() > limit {
            queries.pop_front();
        }
    }

    /// Probe each stage with a harmless input
    #[inline]
    pub async fn health_check(&self) -> HealthReport {
        let mut per_stage = BTreeMap::new();

        per_stage.insert(
            "safety-check".to_string(),
            !self.safety.assess(HEALTH_PROBE).is_crisis,
        );
        per_stage.insert("store".to_string(), self.store.stats().is_ok());

        let vector = self.embeddings.embed(HEALTH_PROBE).await;
        per_stage.insert(
            "embedding".to_string(),
            vector.len() == self.embeddings.dimension(),
        );

        let probe_options = RetrievalOptions {
            limit: 1,
            ..self.retrieval_options.clone()
        };
        let retrieval = self
            .retriever
            .try_retrieve(HEALTH_PROBE, &[], &probe_options)
            .await;
        if let Err(e) = &retrieval {
            warn!("Retrieval health probe failed: {}", e);
        }
        per_stage.insert("retrieve".to_string(), retrieval.is_ok());

        // One synthetic candidate so scoring and the deadline actually run
        let health_candidate = RetrievalCandidate {
            record: Record::new("health-check", vector, HEALTH_PROBE),
            semantic_score: 1.0,
            lexical_score: 1.0,
            retrieval_score: 1.0,
        };
        let rerank = self
            .reranker
            .rerank(HEALTH_PROBE, vec![health_candidate], &[])
            .await;
        per_stage.insert("rerank".to_string(), !rerank.used_fallback);

        let request = AssemblyRequest {
            user_input: HEALTH_PROBE,
            history: &[],
            concepts: &[],
            context: &[],
        };
        let assembled = self.assembler.assemble(&request).await;
        per_stage.insert("assemble".to_string(), assembled.is_ok());

        let verified = self.guard.scan(SAFE_DEFAULT_REPLY, HEALTH_PROBE, &[]).await;
        per_stage.insert("verify".to_string(), verified.is_ok());

        let healthy = per_stage.values().all(|ok| *ok);
        if !healthy {
            warn!("Pipeline health check failed: {:?}", per_stage);
        }

        HealthReport {
            healthy,
            per_stage,
            embedding_mode: self.embeddings.mode(),
        }
    }
}

fn retrieval_confidence(outcome: &RetrievalOutcome) -> f32 {
    if !outcome.was_applied {
        return NEUTRAL_CONFIDENCE;
    }
    mean(outcome.candidates.iter().map(|c| c.retrieval_score))
}

fn rerank_confidence(outcome: &RerankOutcome) -> f32 {
    if outcome.used_fallback {
        return RERANK_FALLBACK_CONFIDENCE;
    }
    if outcome.results.is_empty() {
        return NEUTRAL_CONFIDENCE;
    }
    mean(outcome.results.iter().map(|r| r.final_score))
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = values.fold((0.0_f32, 0_u32), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        return NEUTRAL_CONFIDENCE;
    }
    (sum / count as f32).clamp(0.0, 1.0)
}
