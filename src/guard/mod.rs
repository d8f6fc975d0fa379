// Hallucination guard
// Pattern detectors that flag fabricated memory, false continuity, repetition,
// token corruption, crisis mismatches and unverified claims in a candidate reply


mod detectors;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::embeddings::EmbeddingService;
use crate::pipeline::ConversationTurn;
use crate::safety::SafetyCheck;
use crate::store::VectorStore;
use crate::text;
use crate::{RecallError, Result};

pub use detectors::{
    CrisisMismatchDetector, FalseContinuityDetector, FalseMemoryDetector, RepetitionDetector,
    TokenCorruptionDetector,
};

/// What a flag claims is wrong with a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlagKind {
    FalseMemory,
    FalseContinuity,
    Repetition,
    TokenCorruption,
    UnverifiedClaim,
    CrisisMismatch,
}

impl FlagKind {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FalseMemory => "false-memory",
            Self::FalseContinuity => "false-continuity",
            Self::Repetition => "repetition",
            Self::TokenCorruption => "token-corruption",
            Self::UnverifiedClaim => "unverified-claim",
            Self::CrisisMismatch => "crisis-mismatch",
        }
    }
}

impl std::fmt::Display for FlagKind {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Confidence removed from the verify stage per flag of this severity
    #[inline]
    pub fn penalty(self) -> f32 {
        match self {
            Self::Low => 0.05,
            Self::Medium => 0.15,
            Self::High => 0.3,
            Self::Critical => 1.0,
        }
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part of the response a flag points at, as byte offsets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl AffectedSpan {
    #[inline]
    pub fn new(start: usize, text: &str) -> Self {
        Self {
            start,
            end: start + text.len(),
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HallucinationFlag {
    #[serde(rename = "type")]
    pub kind: FlagKind,
    pub severity: Severity,
    /// Detector confidence in [0, 1]
    pub confidence: f32,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_span: Option<AffectedSpan>,
}

impl HallucinationFlag {
    #[inline]
    pub fn new(
        kind: FlagKind,
        severity: Severity,
        confidence: f32,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            description: description.into(),
            affected_span: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_span(mut self, span: AffectedSpan) -> Self {
        self.affected_span = Some(span);
        self
    }

    #[inline]
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Everything a detector may look at
#[derive(Debug, Clone, Copy)]
pub struct ScanInput<'a> {
    pub response: &'a str,
    pub user_input: &'a str,
    /// Turns before the current user input, oldest first
    pub history: &'a [ConversationTurn],
}

/// A single pattern-based check over a candidate response
pub trait Detector: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> FlagKind;

    fn detect(&self, input: &ScanInput<'_>) -> Vec<HallucinationFlag>;
}

/// Detector switches and thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub false_memory: bool,
    pub false_continuity: bool,
    pub repetition: bool,
    pub token_corruption: bool,
    pub crisis_mismatch: bool,
    /// Check response sentences against the knowledge collection
    pub unverified_claims: bool,
    pub claim_similarity_threshold: f32,
    pub knowledge_collection: String,
    /// Histories at most this long count as a conversation that just started
    pub new_conversation_turns: usize,
    /// Earlier user turns also checked for crisis signals
    pub crisis_lookback_turns: usize,
    /// Sentences with fewer content tokens are not treated as claims
    pub min_claim_tokens: usize,
}

impl Default for GuardConfig {
    #[inline]
    fn default() -> Self {
        Self {
            false_memory: true,
            false_continuity: true,
            repetition: true,
            token_corruption: true,
            crisis_mismatch: true,
            unverified_claims: false,
            claim_similarity_threshold: 0.7,
            knowledge_collection: "knowledge".to_string(),
            new_conversation_turns: 2,
            crisis_lookback_turns: 1,
            min_claim_tokens: 4,
        }
    }
}

/// Flags produced by one scan
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScanReport {
    pub flags: Vec<HallucinationFlag>,
}

impl ScanReport {
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.flags.is_empty()
    }

    #[inline]
    pub fn has_critical(&self) -> bool {
        self.flags.iter().any(HallucinationFlag::is_critical)
    }

    #[inline]
    pub fn max_severity(&self) -> Option<Severity> {
        self.flags.iter().map(|f| f.severity).max()
    }

    #[inline]
    pub fn has_kind(&self, kind: FlagKind) -> bool {
        self.flags.iter().any(|f| f.kind == kind)
    }

    /// Fail with the first critical flag, if any
    #[inline]
    pub fn ensure_no_critical(&self) -> Result<()> {
        match self.flags.iter().find(|f| f.is_critical()) {
            Some(flag) => Err(RecallError::CriticalHallucination(format!(
                "{}: {}",
                flag.kind, flag.description
            ))),
            None => Ok(()),
        }
    }

    /// Verify-stage confidence after severity penalties
    #[inline]
    pub fn confidence(&self) -> f32 {
        let penalty: f32 = self
            .flags
            .iter()
            .map(|f| f.severity.penalty() * f.confidence)
            .sum();
        (1.0 - penalty).clamp(0.0, 1.0)
    }
}

#[derive(Debug)]
struct ClaimVerifier {
    store: Arc<VectorStore>,
    embeddings: Arc<EmbeddingService>,
}

/// Scans candidate responses before they reach the user
#[derive(Debug)]
pub struct HallucinationGuard {
    config: GuardConfig,
    detectors: Vec<Box<dyn Detector>>,
    verifier: Option<ClaimVerifier>,
}

impl HallucinationGuard {
    /// Build the guard with every detector the config enables
    #[inline]
    pub fn new(config: GuardConfig, safety: Arc<SafetyCheck>) -> Result<Self> {
        let mut detectors: Vec<Box<dyn Detector>> = Vec::new();
        if config.false_memory {
            detectors.push(Box::new(FalseMemoryDetector::new(
                config.new_conversation_turns,
            )?));
        }
        if config.false_continuity {
            detectors.push(Box::new(FalseContinuityDetector::new(
                config.new_conversation_turns,
            )?));
        }
        if config.repetition {
            detectors.push(Box::new(RepetitionDetector::new()?));
        }
        if config.token_corruption {
            detectors.push(Box::new(TokenCorruptionDetector::new()?));
        }
        if config.crisis_mismatch {
            detectors.push(Box::new(CrisisMismatchDetector::new(
                safety,
                config.crisis_lookback_turns,
            )));
        }

        debug!("Hallucination guard built with {} detectors", detectors.len());
        Ok(Self {
            config,
            detectors,
            verifier: None,
        })
    }

    /// Enable the unverified-claim check against a knowledge collection
    #[inline]
    #[must_use]
    pub fn with_knowledge(mut self, store: Arc<VectorStore>, embeddings: Arc<EmbeddingService>) -> Self {
        self.verifier = Some(ClaimVerifier { store, embeddings });
        self
    }

    /// Add a custom detector
    #[inline]
    #[must_use]
    pub fn with_detector(mut self, detector: Box<dyn Detector>) -> Self {
        self.detectors.push(detector);
        self
    }

    #[inline]
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    #[inline]
    pub fn detector_kinds(&self) -> Vec<FlagKind> {
        self.detectors.iter().map(|d| d.kind()).collect()
    }

    /// Run the synchronous pattern detectors only
    #[inline]
    pub fn scan_patterns(
        &self,
        response: &str,
        user_input: &str,
        history: &[ConversationTurn],
    ) -> Vec<HallucinationFlag> {
        let input = ScanInput {
            response,
            user_input,
            history,
        };
        self.detectors
            .iter()
            .flat_map(|detector| detector.detect(&input))
            .collect()
    }

    /// Run every enabled detector, including claim verification when configured
    #[inline]
    pub async fn scan(
        &self,
        response: &str,
        user_input: &str,
        history: &[ConversationTurn],
    ) -> Result<ScanReport> {
        let mut flags = self.scan_patterns(response, user_input, history);
        if self.config.unverified_claims {
            flags.extend(self.verify_claims(response).await?);
        }

        if flags.iter().any(HallucinationFlag::is_critical) {
            warn!("Critical hallucination flag raised");
        } else if !flags.is_empty() {
            info!("Response carries {} advisory flags", flags.len());
        }
        Ok(ScanReport { flags })
    }

    /// Flag declarative sentences with no close neighbor in the knowledge collection
    #[inline]
    pub async fn verify_claims(&self, response: &str) -> Result<Vec<HallucinationFlag>> {
        let Some(verifier) = &self.verifier else {
            debug!("No knowledge store attached, skipping claim verification");
            return Ok(Vec::new());
        };
        let collection = &self.config.knowledge_collection;
        if verifier.store.dimension(collection)?.is_none() {
            debug!("Knowledge collection '{}' does not exist", collection);
            return Ok(Vec::new());
        }

        let mut flags = Vec::new();
        for sentence in text::sentences(response) {
            if sentence.text.ends_with('?')
                || text::content_tokens(sentence.text, 3).len() < self.config.min_claim_tokens
            {
                continue;
            }

            let vector = verifier.embeddings.embed(sentence.text).await;
            let nearest = verifier
                .store
                .search(collection, &vector, 1, -1.0)?
                .first()
                .map_or(0.0, |hit| hit.score);

            if nearest < self.config.claim_similarity_threshold {
                flags.push(
                    HallucinationFlag::new(
                        FlagKind::UnverifiedClaim,
                        Severity::Medium,
                        (self.config.claim_similarity_threshold - nearest).clamp(0.0, 1.0),
                        format!("No supporting knowledge found (best similarity {:.2})", nearest),
                    )
                    .with_span(AffectedSpan::new(sentence.start, sentence.text)),
                );
            }
        }
        Ok(flags)
    }
}
