use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

impl ConversationTurn {
    #[inline]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    #[inline]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineState {
    Start,
    SafetyCheck,
    ShortCircuit,
    Retrieve,
    Rerank,
    Assemble,
    Verify,
    Done,
}

impl PipelineState {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::SafetyCheck => "safety-check",
            Self::ShortCircuit => "short-circuit",
            Self::Retrieve => "retrieve",
            Self::Rerank => "rerank",
            Self::Assemble => "assemble",
            Self::Verify => "verify",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for PipelineState {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered names of the stages a turn engaged
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct AuditTrail {
    entries: Vec<String>,
}

impl AuditTrail {
    #[inline]
    pub fn push(&mut self, entry: impl Into<String>) {
        self.entries.push(entry.into());
    }

    #[inline]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    #[inline]
    pub fn contains(&self, entry: &str) -> bool {
        self.entries.iter().any(|e| e == entry)
    }

    #[inline]
    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StageConfidence {
    stage: PipelineState,
    confidence: f32,
    weight: f32,
}

/// Per-turn state. Created for one user turn and dropped when it completes.
#[derive(Debug)]
pub struct PipelineContext {
    pub user_input: String,
    pub session_id: String,
    history: Vec<ConversationTurn>,
    state: PipelineState,
    audit: AuditTrail,
    confidences: Vec<StageConfidence>,
}

impl PipelineContext {
    /// Keeps only the last `history_window` turns of `history`
    #[inline]
    pub fn new(
        user_input: &str,
        history: &[ConversationTurn],
        history_window: usize,
        session_id: &str,
    ) -> Self {
        let skip = history.len().saturating_sub(history_window);
        Self {
            user_input: user_input.to_string(),
            session_id: session_id.to_string(),
            history: history.iter().skip(skip).cloned().collect(),
            state: PipelineState::Start,
            audit: AuditTrail::default(),
            confidences: Vec::new(),
        }
    }

    #[inline]
    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    #[inline]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    #[inline]
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Move to `next` and record it in the audit trail
    #[inline]
    pub fn enter(&mut self, next: PipelineState) {
        debug!("Pipeline {} -> {}", self.state, next);
        self.state = next;
        if next != PipelineState::Done {
            self.audit.push(next.as_str());
        }
    }

    #[inline]
    pub fn record(&mut self, entry: impl Into<String>) {
        self.audit.push(entry);
    }

    /// Note that the current stage failed and continued with its neutral output
    #[inline]
    pub fn record_fallback(&mut self) {
        let entry = format!("{}-error-fallback", self.state);
        self.audit.push(entry);
    }

    #[inline]
    pub fn add_confidence(&mut self, confidence: f32, weight: f32) {
        self.confidences.push(StageConfidence {
            stage: self.state,
            confidence: confidence.clamp(0.0, 1.0),
            weight: weight.max(0.0),
        });
    }

    /// Confidence reported for `stage`, if it contributed one
    #[inline]
    pub fn stage_confidence(&self, stage: PipelineState) -> Option<f32> {
        self.confidences
            .iter()
            .find(|c| c.stage == stage)
            .map(|c| c.confidence)
    }

    /// Weighted average of stage confidences, capped at 1.0
    #[inline]
    pub fn confidence(&self) -> f32 {
        let total: f32 = self.confidences.iter().map(|c| c.weight).sum();
        if total <= f32::EPSILON {
            return 0.0;
        }
        let weighted: f32 = self
            .confidences
            .iter()
            .map(|c| c.confidence * c.weight)
            .sum();
        (weighted / total).min(1.0)
    }

    #[inline]
    pub fn into_audit(self) -> Vec<String> {
        self.audit.into_entries()
    }
}
