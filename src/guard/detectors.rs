use fancy_regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::{AffectedSpan, Detector, FlagKind, HallucinationFlag, ScanInput, Severity};
use crate::Result;
use crate::pipeline::Role;
use crate::safety::SafetyCheck;
use crate::text::{self, compile_pattern};

const FALSE_MEMORY_PATTERNS: &[&str] = &[
    r"(?i)\byou(?:'ve| have)? (?:mentioned|said|told me|shared|brought up)(?: that)? (?:before|earlier|previously|last time)\b",
    r"(?i)\bas you (?:mentioned|said|told me|shared)\b",
    r"(?i)\bi remember (?:you|when you|that you)\b",
    r"(?i)\blast time (?:you|we)\b",
    r"(?i)\byou(?:'ve| have) told me\b",
];

const FALSE_CONTINUITY_PATTERNS: &[&str] = &[
    r"(?i)\bas we (?:were |have been )?(?:discuss(?:ed|ing)|talk(?:ed|ing) about)\b",
    r"(?i)\b(?:continuing|to continue) (?:our|where we)\b",
    r"(?i)\bpick(?:ing)? up where we left off\b",
    r"(?i)\b(?:back|returning|coming back) to (?:what we|our) (?:discuss|talk|conversation)\w*",
    r"(?i)\bour (?:ongoing|previous|earlier|last) (?:conversations?|discussions?|sessions?|chats?)\b",
    r"(?i)\blike we talked about\b",
];

const REPETITION_TEMPLATES: &[&str] = &[
    r"(?s)\b(I hear (?:that )?you(?:'re| are) (?:dealing with|going through|feeling|struggling with) \w+(?: \w+){0,4})\b.*?\b\1\b",
    r"(?s)\b(It sounds like you(?:'re| are) \w+(?: \w+){0,4})\b.*?\b\1\b",
];

const CORRUPTION_PATTERNS: &[(&str, &str)] = &[
    (
        "ellipsis mid-sentence followed by a new capitalized fragment",
        r"[a-z,;](?:\.\.\.|…) ?[A-Z]",
    ),
    ("word repeated three or more times", r"(?i)\b(\w+)(?:\s+\1\b){2,}"),
];

fn compile_all(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| compile_pattern(p)).collect()
}

/// Span of the first match, treating evaluation errors as no match
fn first_match(regex: &Regex, haystack: &str) -> Option<AffectedSpan> {
    match regex.find(haystack) {
        Ok(found) => found.map(|m| AffectedSpan::new(m.start(), m.as_str())),
        Err(e) => {
            debug!("Pattern {} failed to evaluate: {}", regex.as_str(), e);
            None
        }
    }
}

fn first_match_any(regexes: &[Regex], haystack: &str) -> Option<AffectedSpan> {
    regexes.iter().find_map(|regex| first_match(regex, haystack))
}

/// Claims of remembered user details in a conversation too short to have them
#[derive(Debug)]
pub struct FalseMemoryDetector {
    patterns: Vec<Regex>,
    max_history: usize,
}

impl FalseMemoryDetector {
    #[inline]
    pub fn new(max_history: usize) -> Result<Self> {
        Ok(Self {
            patterns: compile_all(FALSE_MEMORY_PATTERNS)?,
            max_history,
        })
    }
}

impl Detector for FalseMemoryDetector {
    fn kind(&self) -> FlagKind {
        FlagKind::FalseMemory
    }

    fn detect(&self, input: &ScanInput<'_>) -> Vec<HallucinationFlag> {
        if input.history.len() > self.max_history {
            return Vec::new();
        }
        first_match_any(&self.patterns, input.response)
            .map(|span| {
                HallucinationFlag::new(
                    FlagKind::FalseMemory,
                    Severity::High,
                    0.85,
                    format!(
                        "Response recalls earlier details but the conversation has {} prior turns",
                        input.history.len()
                    ),
                )
                .with_span(span)
            })
            .into_iter()
            .collect()
    }
}

/// Talk of an ongoing discussion in a conversation that just started
#[derive(Debug)]
pub struct FalseContinuityDetector {
    patterns: Vec<Regex>,
    max_history: usize,
}

impl FalseContinuityDetector {
    #[inline]
    pub fn new(max_history: usize) -> Result<Self> {
        Ok(Self {
            patterns: compile_all(FALSE_CONTINUITY_PATTERNS)?,
            max_history,
        })
    }
}

impl Detector for FalseContinuityDetector {
    fn kind(&self) -> FlagKind {
        FlagKind::FalseContinuity
    }

    fn detect(&self, input: &ScanInput<'_>) -> Vec<HallucinationFlag> {
        let (severity, confidence) = if input.history.is_empty() {
            (Severity::High, 0.9)
        } else if input.history.len() <= self.max_history {
            (Severity::Medium, 0.7)
        } else {
            return Vec::new();
        };

        first_match_any(&self.patterns, input.response)
            .map(|span| {
                HallucinationFlag::new(
                    FlagKind::FalseContinuity,
                    severity,
                    confidence,
                    "Response implies an ongoing discussion in a new conversation",
                )
                .with_span(span)
            })
            .into_iter()
            .collect()
    }
}

/// Repeated sentences and known repetition templates
#[derive(Debug)]
pub struct RepetitionDetector {
    templates: Vec<Regex>,
}

impl RepetitionDetector {
    #[inline]
    pub fn new() -> Result<Self> {
        Ok(Self {
            templates: compile_all(REPETITION_TEMPLATES)?,
        })
    }
}

impl Detector for RepetitionDetector {
    fn kind(&self) -> FlagKind {
        FlagKind::Repetition
    }

    fn detect(&self, input: &ScanInput<'_>) -> Vec<HallucinationFlag> {
        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        let mut flags = Vec::new();

        for sentence in text::sentences(input.response) {
            let normalized = text::normalize(sentence.text);
            if normalized.is_empty() {
                continue;
            }
            if !seen.insert(normalized.clone()) && reported.insert(normalized) {
                flags.push(
                    HallucinationFlag::new(
                        FlagKind::Repetition,
                        Severity::High,
                        0.9,
                        "Sentence repeated in response",
                    )
                    .with_span(AffectedSpan::new(sentence.start, sentence.text)),
                );
            }
        }

        if flags.is_empty() {
            if let Some(span) = first_match_any(&self.templates, input.response) {
                flags.push(
                    HallucinationFlag::new(
                        FlagKind::Repetition,
                        Severity::High,
                        0.8,
                        "Response repeats a reflective phrase",
                    )
                    .with_span(span),
                );
            }
        }
        flags
    }
}

/// Fragments that look like truncated or garbled generation
#[derive(Debug)]
pub struct TokenCorruptionDetector {
    patterns: Vec<(&'static str, Regex)>,
}

impl TokenCorruptionDetector {
    #[inline]
    pub fn new() -> Result<Self> {
        let patterns = CORRUPTION_PATTERNS
            .iter()
            .map(|(label, pattern)| compile_pattern(pattern).map(|regex| (*label, regex)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }
}

impl Detector for TokenCorruptionDetector {
    fn kind(&self) -> FlagKind {
        FlagKind::TokenCorruption
    }

    fn detect(&self, input: &ScanInput<'_>) -> Vec<HallucinationFlag> {
        self.patterns
            .iter()
            .filter_map(|(label, regex)| {
                first_match(regex, input.response).map(|span| {
                    HallucinationFlag::new(FlagKind::TokenCorruption, Severity::Low, 0.6, *label)
                        .with_span(span)
                })
            })
            .collect()
    }
}

/// A crisis disclosure answered without any safety or support language
#[derive(Debug)]
pub struct CrisisMismatchDetector {
    safety: Arc<SafetyCheck>,
    lookback_turns: usize,
}

impl CrisisMismatchDetector {
    #[inline]
    pub fn new(safety: Arc<SafetyCheck>, lookback_turns: usize) -> Self {
        Self {
            safety,
            lookback_turns,
        }
    }
}

impl Detector for CrisisMismatchDetector {
    fn kind(&self) -> FlagKind {
        FlagKind::CrisisMismatch
    }

    fn detect(&self, input: &ScanInput<'_>) -> Vec<HallucinationFlag> {
        let mut signals = self.safety.assess(input.user_input).signals;
        for turn in input
            .history
            .iter()
            .rev()
            .filter(|turn| turn.role == Role::User)
            .take(self.lookback_turns)
        {
            signals.extend(self.safety.assess(&turn.text).signals);
        }

        if signals.is_empty() || self.safety.offers_support(input.response) {
            return Vec::new();
        }

        signals.sort_unstable();
        signals.dedup();
        vec![HallucinationFlag::new(
            FlagKind::CrisisMismatch,
            Severity::Critical,
            0.95,
            format!(
                "User turn carries crisis signals ({}) but the response offers no support",
                signals.join(", ")
            ),
        )]
    }
}
