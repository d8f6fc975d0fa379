// Crisis and self-harm signal detection


use fancy_regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::Result;
use crate::text::{compile_pattern, pattern_matches};

/// Reply sent when a crisis signal short-circuits the pipeline
pub const CRISIS_RESPONSE: &str = "It sounds like you are going through something really painful, \
and your safety matters. Please reach out to a crisis line right now: in the US you can call or \
text 988, or contact your local emergency services. You don't have to face this alone, and \
talking to someone can help.";

/// Reply used when a response is discarded or every stage failed
pub const SAFE_DEFAULT_REPLY: &str = "Thank you for sharing that with me. I want to make sure I \
understand you properly. Could you tell me a little more about what's on your mind?";

const CRISIS_PATTERNS: &[(&str, &str)] = &[
    ("suicide", r"(?i)\bsuicid(e|al)\b"),
    ("kill-myself", r"(?i)\bkill(ing)?\s+my\s*self\b"),
    ("end-my-life", r"(?i)\bend(ing)?\s+(my|it)\s+(life|all)\b"),
    ("self-harm", r"(?i)\bself[\s-]?harm(ing)?\b"),
    ("hurt-myself", r"(?i)\b(hurt|cut|harm)(ing)?\s+my\s*self\b"),
    (
        "no-will-to-live",
        r"(?i)\b(don'?t|do\s+not|no\s+longer)\s+want\s+to\s+(live|be\s+alive|exist)\b",
    ),
    ("better-off-dead", r"(?i)\bbetter\s+off\s+dead\b"),
    ("overdose", r"(?i)\boverdos(e|ing)\b"),
];

const SUPPORT_PATTERNS: &[&str] = &[
    r"\b988\b",
    r"(?i)\bcrisis\s+(line|text\s+line|hotline|team)\b",
    r"(?i)\bhotline\b",
    r"(?i)\bemergency\s+services\b",
    r"(?i)\bcall\s+911\b",
    r"(?i)\b(mental\s+health\s+)?professional\b",
    r"(?i)\b(reach\s+out|talk)\s+to\s+(someone|a\s+(counsel+or|therapist|doctor))\b",
    r"(?i)\byour\s+safety\b",
];

/// Result of scanning a user turn for crisis signals
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SafetyAssessment {
    pub is_crisis: bool,
    /// Labels of the crisis patterns that matched
    pub signals: Vec<String>,
}

/// Pattern-based crisis detector
#[derive(Debug)]
pub struct SafetyCheck {
    crisis: Vec<(&'static str, Regex)>,
    support: Vec<Regex>,
}

impl SafetyCheck {
    #[inline]
    pub fn new() -> Result<Self> {
        let crisis = CRISIS_PATTERNS
            .iter()
            .map(|(label, pattern)| compile_pattern(pattern).map(|regex| (*label, regex)))
            .collect::<Result<Vec<_>>>()?;
        let support = SUPPORT_PATTERNS
            .iter()
            .map(|pattern| compile_pattern(pattern))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { crisis, support })
    }

    #[inline]
    pub fn assess(&self, text: &str) -> SafetyAssessment {
        let signals: Vec<String> = self
            .crisis
            .iter()
            .filter(|(_, regex)| pattern_matches(regex, text))
            .map(|(label, _)| (*label).to_string())
            .collect();

        if !signals.is_empty() {
            warn!("Crisis signals detected: {:?}", signals);
        }

        SafetyAssessment {
            is_crisis: !signals.is_empty(),
            signals,
        }
    }

    /// Whether a response points the user at safety resources or human support
    #[inline]
    pub fn offers_support(&self, response: &str) -> bool {
        self.support.iter().any(|regex| pattern_matches(regex, response))
    }
}
