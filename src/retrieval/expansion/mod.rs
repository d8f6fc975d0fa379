
use fancy_regex::Regex;
use itertools::Itertools;
use serde::Serialize;

use crate::Result;
use crate::pipeline::{ConversationTurn, Role};
use crate::text::{self, compile_pattern, pattern_matches};

/// Topics recognized in a user turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Concept {
    Anxiety,
    Grief,
    Depression,
    Stress,
    Loneliness,
    Sleep,
    Anger,
    Relationships,
    SelfWorth,
}

impl Concept {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anxiety => "anxiety",
            Self::Grief => "grief",
            Self::Depression => "depression",
            Self::Stress => "stress",
            Self::Loneliness => "loneliness",
            Self::Sleep => "sleep",
            Self::Anger => "anger",
            Self::Relationships => "relationships",
            Self::SelfWorth => "self-worth",
        }
    }
}

impl std::fmt::Display for Concept {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const CONCEPT_PATTERNS: &[(Concept, &str)] = &[
    (
        Concept::Anxiety,
        r"(?i)\b(anxi(ous|ety)|panic(king|ked)?|nervous|worr(y|ied|ying)|on edge)\b",
    ),
    (
        Concept::Grief,
        r"(?i)\b(grie(f|ve|ving)|mourn(ing)?|passed away|funeral|bereave\w*|lost my (mom|mother|dad|father|parent|wife|husband|partner|friend|brother|sister|son|daughter|dog|cat|pet))\b",
    ),
    (
        Concept::Depression,
        r"(?i)\b(depress(ed|ion|ing)?|hopeless|empty inside|numb|no motivation)\b",
    ),
    (
        Concept::Stress,
        r"(?i)\b(stress(ed|ful)?|overwhelm(ed|ing)?|burn(ed|t)[ -]?out|under pressure)\b",
    ),
    (
        Concept::Loneliness,
        r"(?i)\b(lonel(y|iness)|isolated|all alone|no friends|no one to talk to)\b",
    ),
    (
        Concept::Sleep,
        r"(?i)\b(insomnia|can'?t sleep|sleep(ing|less)?|nightmares?|exhausted)\b",
    ),
    (
        Concept::Anger,
        r"(?i)\b(angry|anger|furious|rage|irritat(ed|ing)|frustrat(ed|ing|ion))\b",
    ),
    (
        Concept::Relationships,
        r"(?i)\b(break ?up|broke up|divorce|boyfriend|girlfriend|marriage|my partner)\b",
    ),
    (
        Concept::SelfWorth,
        r"(?i)\b(worthless|not good enough|hate myself|self[- ]?esteem|a failure)\b",
    ),
];

/// Domain synonyms keyed by a lowercase query token
const SYNONYMS: &[(&str, &[&str])] = &[
    ("anxious", &["anxiety", "worry", "nervous", "panic"]),
    ("anxiety", &["anxious", "worry", "nervous", "panic"]),
    ("worried", &["worry", "anxiety"]),
    ("panic", &["anxiety", "breathing", "calm"]),
    ("stress", &["pressure", "overwhelm", "tension", "burnout"]),
    ("stressed", &["stress", "pressure", "overwhelm", "tension"]),
    ("overwhelmed", &["stress", "overwhelm", "pressure"]),
    ("sad", &["sadness", "unhappy", "low", "depressed"]),
    ("depressed", &["depression", "sadness", "hopeless", "low mood"]),
    ("depression", &["depressed", "sadness", "hopeless", "low mood"]),
    ("grief", &["loss", "bereavement", "mourning", "grieving"]),
    ("grieving", &["grief", "loss", "bereavement", "mourning"]),
    ("lonely", &["loneliness", "isolation", "alone", "connection"]),
    ("loneliness", &["lonely", "isolation", "alone", "connection"]),
    ("sleep", &["rest", "insomnia", "bedtime", "tired"]),
    ("insomnia", &["sleep", "rest", "bedtime"]),
    ("tired", &["exhausted", "fatigue", "sleep"]),
    ("angry", &["anger", "frustration", "irritation"]),
    ("anger", &["angry", "frustration", "irritation"]),
    ("work", &["job", "workplace", "career", "deadline"]),
    ("job", &["work", "workplace", "career"]),
    ("scared", &["fear", "afraid", "anxiety"]),
    ("breakup", &["relationship", "heartbreak", "partner"]),
];

/// Query terms after expansion
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ExpandedQuery {
    pub original: String,
    /// Content tokens of the query itself
    pub tokens: Vec<String>,
    /// Synonyms added from the domain table
    pub expansions: Vec<String>,
    /// Content tokens folded in from recent user turns
    pub history_terms: Vec<String>,
    pub concepts: Vec<Concept>,
}

impl ExpandedQuery {
    /// Every distinct term, query tokens first
    #[inline]
    pub fn terms(&self) -> Vec<String> {
        self.tokens
            .iter()
            .chain(&self.expansions)
            .chain(&self.history_terms)
            .cloned()
            .unique()
            .collect()
    }
}

#[derive(Debug)]
pub struct QueryExpander {
    concepts: Vec<(Concept, Regex)>,
    min_token_len: usize,
    history_turns: usize,
}

impl QueryExpander {
    #[inline]
    pub fn new(min_token_len: usize, history_turns: usize) -> Result<Self> {
        let concepts = CONCEPT_PATTERNS
            .iter()
            .map(|(concept, pattern)| compile_pattern(pattern).map(|regex| (*concept, regex)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            concepts,
            min_token_len,
            history_turns,
        })
    }

    /// Concepts whose detector matches `text`, in declaration order
    #[inline]
    pub fn detect_concepts(&self, text: &str) -> Vec<Concept> {
        self.concepts
            .iter()
            .filter(|(_, regex)| pattern_matches(regex, text))
            .map(|(concept, _)| *concept)
            .collect()
    }

    #[inline]
    pub fn expand(
        &self,
        query: &str,
        history: &[ConversationTurn],
        include_history: bool,
    ) -> ExpandedQuery {
        let tokens = text::content_tokens(query, self.min_token_len);

        let expansions: Vec<String> = tokens
            .iter()
            .filter_map(|token| {
                SYNONYMS
                    .iter()
                    .find(|(key, _)| key == token)
                    .map(|(_, synonyms)| *synonyms)
            })
            .flatten()
            .map(|s| (*s).to_string())
            .filter(|s| !tokens.contains(s))
            .unique()
            .collect();

        let history_terms: Vec<String> = if include_history {
            let recent: Vec<&ConversationTurn> = history
                .iter()
                .rev()
                .filter(|turn| turn.role == Role::User)
                .take(self.history_turns)
                .collect();
            recent
                .into_iter()
                .rev()
                .flat_map(|turn| text::content_tokens(&turn.text, self.min_token_len))
                .filter(|t| !tokens.contains(t) && !expansions.contains(t))
                .unique()
                .collect()
        } else {
            Vec::new()
        };

        ExpandedQuery {
            original: query.to_string(),
            concepts: self.detect_concepts(query),
            tokens,
            expansions,
            history_terms,
        }
    }
}
