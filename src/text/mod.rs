// Text utilities shared by query expansion, reranking and the hallucination guard

#[cfg(test)]
mod tests;

use fancy_regex::Regex;
use itertools::Itertools;
use tracing::debug;

use crate::{RecallError, Result};

/// English stop words dropped before matching
pub const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "am", "an", "and", "any", "are", "as", "at",
    "be", "because", "been", "before", "being", "below", "between", "both", "but", "by", "can",
    "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for", "from",
    "further", "had", "has", "have", "having", "he", "her", "here", "hers", "him", "his", "how",
    "i", "if", "in", "into", "is", "it", "its", "itself", "just", "me", "more", "most", "my",
    "myself", "no", "nor", "not", "now", "of", "off", "on", "once", "only", "or", "other", "our",
    "ours", "out", "over", "own", "really", "same", "she", "should", "so", "some", "such", "than",
    "that", "the", "their", "theirs", "them", "then", "there", "these", "they", "this", "those",
    "through", "to", "too", "under", "until", "up", "very", "was", "we", "were", "what", "when",
    "where", "which", "while", "who", "whom", "why", "will", "with", "would", "you", "your",
    "yours", "yourself", "im", "ive", "dont", "cant", "feel", "feeling", "like", "get", "got",
    "know", "think", "want",
];

/// Byte span of a sentence within its source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span<'a> {
    pub start: usize,
    pub end: usize,
    pub text: &'a str,
}

#[inline]
pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

/// Lowercase alphanumeric tokens in order of appearance.
///
/// Apostrophes are dropped so "don't" becomes "dont".
#[inline]
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace(['\'', '\u{2019}'], "")
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Distinct non-stop-word tokens at least `min_len` characters long,
/// in order of first appearance.
#[inline]
pub fn content_tokens(text: &str, min_len: usize) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| t.chars().count() >= min_len && !is_stop_word(t))
        .unique()
        .collect()
}

/// Split text into sentences at `.`, `!`, `?` (and runs of them) followed by
/// whitespace or the end of input. Empty sentences are skipped.
#[inline]
pub fn sentences(text: &str) -> Vec<Span<'_>> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?' | '\n') {
            continue;
        }
        // Swallow the rest of a terminator run such as "?!" or "...".
        let mut end = idx + c.len_utf8();
        while let Some(&(next_idx, next)) = chars.peek() {
            if matches!(next, '.' | '!' | '?') {
                end = next_idx + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let at_boundary = chars.peek().is_none_or(|(_, next)| next.is_whitespace());
        if c == '\n' || at_boundary {
            push_span(text, start, end, &mut spans);
            start = end;
        }
    }
    push_span(text, start, text.len(), &mut spans);
    spans
}

fn push_span<'a>(text: &'a str, start: usize, end: usize, spans: &mut Vec<Span<'a>>) {
    let Some(raw) = text.get(start..end) else {
        return;
    };
    let trimmed_start = raw.len() - raw.trim_start().len();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    let span_start = start + trimmed_start;
    spans.push(Span {
        start: span_start,
        end: span_start + trimmed.len(),
        text: trimmed,
    });
}

/// Lowercase, strip punctuation and collapse whitespace for comparisons
#[inline]
pub fn normalize(text: &str) -> String {
    tokenize(text).join(" ")
}

pub(crate) fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| RecallError::Pattern(format!("{}: {}", pattern, e)))
}

/// Match, treating a backtracking-limit error as no match
pub(crate) fn pattern_matches(regex: &Regex, text: &str) -> bool {
    regex.is_match(text).unwrap_or_else(|e| {
        debug!("Pattern {} failed to evaluate: {}", regex.as_str(), e);
        false
    })
}
