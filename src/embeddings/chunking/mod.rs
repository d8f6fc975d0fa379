
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::text;

/// A chunk of ingested text ready for embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChunk {
    /// The chunk text, including any overlap carried from the previous chunk
    pub content: String,
    /// The index of this chunk within its source text
    pub chunk_index: usize,
    /// Length of `content` in characters
    pub char_count: usize,
}

/// Configuration for content chunking, measured in characters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk size
    pub target_chunk_chars: usize,
    /// Characters of trailing context repeated at the start of the next chunk
    pub overlap_chars: usize,
    /// Chunks smaller than this are merged into their predecessor
    pub min_chunk_chars: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            target_chunk_chars: 512,
            overlap_chars: 64,
            min_chunk_chars: 64,
        }
    }
}

impl ChunkingConfig {
    /// Upper bound a merged chunk may reach
    fn max_chunk_chars(&self) -> usize {
        self.target_chunk_chars + self.target_chunk_chars / 2
    }
}

/// Chunk text into embedding-ready pieces.
///
/// Paragraphs are packed up to the target size; oversized paragraphs are
/// split at sentence boundaries and oversized sentences at word boundaries.
#[inline]
pub fn chunk_text(content: &str, config: &ChunkingConfig) -> Vec<ContentChunk> {
    let target = config.target_chunk_chars.max(1);
    let mut splits = Vec::new();
    let mut current = String::new();

    for paragraph in content.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }

        if char_len(paragraph) > target {
            for sentence in split_by_sentences(paragraph, target) {
                push_unit(&mut splits, &mut current, &sentence, " ", target);
            }
        } else {
            push_unit(&mut splits, &mut current, paragraph, "\n\n", target);
        }
    }

    if !current.trim().is_empty() {
        splits.push(current.trim().to_string());
    }

    let chunks = post_process_chunks(merge_small(splits, config), config);

    debug!(
        "Chunked {} characters into {} chunks",
        char_len(content),
        chunks.len()
    );

    chunks
}

fn push_unit(
    splits: &mut Vec<String>,
    current: &mut String,
    unit: &str,
    separator: &str,
    target: usize,
) {
    if !current.is_empty() && char_len(current) + separator.len() + char_len(unit) > target {
        splits.push(current.trim().to_string());
        current.clear();
    }
    if !current.is_empty() {
        current.push_str(separator);
    }
    current.push_str(unit);
}

/// Split a paragraph into sentence-aligned pieces no longer than `target`
fn split_by_sentences(paragraph: &str, target: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    for span in text::sentences(paragraph) {
        if char_len(span.text) > target {
            pieces.extend(split_by_words(span.text, target));
        } else {
            pieces.push(span.text.to_string());
        }
    }
    pieces
}

/// Split text by words as a last resort; a single overlong word is kept whole
fn split_by_words(text: &str, target: usize) -> Vec<String> {
    let mut splits = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        push_unit(&mut splits, &mut current, word, " ", target);
    }
    if !current.is_empty() {
        splits.push(current);
    }
    splits
}

/// Fold undersized pieces into their predecessor when the result stays bounded
fn merge_small(splits: Vec<String>, config: &ChunkingConfig) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(splits.len());

    for split in splits {
        let small = char_len(&split) < config.min_chunk_chars;
        match merged.last_mut() {
            Some(previous)
                if small && char_len(previous) + char_len(&split) + 1 <= config.max_chunk_chars() =>
            {
                previous.push(' ');
                previous.push_str(&split);
            }
            _ => merged.push(split),
        }
    }

    merged
}

fn post_process_chunks(splits: Vec<String>, config: &ChunkingConfig) -> Vec<ContentChunk> {
    let mut chunks = Vec::with_capacity(splits.len());
    let mut previous: Option<&str> = None;

    for (chunk_index, split) in splits.iter().enumerate() {
        let content = match previous.map(|p| extract_overlap_text(p, config.overlap_chars)) {
            Some(overlap) if !overlap.is_empty() => format!("{} {}", overlap, split),
            _ => split.clone(),
        };
        chunks.push(ContentChunk {
            char_count: char_len(&content),
            content,
            chunk_index,
        });
        previous = Some(split);
    }

    chunks
}

/// Trailing words of `content` fitting within `overlap_chars`
fn extract_overlap_text(content: &str, overlap_chars: usize) -> String {
    if overlap_chars == 0 {
        return String::new();
    }

    let mut taken: Vec<&str> = Vec::new();
    let mut length = 0;
    for word in content.split_whitespace().rev() {
        let added = char_len(word) + usize::from(!taken.is_empty());
        if length + added > overlap_chars {
            break;
        }
        length += added;
        taken.push(word);
    }

    // The whole chunk fits; repeating it adds nothing.
    if taken.len() == content.split_whitespace().count() {
        return String::new();
    }

    taken.reverse();
    taken.join(" ")
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
