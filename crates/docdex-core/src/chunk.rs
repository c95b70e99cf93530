//! Sliding-window text chunker.
//!
//! Splits a unit's text into windows of `chunk_size` words, where each
//! window starts `chunk_size - chunk_overlap` words after the previous
//! one. Boundaries always fall on whitespace, so no word is ever split,
//! and every chunk is a verbatim slice of the input (internal
//! whitespace, including newlines in source code, is preserved).
//!
//! # Algorithm
//!
//! 1. Locate word spans (maximal runs of non-whitespace characters).
//! 2. Emit words `[start, min(start + size, n))` as one chunk.
//! 3. Stop once a chunk reaches the final word; otherwise advance
//!    `start` by the stride and repeat.
//!
//! # Example
//!
//! ```rust
//! use docdex_core::chunk::{chunk_text, ChunkConfig};
//!
//! let config = ChunkConfig::new(4, 1).unwrap();
//! let chunks = chunk_text("one two three four five six seven", &config);
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[0].text, "one two three four");
//! assert_eq!(chunks[1].text, "four five six seven");
//! ```

use std::ops::Range;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::IndexError;
use crate::models::UnitLocator;

/// Namespace for chunk identifiers.
const CHUNK_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_3c2e_9d4a_4f7b_8e21_5a0c_d3e9_7f14);

/// Validated chunking parameters, measured in words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl ChunkConfig {
    /// Fails with [`IndexError::Validation`] unless `0 <= overlap < size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(IndexError::Validation("chunk_size must be at least 1".into()).into());
        }
        if chunk_overlap >= chunk_size {
            return Err(IndexError::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap, chunk_size
            ))
            .into());
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    /// Words between the starts of consecutive chunks.
    pub fn stride(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }

    /// Number of chunks produced for a text of `words` words.
    pub fn expected_chunks(&self, words: usize) -> usize {
        if words == 0 {
            0
        } else if words <= self.chunk_size {
            1
        } else {
            1 + (words - self.chunk_size).div_ceil(self.stride())
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 100,
        }
    }
}

/// One window of a unit's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Position within the unit, contiguous from 0.
    pub index: usize,
    pub text: String,
    pub word_count: usize,
    /// Byte range of `text` within the input.
    pub span: Range<usize>,
}

/// Split `text` into overlapping word windows.
///
/// Empty or whitespace-only text yields no chunks; text no longer than
/// one window yields exactly one.
pub fn chunk_text(text: &str, config: &ChunkConfig) -> Vec<TextChunk> {
    let words = word_spans(text);
    if words.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::with_capacity(config.expected_chunks(words.len()));
    let mut start = 0;
    loop {
        let end = (start + config.chunk_size).min(words.len());
        let span = words[start].start..words[end - 1].end;
        chunks.push(TextChunk {
            index: chunks.len(),
            text: text[span.clone()].to_string(),
            word_count: end - start,
            span,
        });
        if end == words.len() {
            break;
        }
        start += config.stride();
    }
    chunks
}

fn word_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push(s..i);
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push(s..text.len());
    }
    spans
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Newline count plus one; zero for empty text.
pub fn count_lines(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        text.matches('\n').count() + 1
    }
}

/// Deterministic chunk id: the same source, unit and position always map
/// to the same id, so re-indexing unchanged content is idempotent.
pub fn chunk_id(source_name: &str, locator: &UnitLocator, chunk_index: usize) -> String {
    let key = format!("{}\0{}\0{}", source_name, locator.as_str(), chunk_index);
    Uuid::new_v5(&CHUNK_ID_NAMESPACE, key.as_bytes()).to_string()
}

/// SHA-256 hex digest of chunk content.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_config_rejects_overlap_not_smaller() {
        assert!(ChunkConfig::new(100, 100).is_err());
        assert!(ChunkConfig::new(100, 150).is_err());
        assert!(ChunkConfig::new(0, 0).is_err());
        assert!(ChunkConfig::new(100, 0).is_ok());
    }

    #[test]
    fn test_empty_text() {
        let config = ChunkConfig::new(10, 2).unwrap();
        assert!(chunk_text("", &config).is_empty());
        assert!(chunk_text("  \n\t ", &config).is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let config = ChunkConfig::new(200, 50).unwrap();
        let chunks = chunk_text("  Hello world.  ", &config);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world.");
        assert_eq!(chunks[0].word_count, 2);
    }

    #[test]
    fn test_five_hundred_words_three_chunks() {
        let config = ChunkConfig::new(200, 50).unwrap();
        let chunks = chunk_text(&words(500), &config);
        assert_eq!(chunks.len(), 3);
        assert_eq!(config.expected_chunks(500), 3);
        let counts: Vec<usize> = chunks.iter().map(|c| c.word_count).collect();
        assert_eq!(counts, vec![200, 200, 200]);
    }

    #[test]
    fn test_adjacent_chunks_share_overlap() {
        let config = ChunkConfig::new(7, 3).unwrap();
        let chunks = chunk_text(&words(31), &config);
        for pair in chunks.windows(2) {
            let prev: Vec<&str> = pair[0].text.split_whitespace().collect();
            let next: Vec<&str> = pair[1].text.split_whitespace().collect();
            assert_eq!(&prev[prev.len() - 3..], &next[..3]);
        }
    }

    #[test]
    fn test_chunks_cover_every_word_in_order() {
        let text = "fn main() {\n    println!(\"hi\");\n}\n\n// trailing comment with words";
        let config = ChunkConfig::new(4, 1).unwrap();
        let chunks = chunk_text(text, &config);

        let mut rebuilt: Vec<&str> = chunks[0].text.split_whitespace().collect();
        for c in &chunks[1..] {
            rebuilt.extend(c.text.split_whitespace().skip(config.chunk_overlap));
        }
        let original: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(rebuilt, original);

        for c in &chunks {
            assert_eq!(&text[c.span.clone()], c.text);
        }
        assert_eq!(chunks[0].span.start, 0);
        assert_eq!(chunks.last().unwrap().span.end, text.trim_end().len());
    }

    #[test]
    fn test_preserves_internal_whitespace() {
        let config = ChunkConfig::new(50, 5).unwrap();
        let text = "line one\n    indented line\n\nnext";
        let chunks = chunk_text(text, &config);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_multibyte_words() {
        let config = ChunkConfig::new(2, 1).unwrap();
        let chunks = chunk_text("héllo wörld 日本語 ok", &config);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].text, "wörld 日本語");
    }

    #[test]
    fn test_indices_contiguous() {
        let config = ChunkConfig::new(10, 4).unwrap();
        let chunks = chunk_text(&words(95), &config);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
        assert_eq!(chunks.len(), config.expected_chunks(95));
    }

    #[test]
    fn test_chunk_id_deterministic() {
        let loc = UnitLocator::Url("https://react.dev/learn".into());
        let a = chunk_id("react", &loc, 0);
        assert_eq!(a, chunk_id("react", &loc, 0));
        assert_ne!(a, chunk_id("react", &loc, 1));
        assert_ne!(a, chunk_id("vue", &loc, 0));
    }

    #[test]
    fn test_count_lines() {
        assert_eq!(count_lines(""), 0);
        assert_eq!(count_lines("a"), 1);
        assert_eq!(count_lines("a\nb\n"), 3);
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("").len(), 64);
    }
}
