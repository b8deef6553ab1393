// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Deterministic text chunking for embedding.
//!
//! Splits UTF-8 text into overlapping windows bounded by a character limit,
//! preferring line boundaries and falling back to word boundaries before a
//! hard cut. Identical input always yields identical chunks.

use crate::config::ChunkConfig;
use crate::scanner::hash_text;

/// A bounded contiguous text window, the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Position within the file, starting at 0.
    pub chunk_index: u32,
    /// Byte offset of `text` within the original file text.
    pub byte_offset: usize,
    /// Byte length of `text`.
    pub byte_len: usize,
    /// Trimmed chunk text.
    pub text: String,
    /// SHA-256 of the trimmed text; cache and dedup key.
    pub sha256: String,
}

/// Splits file text into overlapping windows.
pub struct Chunker {
    max_chars: usize,
    overlap_chars: usize,
}

impl Chunker {
    pub fn new(config: &ChunkConfig) -> Self {
        Self {
            max_chars: config.max_chars.max(1),
            overlap_chars: config.overlap_chars.min(config.max_chars.saturating_sub(1)),
        }
    }

    /// Chunk a file's text. Empty or whitespace-only input yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        if text.trim().is_empty() {
            return chunks;
        }

        let char_offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        let total_chars = char_offsets.len();
        let byte_at = |char_idx: usize| -> usize {
            if char_idx >= total_chars {
                text.len()
            } else {
                char_offsets[char_idx]
            }
        };

        let mut index: u32 = 0;
        let mut start_char = 0usize;

        while start_char < total_chars {
            let hard_end = (start_char + self.max_chars).min(total_chars);
            let end_char = if hard_end < total_chars {
                self.boundary_before(text, &char_offsets, start_char, hard_end)
            } else {
                hard_end
            };

            let byte_start = byte_at(start_char);
            let byte_end = byte_at(end_char);
            let raw = &text[byte_start..byte_end];
            let trimmed = raw.trim();

            if !trimmed.is_empty() {
                let trim_lead = raw.len() - raw.trim_start().len();
                chunks.push(Chunk {
                    chunk_index: index,
                    byte_offset: byte_start + trim_lead,
                    byte_len: trimmed.len(),
                    text: trimmed.to_string(),
                    sha256: hash_text(trimmed),
                });
                index += 1;
            }

            if end_char >= total_chars {
                break;
            }
            // Overlap backwards from the cut, but always make progress.
            let next = end_char.saturating_sub(self.overlap_chars);
            start_char = next.max(start_char + 1);
        }

        chunks
    }

    /// Pick the cut point for a window ending at `hard_end`: the last newline
    /// in the second half of the window, else the last whitespace, else the
    /// hard limit.
    fn boundary_before(
        &self,
        text: &str,
        char_offsets: &[usize],
        start_char: usize,
        hard_end: usize,
    ) -> usize {
        let min_cut = start_char + self.max_chars / 2;
        let mut last_newline = None;
        let mut last_space = None;

        for char_idx in (min_cut..hard_end).rev() {
            let byte = char_offsets[char_idx];
            let ch = text[byte..].chars().next().unwrap_or(' ');
            if ch == '\n' && last_newline.is_none() {
                last_newline = Some(char_idx + 1);
                break;
            }
            if ch.is_whitespace() && last_space.is_none() {
                last_space = Some(char_idx + 1);
            }
        }

        last_newline.or(last_space).unwrap_or(hard_end)
    }
}
