//! Overlapping-window text chunker.
//!
//! Splits document content into windows of roughly `chunk_size` bytes, each
//! overlapping the previous by `chunk_overlap` bytes. A window prefers to end
//! at a paragraph (`\n\n`), sentence, newline, or space boundary found within
//! a tolerance band before the target size; otherwise it hard-splits. No
//! window exceeds `max_chunk_size`.
//!
//! Chunks carry their byte offsets into the source content (`start_char`,
//! `end_char`) for traceability, a copy of the caller-supplied metadata, and
//! a SHA-256 content hash used downstream for embedding staleness detection.
//!
//! # Guarantees
//!
//! - Empty content produces an empty result, not an error.
//! - Content no longer than `chunk_size` produces exactly one chunk with
//!   `start_char = 0`.
//! - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
//! - Windows cover the content: every byte of the source appears in at
//!   least one chunk.
//! - `end_char - start_char <= max_chunk_size` for every chunk.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::{Chunk, ChunkMetadata};

/// Split `content` into overlapping chunks tagged with `title`, `source`,
/// and a copy of `extra`.
///
/// Offsets are byte offsets into `content`, always on UTF-8 char boundaries.
pub fn chunk_document(
    document_id: &str,
    content: &str,
    title: &str,
    source: &str,
    extra: &BTreeMap<String, serde_json::Value>,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    if content.is_empty() {
        return Vec::new();
    }

    let window = config.chunk_size.min(config.max_chunk_size).max(1);

    if content.len() <= window {
        return vec![make_chunk(
            document_id, content, 0, content.len(), 0, title, source, extra,
        )];
    }

    // Boundary search band: how far back from the target we will move a
    // split to land on a paragraph or sentence break.
    let tolerance = (window / 4).max(1);

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    loop {
        let target = snap_to_char_boundary(content, (start + window).min(content.len()));
        let mut end = if target >= content.len() {
            content.len()
        } else {
            find_split(content, start, target, tolerance)
        };
        if end <= start {
            // A window smaller than the char at `start`; take that one char.
            end = content[start..]
                .chars()
                .next()
                .map(|c| start + c.len_utf8())
                .unwrap_or(content.len());
        }

        chunks.push(make_chunk(
            document_id,
            &content[start..end],
            start,
            end,
            index,
            title,
            source,
            extra,
        ));
        index += 1;

        if end >= content.len() {
            break;
        }

        // Carry `chunk_overlap` bytes back into the next window, while
        // guaranteeing forward progress.
        let mut next = end.saturating_sub(config.chunk_overlap);
        next = snap_to_char_boundary(content, next);
        if next <= start {
            next = end;
        }
        start = next;
    }

    chunks
}

/// Pick the end of the window starting at `start` with target end `target`.
///
/// Searches the last `tolerance` bytes before `target` for, in order of
/// preference: a paragraph break, a sentence end, a newline, a space.
/// Falls back to a hard split at `target`.
fn find_split(content: &str, start: usize, target: usize, tolerance: usize) -> usize {
    let band_start = snap_to_char_boundary(content, target.saturating_sub(tolerance).max(start));
    let band = &content[band_start..target];

    if let Some(pos) = band.rfind("\n\n") {
        return band_start + pos + 2;
    }
    if let Some(pos) = band.rfind(". ") {
        return band_start + pos + 2;
    }
    if let Some(pos) = band.rfind('\n') {
        return band_start + pos + 1;
    }
    if let Some(pos) = band.rfind(' ') {
        return band_start + pos + 1;
    }
    target
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[allow(clippy::too_many_arguments)]
fn make_chunk(
    document_id: &str,
    text: &str,
    start: usize,
    end: usize,
    index: i64,
    title: &str,
    source: &str,
    extra: &BTreeMap<String, serde_json::Value>,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        content: text.to_string(),
        embedding: None,
        start_char: start,
        end_char: end,
        metadata: ChunkMetadata {
            title: Some(title.to_string()),
            source: Some(source.to_string()),
            document_title: Some(title.to_string()),
            embedding_model: None,
            embedding_generated_at: None,
            extra: extra.clone(),
        },
        access: Default::default(),
        content_hash: hash,
    }
}
