//! Character-window chunking with a fixed overlap.
//!
//! Text elements are split into windows of `chunk_size` characters; consecutive chunks from
//! the same element share exactly `overlap` characters, and the final chunk may be shorter
//! than the window. When possible, a window boundary is pulled back to the nearest
//! whitespace within a small backoff so words are not cut mid-way.

use super::types::ChunkingError;

/// How far a window boundary may be pulled back to land on whitespace.
const BREAK_BACKOFF: usize = 50;

/// Split `text` into overlapping character windows.
///
/// Returns an empty vector when the input is all whitespace.
pub fn chunk_text(
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<String>, ChunkingError> {
    if chunk_size == 0 {
        return Err(ChunkingError::InvalidWindow);
    }
    if overlap >= chunk_size {
        return Err(ChunkingError::OverlapTooLarge {
            window: chunk_size,
            overlap,
        });
    }
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let mut end = (start + chunk_size).min(chars.len());

        if end < chars.len() {
            let floor = end.saturating_sub(BREAK_BACKOFF).max(start + 1);
            if let Some(boundary) = (floor..end).rev().find(|i| chars[*i].is_whitespace()) {
                end = boundary;
            }
        }

        chunks.push(chars[start..end].iter().collect());

        if end == chars.len() {
            break;
        }
        let next = end.saturating_sub(overlap);
        // Guarantee forward progress even for degenerate window/overlap combinations.
        start = if next > start { next } else { end };
    }

    tracing::debug!(
        chunks = chunks.len(),
        chars = chars.len(),
        chunk_size,
        overlap,
        "Chunked text element"
    );
    Ok(chunks)
}
