//! Core data types and error definitions for the ingestion pipeline.

use crate::extract::ExtractError;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while turning raw text into overlapping chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Ingestion configured an impossible window size.
    #[error("chunk window must be greater than zero")]
    InvalidWindow,
    /// Overlap must leave room for the window to advance.
    #[error("chunk overlap ({overlap}) must be smaller than the window ({window})")]
    OverlapTooLarge {
        /// Configured window size.
        window: usize,
        /// Configured overlap.
        overlap: usize,
    },
}

/// Errors raised while synthesizing a shadow text for a non-text element.
///
/// These are never fatal to a job; a failed tier degrades to the next one, and a fully
/// exhausted ladder skips the element.
#[derive(Debug, Error)]
pub enum ShadowError {
    /// Element image could not be read from disk.
    #[error("failed to read element image '{reference}': {message}")]
    ImageUnavailable {
        /// Image reference that failed to resolve.
        reference: String,
        /// Underlying I/O failure.
        message: String,
    },
    /// Transcription service errored or its quota was exhausted.
    #[error("transcription failed: {0}")]
    Transcription(String),
    /// Every synthesis tier failed for the element.
    #[error("no synthesis tier produced a shadow text for element on page {page_number}")]
    Exhausted {
        /// Page of the element that could not be synthesized.
        page_number: u32,
    },
}

/// Document-level errors that abort an ingestion job.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Structure extraction failed; nothing can be indexed.
    #[error("Failed to extract document structure: {0}")]
    Extract(#[from] ExtractError),
    /// Chunking configuration is unusable.
    #[error("Failed to chunk document: {0}")]
    Chunking(#[from] ChunkingError),
    /// Vector index could not be prepared for writes.
    #[error("Vector index unavailable: {0}")]
    Index(#[from] crate::index::IndexError),
    /// Job was superseded by a reset or a newer upload before it finished.
    #[error("ingestion job superseded before completion")]
    Superseded,
}

/// Which fallback tier produced a shadow text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMethod {
    /// Structural caption captured by the extractor.
    Caption,
    /// `Figure N` / `Table N` label matched in surrounding prose.
    RegexLabel,
    /// External visual-transcription service.
    TranscriptionService,
}

/// Searchable textual surrogate for a non-text element.
#[derive(Clone, Debug)]
pub struct ShadowText {
    /// Element the shadow text was derived from.
    pub source_element_id: Uuid,
    /// The synthesized text, stored and embedded in place of the visual content.
    pub text: String,
    /// Tier that produced the text.
    pub method: SynthesisMethod,
}

/// Final counters reported when an ingestion job completes.
#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct IngestionSummary {
    /// Number of elements the extractor produced.
    pub total_elements: usize,
    /// Text chunks successfully embedded and stored.
    pub text_chunks: usize,
    /// Tables represented by a stored shadow text.
    pub tables: usize,
    /// Figures represented by a stored shadow text.
    pub figures: usize,
    /// Total entries written to the index.
    pub stored: usize,
}
