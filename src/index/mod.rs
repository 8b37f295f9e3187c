//! Vector index abstraction over the document corpus.
//!
//! [`VectorIndex`] is the seam between the ingestion pipeline, the retrieval orchestrator,
//! and the storage backend. The production implementation is [`QdrantIndex`]; the
//! [`MemoryIndex`] keeps everything in process for local development and tests.

mod client;
mod memory;
mod types;

pub use client::QdrantIndex;
pub use memory::MemoryIndex;
pub use types::{EntryPayload, IndexError, NewEntry, ScoredEntry};

use async_trait::async_trait;

/// Similarity index holding one entry per chunk or shadow text.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Prepare the backing collection, creating it when missing.
    async fn ensure_ready(&self) -> Result<(), IndexError>;

    /// Persist a batch of entries. Entries are immutable once written.
    async fn upsert(&self, entries: Vec<NewEntry>) -> Result<(), IndexError>;

    /// Top-K cosine similarity search, ordered by descending score.
    async fn search(&self, vector: Vec<f32>, limit: usize) -> Result<Vec<ScoredEntry>, IndexError>;

    /// Drop every entry, returning the corpus to the empty state.
    async fn clear(&self) -> Result<(), IndexError>;

    /// Number of entries currently stored.
    async fn count(&self) -> Result<usize, IndexError>;
}
