//! In-process vector index used for local development and tests.

use crate::index::types::{EntryPayload, IndexError, NewEntry, ScoredEntry, current_timestamp_rfc3339};
use crate::index::VectorIndex;
use async_trait::async_trait;
use std::sync::RwLock;
use uuid::Uuid;

struct StoredEntry {
    id: String,
    vector: Vec<f32>,
    payload: EntryPayload,
}

/// Vector index backed by an in-memory list with brute-force cosine search.
#[derive(Default)]
pub struct MemoryIndex {
    entries: RwLock<Vec<StoredEntry>>,
}

impl MemoryIndex {
    /// Construct an empty index.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_ready(&self) -> Result<(), IndexError> {
        Ok(())
    }

    async fn upsert(&self, entries: Vec<NewEntry>) -> Result<(), IndexError> {
        let now = current_timestamp_rfc3339();
        let mut guard = self.entries.write().expect("index lock poisoned");
        for entry in entries {
            let mut payload = entry.payload;
            payload.ingested_at = Some(now.clone());
            guard.push(StoredEntry {
                id: Uuid::new_v4().to_string(),
                vector: entry.vector,
                payload,
            });
        }
        Ok(())
    }

    async fn search(&self, vector: Vec<f32>, limit: usize) -> Result<Vec<ScoredEntry>, IndexError> {
        let guard = self.entries.read().expect("index lock poisoned");
        let mut scored: Vec<ScoredEntry> = guard
            .iter()
            .map(|entry| ScoredEntry {
                id: entry.id.clone(),
                score: cosine_similarity(&entry.vector, &vector),
                payload: entry.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn clear(&self) -> Result<(), IndexError> {
        self.entries.write().expect("index lock poisoned").clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize, IndexError> {
        Ok(self.entries.read().expect("index lock poisoned").len())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
