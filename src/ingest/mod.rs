//! Document ingestion pipeline.
//!
//! One job per uploaded document: structure extraction, then per-element processing in
//! page order. Text elements are chunked and embedded directly; tables and figures go
//! through shadow-text synthesis first. Element-level failures skip the element and the
//! job keeps going; only extraction, chunking configuration, an unreachable index, or a
//! superseded job ticket abort a job. Supersession (a reset or a newer upload for the
//! same document) is checked at every element boundary and again before each index
//! write, so a stale job cannot repopulate a corpus that was just cleared.

pub mod chunking;
pub mod shadow;
pub mod status;
pub mod types;

pub use chunking::chunk_text;
pub use shadow::ShadowSynthesizer;
pub use status::{IngestionStatusView, JobStatus, JobTicket, StatusTracker};
pub use types::{IngestError, IngestionSummary, ShadowError};

use crate::embedding::EmbeddingClient;
use crate::extract::{DocumentElement, ElementKind, StructureExtractor};
use crate::index::{EntryPayload, NewEntry, VectorIndex};
use std::collections::HashMap;
use std::sync::Arc;

/// Runs ingestion jobs against the configured extractor, embedder, and index.
pub struct IngestionPipeline {
    extractor: Arc<dyn StructureExtractor>,
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    shadow: ShadowSynthesizer,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl IngestionPipeline {
    /// Assemble a pipeline from its collaborators.
    pub fn new(
        extractor: Arc<dyn StructureExtractor>,
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        shadow: ShadowSynthesizer,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            extractor,
            embedder,
            index,
            shadow,
            chunk_size,
            chunk_overlap,
        }
    }

    /// Execute one ingestion job, reporting progress through `tracker` under `ticket`.
    ///
    /// The tracker always ends up in a terminal state for the ticket: `Completed` with the
    /// summary, or `Error` with the failure message.
    pub async fn run(
        &self,
        tracker: &StatusTracker,
        ticket: &JobTicket,
        filename: &str,
        bytes: &[u8],
    ) -> Result<IngestionSummary, IngestError> {
        match self.process(tracker, ticket, filename, bytes).await {
            Ok(summary) => {
                tracker.complete(ticket, summary);
                tracing::info!(
                    filename,
                    stored = summary.stored,
                    text_chunks = summary.text_chunks,
                    tables = summary.tables,
                    figures = summary.figures,
                    "Ingestion job completed"
                );
                Ok(summary)
            }
            Err(IngestError::Superseded) => {
                tracing::info!(filename, "Ingestion job superseded, stopping without writes");
                Err(IngestError::Superseded)
            }
            Err(error) => {
                tracker.fail(ticket, &error.to_string());
                tracing::error!(filename, error = %error, "Ingestion job failed");
                Err(error)
            }
        }
    }

    async fn process(
        &self,
        tracker: &StatusTracker,
        ticket: &JobTicket,
        filename: &str,
        bytes: &[u8],
    ) -> Result<IngestionSummary, IngestError> {
        if !tracker.update(ticket, "Extracting document structure", 0, 0) {
            return Err(IngestError::Superseded);
        }
        let elements = self.extractor.extract(filename, bytes)?;
        self.index.ensure_ready().await?;

        let prose_by_page = prose_by_page(&elements);
        let total = elements.len();
        let mut summary = IngestionSummary {
            total_elements: total,
            ..IngestionSummary::default()
        };

        for (position, element) in elements.iter().enumerate() {
            // A discarded progress update means the ticket was superseded by a reset or a
            // newer upload; stop before touching the index again.
            if !tracker.update(
                ticket,
                &format!("Processing element {}/{}", position + 1, total),
                position,
                total,
            ) {
                return Err(IngestError::Superseded);
            }

            match element.kind {
                ElementKind::Text => {
                    summary.text_chunks += self.ingest_text(tracker, ticket, filename, element).await?;
                }
                ElementKind::Table | ElementKind::Figure => {
                    let surrounding = prose_by_page
                        .get(&element.page_number)
                        .map(String::as_str)
                        .unwrap_or("");
                    if self
                        .ingest_visual(tracker, ticket, filename, element, surrounding)
                        .await?
                    {
                        match element.kind {
                            ElementKind::Table => summary.tables += 1,
                            ElementKind::Figure => summary.figures += 1,
                            ElementKind::Text => {}
                        }
                    }
                }
            }
        }

        summary.stored = summary.text_chunks + summary.tables + summary.figures;
        Ok(summary)
    }

    /// Chunk, embed, and store one text element. Returns the number of chunks stored.
    async fn ingest_text(
        &self,
        tracker: &StatusTracker,
        ticket: &JobTicket,
        filename: &str,
        element: &DocumentElement,
    ) -> Result<usize, IngestError> {
        let chunks = chunk_text(&element.raw_content, self.chunk_size, self.chunk_overlap)?;
        if chunks.is_empty() {
            return Ok(0);
        }

        let vectors = match self.embedder.generate_embeddings(chunks.clone()).await {
            Ok(vectors) => vectors,
            Err(error) => {
                tracing::warn!(
                    page = element.page_number,
                    error = %error,
                    "Skipping text element: embedding failed"
                );
                return Ok(0);
            }
        };

        let entries: Vec<NewEntry> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| NewEntry {
                payload: self.payload(filename, element, chunk),
                vector,
            })
            .collect();
        let count = entries.len();

        // The embedding call may have overlapped a reset; re-check before writing.
        if !tracker.is_active(ticket) {
            return Err(IngestError::Superseded);
        }
        if let Err(error) = self.index.upsert(entries).await {
            tracing::warn!(
                page = element.page_number,
                error = %error,
                "Skipping text element: index write failed"
            );
            return Ok(0);
        }
        Ok(count)
    }

    /// Synthesize, embed, and store the shadow text of a table or figure.
    ///
    /// Returns whether an entry was stored; element-local failures skip the element, and
    /// a superseded ticket aborts the job.
    async fn ingest_visual(
        &self,
        tracker: &StatusTracker,
        ticket: &JobTicket,
        filename: &str,
        element: &DocumentElement,
        surrounding: &str,
    ) -> Result<bool, IngestError> {
        let shadow = match self.shadow.synthesize(element, surrounding).await {
            Ok(shadow) => shadow,
            Err(error) => {
                tracing::warn!(
                    page = element.page_number,
                    kind = element.kind.as_str(),
                    error = %error,
                    "Skipping element without shadow text"
                );
                return Ok(false);
            }
        };

        let vector = match self.embedder.generate_embeddings(vec![shadow.text.clone()]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.swap_remove(0),
            Ok(_) => {
                tracing::warn!(
                    page = element.page_number,
                    "Skipping element: embedder returned no vector"
                );
                return Ok(false);
            }
            Err(error) => {
                tracing::warn!(
                    page = element.page_number,
                    error = %error,
                    "Skipping element: embedding failed"
                );
                return Ok(false);
            }
        };

        // Synthesis and embedding may have overlapped a reset; re-check before writing.
        if !tracker.is_active(ticket) {
            return Err(IngestError::Superseded);
        }

        let entry = NewEntry {
            payload: self.payload(filename, element, shadow.text),
            vector,
        };
        if let Err(error) = self.index.upsert(vec![entry]).await {
            tracing::warn!(
                page = element.page_number,
                error = %error,
                "Skipping element: index write failed"
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn payload(
        &self,
        filename: &str,
        element: &DocumentElement,
        shadow_text: String,
    ) -> EntryPayload {
        EntryPayload {
            shadow_text,
            element_type: element.kind,
            page_number: element.page_number,
            image_reference: element.image_reference.clone(),
            source_document: filename.to_string(),
            ingested_at: None,
        }
    }
}

/// Concatenated prose per page, used as the label-tier search space for that page's
/// tables and figures.
fn prose_by_page(elements: &[DocumentElement]) -> HashMap<u32, String> {
    let mut map: HashMap<u32, String> = HashMap::new();
    for element in elements {
        if element.kind == ElementKind::Text {
            let prose = map.entry(element.page_number).or_default();
            if !prose.is_empty() {
                prose.push_str("\n\n");
            }
            prose.push_str(&element.raw_content);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{DeterministicEmbeddingClient, EmbeddingClientError};
    use crate::extract::MarkdownExtractor;
    use crate::index::MemoryIndex;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const SAMPLE: &str = "The cardiac cycle has two phases.\n\n\
| Phase | Duration |\n|---|---|\n| Systole | 0.3s |\n\n\
![Blood flow through the heart](figure_1_0.png)\n";

    fn pipeline(index: Arc<MemoryIndex>) -> IngestionPipeline {
        IngestionPipeline::new(
            Arc::new(MarkdownExtractor::new()),
            Arc::new(DeterministicEmbeddingClient::new(32)),
            index,
            ShadowSynthesizer::new(None, Duration::from_millis(0), PathBuf::from("/nonexistent")),
            1000,
            200,
        )
    }

    #[tokio::test]
    async fn stored_count_matches_the_per_kind_counters() {
        let index = Arc::new(MemoryIndex::new());
        let pipeline = pipeline(index.clone());
        let tracker = StatusTracker::new();
        let ticket = tracker.begin("doc.md");

        let summary = pipeline
            .run(&tracker, &ticket, "doc.md", SAMPLE.as_bytes())
            .await
            .expect("job completes");

        assert_eq!(summary.total_elements, 3);
        assert_eq!(summary.text_chunks, 1);
        assert_eq!(summary.tables, 1);
        assert_eq!(summary.figures, 1);
        assert_eq!(
            summary.stored,
            summary.text_chunks + summary.tables + summary.figures
        );
        assert_eq!(index.count().await.expect("count"), summary.stored);

        let view = tracker.get("doc.md").expect("status present");
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.progress, 100);
    }

    #[tokio::test]
    async fn uncaptioned_figure_without_fallbacks_is_skipped_not_fatal() {
        // No caption, no label in prose, no transcription service: the figure is dropped
        // but the job still completes with the remaining entries.
        let doc = "Prose without any labels.\n\n![](mystery.png)\n";
        let index = Arc::new(MemoryIndex::new());
        let pipeline = pipeline(index.clone());
        let tracker = StatusTracker::new();
        let ticket = tracker.begin("doc.md");

        let summary = pipeline
            .run(&tracker, &ticket, "doc.md", doc.as_bytes())
            .await
            .expect("job completes");

        assert_eq!(summary.total_elements, 2);
        assert_eq!(summary.figures, 0);
        assert_eq!(summary.text_chunks, 1);
        assert_eq!(summary.stored, 1);
        assert_eq!(
            tracker.get("doc.md").expect("status").status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn uncaptioned_figure_uses_page_label_line() {
        let doc = "Figure 2: Pressure-volume loop of the left ventricle.\n\n![](pv_loop.png)\n";
        let index = Arc::new(MemoryIndex::new());
        let pipeline = pipeline(index.clone());
        let tracker = StatusTracker::new();
        let ticket = tracker.begin("doc.md");

        let summary = pipeline
            .run(&tracker, &ticket, "doc.md", doc.as_bytes())
            .await
            .expect("job completes");
        assert_eq!(summary.figures, 1);

        let query = DeterministicEmbeddingClient::new(32)
            .generate_embeddings(vec!["Pressure-volume loop".into()])
            .await
            .expect("query vector")
            .remove(0);
        let hits = index.search(query, 10).await.expect("search");
        assert!(
            hits.iter().any(|hit| {
                hit.payload.element_type == ElementKind::Figure
                    && hit.payload.shadow_text.contains("Figure 2")
            }),
            "figure entry should carry the label line as shadow text"
        );
    }

    /// Embedder that performs a reset (jobs dropped, index cleared) during its first
    /// call, emulating a reset arriving while an element is in flight.
    struct ResettingEmbedder {
        inner: DeterministicEmbeddingClient,
        tracker: Arc<StatusTracker>,
        index: Arc<MemoryIndex>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingClient for ResettingEmbedder {
        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.tracker.clear();
                self.index.clear().await.expect("clear in-memory index");
            }
            self.inner.generate_embeddings(texts).await
        }
    }

    #[tokio::test]
    async fn reset_during_ingestion_stops_further_index_writes() {
        let tracker = Arc::new(StatusTracker::new());
        let index = Arc::new(MemoryIndex::new());
        let pipeline = IngestionPipeline::new(
            Arc::new(MarkdownExtractor::new()),
            Arc::new(ResettingEmbedder {
                inner: DeterministicEmbeddingClient::new(32),
                tracker: tracker.clone(),
                index: index.clone(),
                fired: AtomicBool::new(false),
            }),
            index.clone(),
            ShadowSynthesizer::new(None, Duration::from_millis(0), PathBuf::from("/nonexistent")),
            1000,
            200,
        );
        let ticket = tracker.begin("doc.md");

        let error = pipeline
            .run(&tracker, &ticket, "doc.md", SAMPLE.as_bytes())
            .await
            .expect_err("superseded job must not complete");
        assert!(matches!(error, IngestError::Superseded));

        // Nothing written after the reset, and no resurrected job record.
        assert_eq!(index.count().await.expect("count"), 0);
        assert!(tracker.get("doc.md").is_none());
    }

    #[tokio::test]
    async fn superseded_ticket_aborts_before_any_work() {
        let index = Arc::new(MemoryIndex::new());
        let pipeline = pipeline(index.clone());
        let tracker = StatusTracker::new();
        let stale = tracker.begin("doc.md");
        let _fresh = tracker.begin("doc.md");

        let error = pipeline
            .run(&tracker, &stale, "doc.md", SAMPLE.as_bytes())
            .await
            .expect_err("stale ticket rejected");
        assert!(matches!(error, IngestError::Superseded));
        assert_eq!(index.count().await.expect("count"), 0);

        // The fresh job's record is untouched.
        let view = tracker.get("doc.md").expect("fresh job present");
        assert_eq!(view.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn extraction_failure_marks_the_job_errored() {
        let index = Arc::new(MemoryIndex::new());
        let pipeline = pipeline(index);
        let tracker = StatusTracker::new();
        let ticket = tracker.begin("bin.pdf");

        let error = pipeline
            .run(&tracker, &ticket, "bin.pdf", &[0xff, 0xfe])
            .await
            .expect_err("extraction fails");
        assert!(matches!(error, IngestError::Extract(_)));

        let view = tracker.get("bin.pdf").expect("status present");
        assert_eq!(view.status, JobStatus::Error);
    }
}
