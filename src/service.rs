//! Service layer wiring the ingestion pipeline, the orchestrator, and shared state.
//!
//! The HTTP layer talks to [`PaperbrainApi`], a trait-object seam that lets the router be
//! exercised with stub services. Ingestion runs as a background task independent of the
//! triggering request; chat and reset coordinate through a corpus gate so a query never
//! observes a half-cleared index.

use crate::agent::{AgentError, AgentSettings, Orchestrator, TurnOutcome};
use crate::config::get_config;
use crate::embedding::{EmbeddingClient, get_embedding_client};
use crate::extract::MarkdownExtractor;
use crate::index::{IndexError, MemoryIndex, QdrantIndex, VectorIndex};
use crate::ingest::{
    IngestError, IngestionPipeline, IngestionStatusView, IngestionSummary, ShadowSynthesizer,
    StatusTracker,
};
use crate::llm::{OpenAiChatClient, VisionClient};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors surfaced by the service layer to its callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Chat turn failed before reaching a terminal outcome.
    #[error("Chat backend failure: {0}")]
    Agent(#[from] AgentError),
    /// Vector index operation failed.
    #[error("Index operation failed: {0}")]
    Index(#[from] IndexError),
    /// Requested image does not exist under the image directory.
    #[error("Image not found: {0}")]
    ImageNotFound(String),
    /// Image reference contained path components outside the image directory.
    #[error("Invalid image reference: {0}")]
    InvalidImageReference(String),
}

/// Operations the HTTP layer depends on.
#[async_trait]
pub trait PaperbrainApi: Send + Sync {
    /// Queue a background ingestion job for the uploaded document.
    async fn start_ingestion(&self, filename: String, content: Vec<u8>);

    /// Snapshot the job registered for `filename`, if any.
    fn ingestion_status(&self, filename: &str) -> Option<IngestionStatusView>;

    /// Run one chat turn against the current corpus.
    async fn chat(&self, query: &str) -> Result<TurnOutcome, ServiceError>;

    /// Clear the index and every tracked job. Idempotent.
    async fn reset(&self) -> Result<(), ServiceError>;

    /// Raw bytes of an image produced during ingestion.
    async fn image_bytes(&self, reference: &str) -> Result<Vec<u8>, ServiceError>;
}

/// Production service instance owning all shared state.
pub struct PaperbrainService {
    pipeline: Arc<IngestionPipeline>,
    orchestrator: Orchestrator,
    index: Arc<dyn VectorIndex>,
    tracker: Arc<StatusTracker>,
    /// Reset takes the write side; chat turns take the read side.
    corpus_gate: RwLock<()>,
    image_dir: PathBuf,
}

impl PaperbrainService {
    /// Build the service from the global configuration.
    pub async fn from_config() -> Self {
        let config = get_config();

        let index: Arc<dyn VectorIndex> = match config.qdrant_url.as_deref() {
            Some(url) => Arc::new(
                QdrantIndex::new(
                    url,
                    config.qdrant_api_key.clone(),
                    config.qdrant_collection_name.clone(),
                    config.embedding_dimension as u64,
                )
                .expect("Invalid Qdrant configuration"),
            ),
            None => {
                tracing::info!("QDRANT_URL not set; using in-memory vector index");
                Arc::new(MemoryIndex::new())
            }
        };
        if let Err(error) = index.ensure_ready().await {
            tracing::warn!(error = %error, "Vector index not reachable at startup");
        }

        let embedder: Arc<dyn EmbeddingClient> = Arc::from(get_embedding_client());
        let chat = Arc::new(OpenAiChatClient::new(
            config.chat_api_url.clone(),
            config.chat_api_key.clone(),
            config.chat_model.clone(),
        ));
        let vision: Option<Arc<dyn VisionClient>> = match (
            config.vision_api_url.as_ref(),
            config.vision_model.as_ref(),
        ) {
            (Some(url), Some(model)) => Some(Arc::new(OpenAiChatClient::new(
                url.clone(),
                config.vision_api_key.clone(),
                model.clone(),
            ))),
            _ => {
                tracing::info!("No vision endpoint configured; transcription tier disabled");
                None
            }
        };

        let image_dir = PathBuf::from(&config.image_dir);
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::new(MarkdownExtractor::new()),
            embedder.clone(),
            index.clone(),
            ShadowSynthesizer::new(
                vision,
                Duration::from_millis(config.transcription_min_delay_ms),
                image_dir.clone(),
            ),
            config.chunk_size,
            config.chunk_overlap,
        ));

        let orchestrator = Orchestrator::new(
            chat,
            embedder,
            index.clone(),
            AgentSettings {
                top_k: config.retrieval_top_k,
                max_retries: config.max_query_rewrites,
            },
        );

        Self {
            pipeline,
            orchestrator,
            index,
            tracker: Arc::new(StatusTracker::new()),
            corpus_gate: RwLock::new(()),
            image_dir,
        }
    }

    /// Run one ingestion job to completion in the current task. Used by the CLI.
    pub async fn ingest_file(
        &self,
        filename: &str,
        bytes: &[u8],
    ) -> Result<IngestionSummary, IngestError> {
        let ticket = self.tracker.begin(filename);
        self.pipeline
            .run(&self.tracker, &ticket, filename, bytes)
            .await
    }
}

#[async_trait]
impl PaperbrainApi for PaperbrainService {
    async fn start_ingestion(&self, filename: String, content: Vec<u8>) {
        let ticket = self.tracker.begin(&filename);
        let pipeline = self.pipeline.clone();
        let tracker = self.tracker.clone();

        tokio::spawn(async move {
            // run() records the terminal state through the tracker; stale tickets from a
            // superseded job are discarded there.
            let _ = pipeline.run(&tracker, &ticket, &filename, &content).await;
        });
    }

    fn ingestion_status(&self, filename: &str) -> Option<IngestionStatusView> {
        self.tracker.get(filename)
    }

    async fn chat(&self, query: &str) -> Result<TurnOutcome, ServiceError> {
        let _corpus = self.corpus_gate.read().await;
        Ok(self.orchestrator.run(query).await?)
    }

    async fn reset(&self) -> Result<(), ServiceError> {
        let _corpus = self.corpus_gate.write().await;
        // Drop the jobs first: in-flight ingestion tickets go stale before the index
        // empties, so a superseded job cannot repopulate the cleared corpus.
        self.tracker.clear();
        self.index.clear().await?;
        tracing::info!("Corpus reset: jobs dropped and index cleared");
        Ok(())
    }

    async fn image_bytes(&self, reference: &str) -> Result<Vec<u8>, ServiceError> {
        let name = Path::new(reference);
        // The reference is an opaque filename token; anything resembling a path is rejected.
        let is_bare_filename = name.components().count() == 1
            && matches!(name.components().next(), Some(Component::Normal(_)));
        if !is_bare_filename {
            return Err(ServiceError::InvalidImageReference(reference.to_string()));
        }

        tokio::fs::read(self.image_dir.join(name))
            .await
            .map_err(|_| ServiceError::ImageNotFound(reference.to_string()))
    }
}
