//! Shared types used by the vector index implementations.

use crate::extract::ElementKind;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors returned while interacting with the vector index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid Qdrant URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Backend responded with an unexpected status code.
    #[error("Unexpected index response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned from the backend.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Stored payload could not be decoded back into an entry.
    #[error("Malformed index payload: {0}")]
    MalformedPayload(String),
}

/// Payload stored alongside each vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPayload {
    /// Searchable text: the chunk itself, or the shadow text of a table/figure.
    pub shadow_text: String,
    /// Kind of the source element.
    pub element_type: ElementKind,
    /// 1-based page the source element appeared on.
    pub page_number: u32,
    /// Opaque filename token for the element image, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,
    /// Filename of the document the entry came from.
    pub source_document: String,
    /// RFC3339 timestamp recorded at ingestion time.
    #[serde(default)]
    pub ingested_at: Option<String>,
}

/// Prepared entry ready for indexing, pairing a payload with its vector.
#[derive(Debug, Clone)]
pub struct NewEntry {
    /// Payload persisted with the vector.
    pub payload: EntryPayload,
    /// Embedding vector produced for the payload text.
    pub vector: Vec<f32>,
}

/// Scored entry returned by similarity searches.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    /// Identifier assigned to the vector.
    pub id: String,
    /// Similarity score computed by the backend.
    pub score: f32,
    /// Stored payload.
    pub payload: EntryPayload,
}

/// Current timestamp formatted for payload storage.
pub(crate) fn current_timestamp_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[derive(Deserialize)]
pub(crate) struct QueryResponse {
    pub(crate) result: QueryResponseResult,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum QueryResponseResult {
    Points(Vec<QueryPoint>),
    Object {
        #[serde(default)]
        points: Vec<QueryPoint>,
    },
}

#[derive(Deserialize)]
pub(crate) struct QueryPoint {
    pub(crate) id: Value,
    pub(crate) score: f32,
    #[serde(default)]
    pub(crate) payload: Option<Value>,
}

#[derive(Deserialize)]
pub(crate) struct CollectionInfoResponse {
    pub(crate) result: CollectionInfoResult,
}

#[derive(Deserialize)]
pub(crate) struct CollectionInfoResult {
    #[serde(default)]
    pub(crate) points_count: Option<usize>,
}
