//! HTTP client wrapper for a Qdrant-backed index.

use crate::index::types::{
    CollectionInfoResponse, IndexError, NewEntry, QueryPoint, QueryResponse, QueryResponseResult,
    ScoredEntry, current_timestamp_rfc3339,
};
use crate::index::VectorIndex;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use uuid::Uuid;

/// Lightweight HTTP client for Qdrant operations.
pub struct QdrantIndex {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    collection: String,
    vector_size: u64,
}

impl QdrantIndex {
    /// Construct a new client for the given Qdrant endpoint and collection.
    pub fn new(
        url: &str,
        api_key: Option<String>,
        collection: String,
        vector_size: u64,
    ) -> Result<Self, IndexError> {
        let client = Client::builder()
            .user_agent("paperbrain/0.1")
            .build()?;
        let base_url = normalize_base_url(url).map_err(IndexError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            collection = %collection,
            has_api_key = api_key.as_deref().map(|value| !value.is_empty()).unwrap_or(false),
            "Initialized Qdrant HTTP client"
        );

        Ok(Self {
            client,
            base_url,
            api_key,
            collection,
            vector_size,
        })
    }

    async fn collection_exists(&self) -> Result<bool, IndexError> {
        let response = self
            .request(Method::GET, &format!("collections/{}", self.collection))?
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = IndexError::UnexpectedStatus { status, body };
                tracing::error!(collection = %self.collection, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    async fn create_collection(&self) -> Result<(), IndexError> {
        let body = json!({
            "vectors": {
                "size": self.vector_size,
                "distance": "Cosine"
            }
        });

        let response = self
            .request(Method::PUT, &format!("collections/{}", self.collection))?
            .json(&body)
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(collection = %self.collection, "Collection ensured/created");
        })
        .await
    }

    fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder, IndexError> {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        Ok(req)
    }

    async fn ensure_success<F>(
        &self,
        response: reqwest::Response,
        on_success: F,
    ) -> Result<(), IndexError>
    where
        F: FnOnce(),
    {
        if response.status().is_success() {
            on_success();
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = IndexError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, "Qdrant request failed");
            Err(error)
        }
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_ready(&self) -> Result<(), IndexError> {
        if self.collection_exists().await? {
            return Ok(());
        }
        tracing::debug!(
            collection = %self.collection,
            vector_size = self.vector_size,
            "Creating collection"
        );
        self.create_collection().await
    }

    async fn upsert(&self, entries: Vec<NewEntry>) -> Result<(), IndexError> {
        if entries.is_empty() {
            return Ok(());
        }

        let now = current_timestamp_rfc3339();
        let serialized: Vec<Value> = entries
            .into_iter()
            .map(|entry| {
                let mut payload = entry.payload;
                payload.ingested_at = Some(now.clone());
                json!({
                    "id": Uuid::new_v4().to_string(),
                    "vector": entry.vector,
                    "payload": payload,
                })
            })
            .collect();

        let point_count = serialized.len();
        let response = self
            .request(
                Method::PUT,
                &format!("collections/{}/points", self.collection),
            )?
            .query(&[("wait", true)])
            .json(&json!({ "points": serialized }))
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(
                collection = %self.collection,
                points = point_count,
                "Entries indexed"
            );
        })
        .await
    }

    async fn search(&self, vector: Vec<f32>, limit: usize) -> Result<Vec<ScoredEntry>, IndexError> {
        let body = json!({
            "query": vector,
            "limit": limit,
            "with_payload": true,
        });

        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/query", self.collection),
            )?
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = IndexError::UnexpectedStatus { status, body };
            tracing::error!(collection = %self.collection, error = %error, "Qdrant search failed");
            return Err(error);
        }

        let payload: QueryResponse = response.json().await?;
        let points = match payload.result {
            QueryResponseResult::Points(points) => points,
            QueryResponseResult::Object { points } => points,
        };

        points.into_iter().map(decode_point).collect()
    }

    async fn clear(&self) -> Result<(), IndexError> {
        let response = self
            .request(Method::DELETE, &format!("collections/{}", self.collection))?
            .send()
            .await?;

        // Deleting an absent collection still leaves the corpus empty.
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::UnexpectedStatus { status, body });
        }

        tracing::info!(collection = %self.collection, "Collection dropped, recreating");
        self.create_collection().await
    }

    async fn count(&self) -> Result<usize, IndexError> {
        let response = self
            .request(Method::GET, &format!("collections/{}", self.collection))?
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::UnexpectedStatus { status, body });
        }

        let info: CollectionInfoResponse = response.json().await?;
        Ok(info.result.points_count.unwrap_or(0))
    }
}

fn decode_point(point: QueryPoint) -> Result<ScoredEntry, IndexError> {
    let payload = point
        .payload
        .ok_or_else(|| IndexError::MalformedPayload("missing payload".to_string()))?;
    let payload = serde_json::from_value(payload)
        .map_err(|error| IndexError::MalformedPayload(error.to_string()))?;
    Ok(ScoredEntry {
        id: stringify_point_id(point.id),
        score: point.score,
        payload,
    })
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn stringify_point_id(id: Value) -> String {
    match id {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
