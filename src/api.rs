//! HTTP surface for Paperbrain.
//!
//! This module exposes a compact Axum router over the service trait:
//!
//! - `POST /ingest` – Accept a document upload and queue a background ingestion job.
//! - `GET /ingestion-status/:filename` – Poll the progress of an ingestion job.
//! - `POST /chat` – Run one question-answering turn against the ingested corpus.
//! - `DELETE /reset` – Clear the index and all tracked jobs.
//! - `GET /images/:name` – Serve an image extracted during ingestion.
//! - `GET /health` – Liveness probe.
//!
//! A deliberate refusal is a normal `200` response carrying the fixed refusal message; a
//! backend failure is a `502` with a generic message, so clients can tell "not in this
//! document" apart from "the assistant is down".

use crate::agent::{REFUSAL_MESSAGE, SupportingDocument, TurnOutcome};
use crate::llm::mime_type_for;
use crate::service::{PaperbrainApi, ServiceError};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Build the HTTP router exposing the document question-answering surface.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: PaperbrainApi + 'static,
{
    Router::new()
        .route("/ingest", post(ingest_document::<S>))
        .route("/ingestion-status/:filename", get(ingestion_status::<S>))
        .route("/chat", post(chat::<S>))
        .route("/reset", delete(reset::<S>))
        .route("/images/:name", get(image::<S>))
        .route("/health", get(health))
        .with_state(service)
}

/// Request body for `POST /ingest`.
#[derive(Deserialize)]
struct IngestRequest {
    /// Client-supplied filename identifying the document.
    filename: String,
    /// Document contents.
    content: String,
}

/// Acknowledgment returned by `POST /ingest`.
#[derive(Serialize)]
struct IngestResponse {
    status: &'static str,
    filename: String,
    message: &'static str,
}

/// Queue a background ingestion job; the call returns immediately.
async fn ingest_document<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<IngestRequest>,
) -> impl IntoResponse
where
    S: PaperbrainApi,
{
    tracing::info!(filename = %request.filename, "Ingestion requested");
    service
        .start_ingestion(request.filename.clone(), request.content.into_bytes())
        .await;
    (
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            status: "queued",
            filename: request.filename,
            message: "Document queued for ingestion",
        }),
    )
}

/// Poll the progress of the job registered for `filename`.
async fn ingestion_status<S>(
    State(service): State<Arc<S>>,
    Path(filename): Path<String>,
) -> Response
where
    S: PaperbrainApi,
{
    match service.ingestion_status(&filename) {
        Some(view) => Json(view).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": format!("no ingestion job for '{filename}'")
            })),
        )
            .into_response(),
    }
}

/// Request body for `POST /chat`.
#[derive(Deserialize)]
struct ChatRequestBody {
    query: String,
}

/// Response body for `POST /chat`.
#[derive(Serialize)]
struct ChatResponseBody {
    response: String,
    documents: Vec<SupportingDocument>,
}

/// Run one orchestration turn for the supplied query.
async fn chat<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<ChatRequestBody>,
) -> Result<Json<ChatResponseBody>, AppError>
where
    S: PaperbrainApi,
{
    let outcome = service.chat(&request.query).await?;
    let body = match outcome {
        TurnOutcome::Answer { text, documents } => ChatResponseBody {
            response: text,
            documents,
        },
        TurnOutcome::Refusal => ChatResponseBody {
            response: REFUSAL_MESSAGE.to_string(),
            documents: Vec::new(),
        },
    };
    Ok(Json(body))
}

/// Clear the index and all tracked jobs. Safe to call repeatedly.
async fn reset<S>(State(service): State<Arc<S>>) -> Result<Json<serde_json::Value>, AppError>
where
    S: PaperbrainApi,
{
    service.reset().await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// Serve the raw bytes of an extracted image.
async fn image<S>(State(service): State<Arc<S>>, Path(name): Path<String>) -> Result<Response, AppError>
where
    S: PaperbrainApi,
{
    let bytes = service.image_bytes(&name).await?;
    Ok(([(header::CONTENT_TYPE, mime_type_for(&name))], bytes).into_response())
}

/// Liveness probe.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

struct AppError(ServiceError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            ServiceError::Agent(error) => {
                tracing::error!(error = %error, "Chat backend failure");
                (
                    StatusCode::BAD_GATEWAY,
                    "Could not reach the assistant. Please try again.".to_string(),
                )
            }
            ServiceError::ImageNotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            ServiceError::InvalidImageReference(_) => {
                (StatusCode::BAD_REQUEST, self.0.to_string())
            }
            ServiceError::Index(error) => {
                tracing::error!(error = %error, "Index failure");
                (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<ServiceError> for AppError {
    fn from(inner: ServiceError) -> Self {
        Self(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentError;
    use crate::extract::ElementKind;
    use crate::ingest::{IngestionStatusView, JobStatus};
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Stub service with scripted chat outcomes and recorded ingestion calls.
    struct StubService {
        ingestions: Mutex<Vec<(String, Vec<u8>)>>,
        chat_outcome: Mutex<Option<Result<TurnOutcome, ServiceError>>>,
        status: Option<IngestionStatusView>,
    }

    impl StubService {
        fn new() -> Self {
            Self {
                ingestions: Mutex::new(Vec::new()),
                chat_outcome: Mutex::new(None),
                status: None,
            }
        }

        fn with_chat(outcome: Result<TurnOutcome, ServiceError>) -> Self {
            let stub = Self::new();
            *stub.chat_outcome.lock().expect("lock") = Some(outcome);
            stub
        }
    }

    #[async_trait]
    impl PaperbrainApi for StubService {
        async fn start_ingestion(&self, filename: String, content: Vec<u8>) {
            self.ingestions
                .lock()
                .expect("lock")
                .push((filename, content));
        }

        fn ingestion_status(&self, _filename: &str) -> Option<IngestionStatusView> {
            self.status.clone()
        }

        async fn chat(&self, _query: &str) -> Result<TurnOutcome, ServiceError> {
            self.chat_outcome
                .lock()
                .expect("lock")
                .take()
                .expect("chat outcome scripted")
        }

        async fn reset(&self) -> Result<(), ServiceError> {
            Ok(())
        }

        async fn image_bytes(&self, reference: &str) -> Result<Vec<u8>, ServiceError> {
            if reference == "figure_1_0.png" {
                Ok(vec![0x89, 0x50, 0x4e, 0x47])
            } else {
                Err(ServiceError::ImageNotFound(reference.to_string()))
            }
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&body).expect("json body")
    }

    fn json_request(method: Method, uri: &str, payload: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn ingest_returns_queued_and_hands_off_the_document() {
        let service = Arc::new(StubService::new());
        let app = create_router(service.clone());

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/ingest",
                serde_json::json!({ "filename": "physiology.md", "content": "# Heart\n" }),
            ))
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "queued");
        assert_eq!(json["filename"], "physiology.md");

        let ingestions = service.ingestions.lock().expect("lock");
        assert_eq!(ingestions.len(), 1);
        assert_eq!(ingestions[0].0, "physiology.md");
        assert_eq!(ingestions[0].1, b"# Heart\n");
    }

    #[tokio::test]
    async fn unknown_ingestion_job_is_a_404() {
        let app = create_router(Arc::new(StubService::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ingestion-status/missing.md")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn known_ingestion_job_reports_progress() {
        let mut service = StubService::new();
        service.status = Some(IngestionStatusView {
            status: JobStatus::Processing,
            message: "Processing element 3/10".into(),
            current: 3,
            total: 10,
            progress: 30,
            summary: None,
        });
        let app = create_router(Arc::new(service));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ingestion-status/doc.md")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "processing");
        assert_eq!(json["progress"], 30);
    }

    #[tokio::test]
    async fn chat_answer_carries_supporting_documents() {
        let service = Arc::new(StubService::with_chat(Ok(TurnOutcome::Answer {
            text: "The table lists vital signs.".into(),
            documents: vec![SupportingDocument {
                element_type: ElementKind::Table,
                page_number: 4,
                image_reference: Some("table_4_0.png".into()),
            }],
        })));
        let app = create_router(service);

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/chat",
                serde_json::json!({ "query": "what are the vital signs?" }),
            ))
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["response"], "The table lists vital signs.");
        assert_eq!(json["documents"][0]["element_type"], "table");
        assert_eq!(json["documents"][0]["page_number"], 4);
    }

    #[tokio::test]
    async fn refusal_is_a_normal_200_with_the_fixed_message() {
        let service = Arc::new(StubService::with_chat(Ok(TurnOutcome::Refusal)));
        let app = create_router(service);

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/chat",
                serde_json::json!({ "query": "what is the meaning of life?" }),
            ))
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["response"], REFUSAL_MESSAGE);
        assert_eq!(json["documents"].as_array().expect("array").len(), 0);
    }

    #[tokio::test]
    async fn backend_failure_is_a_502_distinct_from_refusal() {
        let service = Arc::new(StubService::with_chat(Err(ServiceError::Agent(
            AgentError::Embedding("provider down".into()),
        ))));
        let app = create_router(service);

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/chat",
                serde_json::json!({ "query": "anything" }),
            ))
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        let message = json["error"].as_str().expect("message");
        assert!(message.contains("Could not reach the assistant"));
        assert!(!message.contains(REFUSAL_MESSAGE));
    }

    #[tokio::test]
    async fn images_are_served_with_a_content_type() {
        let app = create_router(Arc::new(StubService::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/images/figure_1_0.png")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .expect("content type"),
            "image/png"
        );
    }

    #[tokio::test]
    async fn missing_images_are_a_404() {
        let app = create_router(Arc::new(StubService::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/images/unknown.png")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reset_acknowledges_success() {
        let app = create_router(Arc::new(StubService::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/reset")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }
}
