//! Language-model clients used by the orchestrator and the shadow-text synthesizer.
//!
//! Both clients speak the OpenAI-compatible `/chat/completions` wire format, which Groq,
//! OpenAI, and most local runtimes expose. The orchestrator depends on the traits, not the
//! concrete clients, so every node is testable with scripted stubs.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by chat and vision providers.
#[derive(Debug, Error)]
pub enum ChatClientError {
    /// Provider was unreachable or timed out.
    #[error("Chat provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider returned an error response.
    #[error("Chat completion failed: {0}")]
    CompletionFailed(String),
    /// Provider response could not be parsed.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

/// Single-prompt completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Prompt assembled by the calling node.
    pub prompt: String,
    /// Sampling temperature; grading and generation use low values for determinism.
    pub temperature: f32,
    /// Token budget for the completion.
    pub max_tokens: u32,
}

/// Interface implemented by chat completion providers.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Produce a completion for the supplied request.
    async fn complete(&self, request: ChatRequest) -> Result<String, ChatClientError>;
}

/// Interface implemented by visual transcription providers.
#[async_trait]
pub trait VisionClient: Send + Sync {
    /// Describe the supplied image for retrieval purposes.
    async fn transcribe(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, ChatClientError>;
}

/// Issue a chat call, retrying once with identical input on failure.
///
/// External calls inside the orchestrator never fail a whole turn directly; the owning
/// node degrades its decision when both attempts error out.
pub async fn complete_with_retry(
    client: &dyn ChatClient,
    request: ChatRequest,
) -> Result<String, ChatClientError> {
    match client.complete(request.clone()).await {
        Ok(text) => Ok(text),
        Err(first) => {
            tracing::warn!(error = %first, "Chat call failed, retrying once");
            client.complete(request).await
        }
    }
}

/// Chat client for OpenAI-compatible completion endpoints.
pub struct OpenAiChatClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiChatClient {
    /// Construct a client for the given endpoint and model.
    pub fn new(base_url: String, api_key: Option<String>, model: String) -> Self {
        let http = Client::builder()
            .user_agent("paperbrain/chat")
            .build()
            .expect("Failed to construct reqwest::Client for chat");
        Self {
            http,
            base_url,
            api_key,
            model,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn post_messages(
        &self,
        messages: serde_json::Value,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ChatClientError> {
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let response = self
            .http
            .post(self.endpoint())
            .headers(self.auth_headers())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                ChatClientError::ProviderUnavailable(format!(
                    "failed to reach chat endpoint {}: {error}",
                    self.base_url
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatClientError::CompletionFailed(format!(
                "chat endpoint returned {status}: {body}"
            )));
        }

        let body: CompletionResponse = response.json().await.map_err(|error| {
            ChatClientError::InvalidResponse(format!("failed to decode completion: {error}"))
        })?;

        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .ok_or_else(|| ChatClientError::InvalidResponse("completion had no choices".into()))
    }

    fn auth_headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = self.api_key.as_deref().filter(|key| !key.is_empty())
            && let Ok(value) = format!("Bearer {key}").parse()
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        headers
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, ChatClientError> {
        let messages = json!([{ "role": "user", "content": request.prompt }]);
        self.post_messages(messages, request.temperature, request.max_tokens)
            .await
    }
}

#[async_trait]
impl VisionClient for OpenAiChatClient {
    async fn transcribe(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, ChatClientError> {
        let data_url = format!("data:{mime_type};base64,{}", BASE64.encode(image));
        let messages = json!([
            {
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ]
            }
        ]);
        self.post_messages(messages, 0.1, 1024).await
    }
}

/// MIME type inferred from an image filename extension.
pub fn mime_type_for(filename: &str) -> &'static str {
    let lowered = filename.to_lowercase();
    if lowered.ends_with(".jpg") || lowered.ends_with(".jpeg") {
        "image/jpeg"
    } else if lowered.ends_with(".webp") {
        "image/webp"
    } else if lowered.ends_with(".gif") {
        "image/gif"
    } else {
        "image/png"
    }
}
