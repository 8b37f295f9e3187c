use serde::Deserialize;
use std::env;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the Paperbrain server.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Base URL of the Qdrant instance. When absent, an in-memory index is used.
    pub qdrant_url: Option<String>,
    /// Name of the Qdrant collection holding document entries.
    pub qdrant_collection_name: String,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Base URL of the embedding runtime (Ollama provider only).
    pub embedding_url: Option<String>,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Base URL of the OpenAI-compatible chat completion endpoint.
    pub chat_api_url: String,
    /// Optional bearer token for the chat endpoint.
    pub chat_api_key: Option<String>,
    /// Chat model used for routing, grading, rewriting, and generation.
    pub chat_model: String,
    /// Optional base URL of the vision transcription endpoint.
    pub vision_api_url: Option<String>,
    /// Optional bearer token for the vision endpoint.
    pub vision_api_key: Option<String>,
    /// Vision model used to transcribe tables and figures.
    pub vision_model: Option<String>,
    /// Character window used when splitting text elements into chunks.
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks of the same element.
    pub chunk_overlap: usize,
    /// Number of candidates fetched per similarity search.
    pub retrieval_top_k: usize,
    /// Maximum number of query rewrites before the orchestrator refuses.
    pub max_query_rewrites: u32,
    /// Minimum delay between successive vision transcription calls.
    pub transcription_min_delay_ms: u64,
    /// Directory holding images extracted during ingestion.
    pub image_dir: String,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported embedding backends for the ingestion pipeline.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Deterministic content-hash embeddings, useful without a local runtime.
    Deterministic,
}

const DEFAULT_CHUNK_SIZE: usize = 1000;
const DEFAULT_CHUNK_OVERLAP: usize = 200;
const DEFAULT_TOP_K: usize = 10;
const DEFAULT_MAX_REWRITES: u32 = 2;
const DEFAULT_TRANSCRIPTION_DELAY_MS: u64 = 1000;

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            qdrant_url: load_env_optional("QDRANT_URL"),
            qdrant_collection_name: load_env_optional("QDRANT_COLLECTION_NAME")
                .unwrap_or_else(|| "paperbrain".to_string()),
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            embedding_provider: load_env_optional("EMBEDDING_PROVIDER")
                .unwrap_or_else(|| "deterministic".to_string())
                .parse()
                .map_err(|()| ConfigError::InvalidValue("EMBEDDING_PROVIDER".to_string()))?,
            embedding_url: load_env_optional("EMBEDDING_URL"),
            embedding_model: load_env_optional("EMBEDDING_MODEL")
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            embedding_dimension: parse_env("EMBEDDING_DIMENSION", 384)?,
            chat_api_url: load_env("CHAT_API_URL")?,
            chat_api_key: load_env_optional("CHAT_API_KEY"),
            chat_model: load_env("CHAT_MODEL")?,
            vision_api_url: load_env_optional("VISION_API_URL"),
            vision_api_key: load_env_optional("VISION_API_KEY"),
            vision_model: load_env_optional("VISION_MODEL"),
            chunk_size: parse_env("CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            chunk_overlap: parse_env("CHUNK_OVERLAP", DEFAULT_CHUNK_OVERLAP)?,
            retrieval_top_k: parse_env("RETRIEVAL_TOP_K", DEFAULT_TOP_K)?,
            max_query_rewrites: parse_env("MAX_QUERY_REWRITES", DEFAULT_MAX_REWRITES)?,
            transcription_min_delay_ms: parse_env(
                "TRANSCRIPTION_MIN_DELAY_MS",
                DEFAULT_TRANSCRIPTION_DELAY_MS,
            )?,
            image_dir: load_env_optional("IMAGE_DIR").unwrap_or_else(|| "output".to_string()),
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        })
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "deterministic" => Ok(Self::Deterministic),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        qdrant_url = ?config.qdrant_url,
        collection = %config.qdrant_collection_name,
        chat_model = %config.chat_model,
        embedding_provider = ?config.embedding_provider,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
