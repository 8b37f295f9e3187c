#![deny(missing_docs)]

//! Core library for the Paperbrain document question-answering server.

/// Retrieval orchestrator state machine.
pub mod agent;
/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Document structure extraction boundary.
pub mod extract;
/// Vector index abstraction and Qdrant integration.
pub mod index;
/// Ingestion pipeline, chunking, shadow-text synthesis, and job tracking.
pub mod ingest;
/// Chat and vision language-model clients.
pub mod llm;
/// Structured logging and tracing setup.
pub mod logging;
/// Service wiring shared by the HTTP surface and the CLI.
pub mod service;
