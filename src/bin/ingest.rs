//! Command-line ingestion: run one document through the pipeline and print the summary.
//!
//! Useful for seeding a corpus without the HTTP server, e.g.
//! `ingest --file notes/physiology.md`.

use anyhow::Context;
use clap::Parser;
use paperbrain::{config, logging, service::PaperbrainService};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ingest", about = "Ingest a document into the Paperbrain index")]
struct Args {
    /// Path to the document to ingest.
    #[arg(long)]
    file: PathBuf,

    /// Filename recorded in the index; defaults to the file's name on disk.
    #[arg(long)]
    filename: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_config();
    logging::init_tracing();
    let args = Args::parse();

    let filename = match args.filename {
        Some(name) => name,
        None => args
            .file
            .file_name()
            .and_then(|name| name.to_str())
            .context("file path has no usable filename")?
            .to_string(),
    };

    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;

    let service = PaperbrainService::from_config().await;
    let summary = service
        .ingest_file(&filename, &bytes)
        .await
        .with_context(|| format!("ingestion failed for '{filename}'"))?;

    println!(
        "Ingested '{filename}': {} elements, {} text chunks, {} tables, {} figures, {} entries stored",
        summary.total_elements, summary.text_chunks, summary.tables, summary.figures, summary.stored
    );
    Ok(())
}
