//! Structure extraction boundary.
//!
//! The ingestion pipeline consumes an ordered sequence of typed elements produced by a
//! [`StructureExtractor`]. Heavyweight layout analysis is an external concern; the built-in
//! [`MarkdownExtractor`] understands markdown-shaped text well enough to drive the rest of
//! the pipeline: paragraphs become text elements, pipe tables become table elements, and
//! image references become figure elements.

use thiserror::Error;
use uuid::Uuid;

/// Kinds of document elements recognized by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    /// Prose content, later split into overlapping chunks.
    Text,
    /// Tabular content, represented by a shadow text in the index.
    Table,
    /// Figure or image content, represented by a shadow text in the index.
    Figure,
}

impl ElementKind {
    /// Stable lowercase label used in index payloads and API responses.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Table => "table",
            Self::Figure => "figure",
        }
    }
}

/// A single typed element extracted from an uploaded document.
///
/// Elements are produced once per document, in page order, and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct DocumentElement {
    /// Unique identifier assigned at extraction time.
    pub id: Uuid,
    /// Element kind.
    pub kind: ElementKind,
    /// 1-based page the element appeared on.
    pub page_number: u32,
    /// Raw textual content: prose for text elements, table markdown for tables,
    /// and the caption (image alt text) for figures.
    pub raw_content: String,
    /// Opaque filename token pointing at the extracted image, when one exists.
    pub image_reference: Option<String>,
}

/// Errors raised while partitioning a document into elements.
///
/// Extraction failures are fatal to the owning ingestion job.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Uploaded bytes were not valid UTF-8 text.
    #[error("document is not valid UTF-8 text: {0}")]
    InvalidEncoding(#[from] std::str::Utf8Error),
    /// Document contained no extractable content.
    #[error("document '{0}' contains no extractable content")]
    EmptyDocument(String),
}

/// Converts a raw document into an ordered sequence of typed elements.
pub trait StructureExtractor: Send + Sync {
    /// Partition `bytes` into elements in page order.
    fn extract(&self, filename: &str, bytes: &[u8]) -> Result<Vec<DocumentElement>, ExtractError>;
}

/// Built-in extractor for markdown-shaped text documents.
///
/// Page boundaries are taken from form-feed characters or `<!-- page: N -->` markers.
pub struct MarkdownExtractor;

impl MarkdownExtractor {
    /// Construct the extractor.
    pub const fn new() -> Self {
        Self
    }
}

impl Default for MarkdownExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl StructureExtractor for MarkdownExtractor {
    fn extract(&self, filename: &str, bytes: &[u8]) -> Result<Vec<DocumentElement>, ExtractError> {
        let text = std::str::from_utf8(bytes)?;
        let elements = parse_markdown(text);
        if elements.is_empty() {
            return Err(ExtractError::EmptyDocument(filename.to_string()));
        }
        tracing::info!(
            filename,
            elements = elements.len(),
            "Extracted document structure"
        );
        Ok(elements)
    }
}

fn parse_markdown(text: &str) -> Vec<DocumentElement> {
    let mut elements = Vec::new();
    let mut page: u32 = 1;
    // Prose accumulated for the current page; flushed when the page advances.
    let mut prose = String::new();
    let mut prose_page = page;

    let flush_prose = |elements: &mut Vec<DocumentElement>, prose: &mut String, page: u32| {
        if !prose.trim().is_empty() {
            elements.push(element(ElementKind::Text, page, prose.trim().to_string(), None));
        }
        prose.clear();
    };

    for block in split_blocks(text) {
        let new_page = match &block {
            Block::PageBreak(next) => Some(*next),
            _ => None,
        };
        if let Some(next) = new_page {
            flush_prose(&mut elements, &mut prose, prose_page);
            page = next;
            prose_page = page;
            continue;
        }

        match block {
            Block::Table(markdown) => {
                elements.push(element(ElementKind::Table, page, markdown, None));
            }
            Block::Figure { caption, reference } => {
                elements.push(element(ElementKind::Figure, page, caption, Some(reference)));
            }
            Block::Paragraph(body) => {
                if !prose.is_empty() {
                    prose.push_str("\n\n");
                }
                prose.push_str(&body);
            }
            Block::PageBreak(_) => unreachable!("handled above"),
        }
    }
    flush_prose(&mut elements, &mut prose, prose_page);
    elements
}

fn element(
    kind: ElementKind,
    page_number: u32,
    raw_content: String,
    image_reference: Option<String>,
) -> DocumentElement {
    DocumentElement {
        id: Uuid::new_v4(),
        kind,
        page_number,
        raw_content,
        image_reference,
    }
}

enum Block {
    Paragraph(String),
    Table(String),
    Figure { caption: String, reference: String },
    PageBreak(u32),
}

fn split_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut page_counter: u32 = 1;

    let mut flush = |lines: &mut Vec<&str>, blocks: &mut Vec<Block>| {
        if lines.is_empty() {
            return;
        }
        let body = lines.join("\n");
        if is_table_block(lines) {
            blocks.push(Block::Table(body));
        } else {
            blocks.push(Block::Paragraph(body));
        }
        lines.clear();
    };

    for raw_line in text.lines() {
        let line = raw_line.trim_end();

        if line.contains('\u{c}') {
            flush(&mut current, &mut blocks);
            page_counter += 1;
            blocks.push(Block::PageBreak(page_counter));
            continue;
        }
        if let Some(page) = parse_page_marker(line) {
            flush(&mut current, &mut blocks);
            page_counter = page;
            blocks.push(Block::PageBreak(page));
            continue;
        }
        if line.trim().is_empty() {
            flush(&mut current, &mut blocks);
            continue;
        }
        if let Some((caption, reference)) = parse_image_line(line.trim()) {
            flush(&mut current, &mut blocks);
            blocks.push(Block::Figure { caption, reference });
            continue;
        }
        current.push(line);
    }
    flush(&mut current, &mut blocks);
    blocks
}

fn parse_page_marker(line: &str) -> Option<u32> {
    let trimmed = line.trim();
    let inner = trimmed
        .strip_prefix("<!-- page:")?
        .strip_suffix("-->")?
        .trim();
    inner.parse().ok()
}

/// Parse a standalone `![caption](reference)` image line.
fn parse_image_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("![")?;
    let close = rest.find(']')?;
    let caption = rest[..close].trim().to_string();
    let rest = rest[close + 1..].strip_prefix('(')?;
    let end = rest.find(')')?;
    let reference = rest[..end].trim().to_string();
    // Only treat the line as a figure when nothing trails the markdown image.
    if !rest[end + 1..].trim().is_empty() || reference.is_empty() {
        return None;
    }
    Some((caption, reference))
}

fn is_table_block(lines: &[&str]) -> bool {
    lines.len() >= 2 && lines.iter().all(|line| line.trim_start().starts_with('|'))
}
