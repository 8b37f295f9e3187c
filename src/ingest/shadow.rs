//! Shadow-text synthesis for tables and figures.
//!
//! Visual content becomes searchable by giving every non-text element a textual surrogate.
//! Synthesis walks a fixed ladder of tiers and degrades on failure only:
//!
//! 1. The structural caption captured by the extractor.
//! 2. A `Figure N` / `Table N` label line found in the surrounding prose.
//! 3. An external visual-transcription call, rate limited to respect provider quotas.
//!
//! A fully exhausted ladder is reported as an error so the pipeline can skip the element
//! without failing the job.

use crate::extract::{DocumentElement, ElementKind};
use crate::ingest::types::{ShadowError, ShadowText, SynthesisMethod};
use crate::llm::{VisionClient, mime_type_for};
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

/// Prompt sent alongside each image to the transcription service.
const TRANSCRIPTION_PROMPT: &str = "Analyze this image and provide a detailed description \
for document retrieval. Name the kind of visual, its main subject, every labeled component \
or data point, and transcribe all visible text and captions. For tables, use Markdown table \
syntax. Be exhaustive: the description is used for semantic search.";

/// Produces shadow texts for non-text elements via the tier ladder.
pub struct ShadowSynthesizer {
    vision: Option<Arc<dyn VisionClient>>,
    limiter: TranscriptionLimiter,
    image_dir: PathBuf,
}

impl ShadowSynthesizer {
    /// Construct a synthesizer.
    ///
    /// `vision` may be `None` when no transcription service is configured; the ladder then
    /// consists of the caption and label tiers only.
    pub fn new(
        vision: Option<Arc<dyn VisionClient>>,
        min_call_delay: Duration,
        image_dir: PathBuf,
    ) -> Self {
        Self {
            vision,
            limiter: TranscriptionLimiter::new(min_call_delay),
            image_dir,
        }
    }

    /// Synthesize a shadow text for `element`, consulting `surrounding_text` for label
    /// matches. Tiers are attempted in fidelity order; failures degrade to the next tier.
    pub async fn synthesize(
        &self,
        element: &DocumentElement,
        surrounding_text: &str,
    ) -> Result<ShadowText, ShadowError> {
        debug_assert_ne!(element.kind, ElementKind::Text);

        if let Some(caption) = caption_tier(element) {
            return Ok(self.shadow(element, caption, SynthesisMethod::Caption));
        }

        if let Some(label) = label_tier(element.kind, surrounding_text) {
            tracing::debug!(page = element.page_number, "Shadow text from label match");
            return Ok(self.shadow(element, label, SynthesisMethod::RegexLabel));
        }

        match self.transcription_tier(element).await {
            Ok(text) => Ok(self.shadow(element, text, SynthesisMethod::TranscriptionService)),
            Err(error) => {
                tracing::warn!(
                    page = element.page_number,
                    error = %error,
                    "Shadow-text ladder exhausted"
                );
                Err(ShadowError::Exhausted {
                    page_number: element.page_number,
                })
            }
        }
    }

    fn shadow(
        &self,
        element: &DocumentElement,
        text: String,
        method: SynthesisMethod,
    ) -> ShadowText {
        ShadowText {
            source_element_id: element.id,
            text,
            method,
        }
    }

    async fn transcription_tier(&self, element: &DocumentElement) -> Result<String, ShadowError> {
        let vision = self
            .vision
            .as_deref()
            .ok_or_else(|| ShadowError::Transcription("no transcription service configured".into()))?;
        let reference = element.image_reference.as_deref().ok_or_else(|| {
            ShadowError::Transcription("element carries no image reference".into())
        })?;

        let path = self.image_dir.join(reference);
        let image = tokio::fs::read(&path)
            .await
            .map_err(|error| ShadowError::ImageUnavailable {
                reference: reference.to_string(),
                message: error.to_string(),
            })?;

        self.limiter.acquire().await;
        tracing::info!(
            page = element.page_number,
            reference,
            "Transcribing element image"
        );

        let text = vision
            .transcribe(&image, mime_type_for(reference), TRANSCRIPTION_PROMPT)
            .await
            .map_err(|error| ShadowError::Transcription(error.to_string()))?;

        if text.trim().is_empty() {
            return Err(ShadowError::Transcription(
                "transcription service returned empty text".into(),
            ));
        }
        Ok(text.trim().to_string())
    }
}

fn caption_tier(element: &DocumentElement) -> Option<String> {
    let caption = element.raw_content.trim();
    if caption.is_empty() {
        None
    } else {
        Some(caption.to_string())
    }
}

fn label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?im)^.*\b(?:figure|fig\.?|table)\s+\d+\b.*$").expect("valid label pattern")
    })
}

/// Find a `Figure N` / `Table N` label line in the surrounding prose matching the element kind.
fn label_tier(kind: ElementKind, surrounding_text: &str) -> Option<String> {
    let keyword = match kind {
        ElementKind::Figure => "fig",
        ElementKind::Table => "table",
        ElementKind::Text => return None,
    };
    label_pattern()
        .find_iter(surrounding_text)
        .map(|found| found.as_str().trim())
        .find(|line| line.to_lowercase().contains(keyword))
        .map(str::to_string)
}

/// Enforces a minimum delay between successive transcription calls.
///
/// The wait is local to the ingestion task; answer-serving requests never touch it.
struct TranscriptionLimiter {
    min_delay: Duration,
    last_call: tokio::sync::Mutex<Option<Instant>>,
}

impl TranscriptionLimiter {
    fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_call: tokio::sync::Mutex::new(None),
        }
    }

    async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
