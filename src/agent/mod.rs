//! Retrieval orchestrator.
//!
//! Each chat query runs one pass of a cyclic state machine:
//! `Router → {Retrieve, DirectAnswer}`, `Retrieve → Grade`, `Grade → {Generate, Rewrite}`,
//! `Rewrite → Retrieve | Refuse`. The machine is an explicit state enum plus a transition
//! function so the rewrite bound and the degradation paths are directly testable.
//!
//! Failure semantics: every language-model call is retried once with identical input; a
//! second failure degrades the owning node's decision (route to retrieval, reject the
//! candidate, keep the unrewritten query, refuse the turn) instead of failing the turn.
//! Only embedding and index failures surface to the caller.

mod prompts;

use crate::embedding::EmbeddingClient;
use crate::extract::ElementKind;
use crate::index::{IndexError, ScoredEntry, VectorIndex};
use crate::llm::{ChatClient, ChatRequest, complete_with_retry};
use std::sync::Arc;
use thiserror::Error;

/// Fixed message returned when no relevant content exists for the query.
///
/// This exact string is also the closed-book escape hatch for the generation call, so
/// both refusal paths are indistinguishable to the client.
pub const REFUSAL_MESSAGE: &str =
    "The document does not contain information relevant to this question.";

/// Canned reply when the greeting call itself fails.
const GREETING_FALLBACK: &str =
    "Hello! Upload a document and ask me anything about its contents.";

/// Errors that fail a whole chat turn.
///
/// Language-model failures never appear here; they degrade inside the owning state.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Query could not be embedded for retrieval.
    #[error("Failed to embed query: {0}")]
    Embedding(String),
    /// Similarity search against the index failed.
    #[error("Index search failed: {0}")]
    Index(#[from] IndexError),
}

/// Tunables threaded into the orchestrator from configuration.
#[derive(Clone, Copy, Debug)]
pub struct AgentSettings {
    /// Candidates fetched per retrieval pass.
    pub top_k: usize,
    /// Maximum number of query rewrites before refusing.
    pub max_retries: u32,
}

/// Non-text or text entry that grounded the answer, echoed back to the client.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SupportingDocument {
    /// Kind of the source element.
    pub element_type: ElementKind,
    /// 1-based page of the source element.
    pub page_number: u32,
    /// Image reference for table/figure entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,
}

/// Terminal result of one orchestration run.
#[derive(Clone, Debug)]
pub enum TurnOutcome {
    /// Grounded answer with the entries that supported it.
    Answer {
        /// Answer text produced by the generation call.
        text: String,
        /// Supporting entries; contains at most one non-text element.
        documents: Vec<SupportingDocument>,
    },
    /// Deliberate refusal; a normal outcome, not an error.
    Refusal,
}

/// Per-query state local to one orchestration run.
#[derive(Debug)]
struct ConversationTurn {
    original_query: String,
    current_query: String,
    retry_count: u32,
}

/// States of the orchestration machine. Transition data rides in the variants.
#[derive(Debug)]
enum TurnState {
    Router,
    DirectAnswer,
    Retrieve,
    Grade(Vec<ScoredEntry>),
    Rewrite,
    Generate(Vec<ScoredEntry>),
    Refuse,
}

/// One transition step: continue in a new state or finish with an outcome.
enum Step {
    Continue(TurnState),
    Done(TurnOutcome),
}

/// Drives the Router/Retrieve/Grade/Generate/Rewrite cycle for chat queries.
pub struct Orchestrator {
    chat: Arc<dyn ChatClient>,
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    settings: AgentSettings,
}

impl Orchestrator {
    /// Assemble an orchestrator from its collaborators.
    pub fn new(
        chat: Arc<dyn ChatClient>,
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            chat,
            embedder,
            index,
            settings,
        }
    }

    /// Run one full turn for `query`.
    pub async fn run(&self, query: &str) -> Result<TurnOutcome, AgentError> {
        let mut turn = ConversationTurn {
            original_query: query.to_string(),
            current_query: query.to_string(),
            retry_count: 0,
        };
        let mut state = TurnState::Router;

        loop {
            match self.advance(state, &mut turn).await? {
                Step::Continue(next) => state = next,
                Step::Done(outcome) => return Ok(outcome),
            }
        }
    }

    async fn advance(
        &self,
        state: TurnState,
        turn: &mut ConversationTurn,
    ) -> Result<Step, AgentError> {
        match state {
            TurnState::Router => Ok(Step::Continue(self.route(turn).await)),
            TurnState::DirectAnswer => Ok(Step::Done(self.direct_answer(turn).await)),
            TurnState::Retrieve => {
                let candidates = self.retrieve(turn).await?;
                Ok(Step::Continue(TurnState::Grade(candidates)))
            }
            TurnState::Grade(candidates) => {
                let relevant = self.grade(turn, candidates).await;
                if !relevant.is_empty() {
                    Ok(Step::Continue(TurnState::Generate(relevant)))
                } else if turn.retry_count < self.settings.max_retries {
                    Ok(Step::Continue(TurnState::Rewrite))
                } else {
                    Ok(Step::Continue(TurnState::Refuse))
                }
            }
            TurnState::Rewrite => {
                self.rewrite(turn).await;
                Ok(Step::Continue(TurnState::Retrieve))
            }
            TurnState::Generate(relevant) => Ok(Step::Done(self.generate(turn, relevant).await)),
            TurnState::Refuse => {
                tracing::info!(
                    query = %turn.original_query,
                    rewrites = turn.retry_count,
                    "Refusing: no relevant content found"
                );
                Ok(Step::Done(TurnOutcome::Refusal))
            }
        }
    }

    /// Classify the query against a closed label set; malformed labels and call failures
    /// both default to retrieval.
    async fn route(&self, turn: &ConversationTurn) -> TurnState {
        let request = ChatRequest {
            prompt: prompts::router(&turn.current_query),
            temperature: 0.0,
            max_tokens: 8,
        };
        match complete_with_retry(self.chat.as_ref(), request).await {
            Ok(label) if is_greeting_label(&label) => TurnState::DirectAnswer,
            Ok(label) => {
                if !label.trim().eq_ignore_ascii_case("question") {
                    tracing::debug!(label = %label, "Unrecognized router label, retrieving");
                }
                TurnState::Retrieve
            }
            Err(error) => {
                tracing::warn!(error = %error, "Router call failed, defaulting to retrieval");
                TurnState::Retrieve
            }
        }
    }

    async fn direct_answer(&self, turn: &ConversationTurn) -> TurnOutcome {
        let request = ChatRequest {
            prompt: prompts::greeting(&turn.current_query),
            temperature: 0.7,
            max_tokens: 128,
        };
        let text = match complete_with_retry(self.chat.as_ref(), request).await {
            Ok(text) => text,
            Err(error) => {
                tracing::warn!(error = %error, "Greeting call failed, using canned reply");
                GREETING_FALLBACK.to_string()
            }
        };
        TurnOutcome::Answer {
            text,
            documents: Vec::new(),
        }
    }

    async fn retrieve(&self, turn: &ConversationTurn) -> Result<Vec<ScoredEntry>, AgentError> {
        let vector = self
            .embedder
            .generate_embeddings(vec![turn.current_query.clone()])
            .await
            .map_err(|error| AgentError::Embedding(error.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Embedding("embedder returned no vector".to_string()))?;

        let candidates = self.index.search(vector, self.settings.top_k).await?;
        tracing::debug!(
            candidates = candidates.len(),
            retry = turn.retry_count,
            "Retrieved candidates"
        );
        Ok(candidates)
    }

    /// Grade each candidate with a binary relevance call, then enforce the single
    /// non-text survivor rule.
    async fn grade(
        &self,
        turn: &ConversationTurn,
        candidates: Vec<ScoredEntry>,
    ) -> Vec<ScoredEntry> {
        let mut text_entries = Vec::new();
        let mut visual_entries = Vec::new();

        for candidate in candidates {
            let is_text = candidate.payload.element_type == ElementKind::Text;
            let prompt = if is_text {
                prompts::grade_text(&turn.current_query, &candidate.payload.shadow_text)
            } else {
                prompts::grade_visual(
                    &turn.current_query,
                    candidate.payload.element_type.as_str(),
                    &candidate.payload.shadow_text,
                )
            };
            let request = ChatRequest {
                prompt,
                temperature: 0.0,
                max_tokens: 8,
            };

            let admitted = match complete_with_retry(self.chat.as_ref(), request).await {
                // Text is lenient: admitted unless clearly judged unrelated. Visual
                // content is strict: admitted only on an explicit yes.
                Ok(verdict) if is_text => !verdict.to_lowercase().starts_with("no"),
                Ok(verdict) => verdict.to_lowercase().starts_with("yes"),
                Err(error) => {
                    tracing::warn!(error = %error, "Grade call failed, rejecting candidate");
                    false
                }
            };

            if admitted {
                if is_text {
                    text_entries.push(candidate);
                } else {
                    visual_entries.push(candidate);
                }
            }
        }

        let mut relevant = text_entries;
        if let Some(survivor) = pick_visual_survivor(visual_entries) {
            relevant.push(survivor);
        }
        relevant
    }

    /// Transform the query for better recall. A failed call keeps the current query;
    /// the retry counter advances either way so the loop bound holds.
    async fn rewrite(&self, turn: &mut ConversationTurn) {
        let request = ChatRequest {
            prompt: prompts::rewrite(&turn.original_query, &turn.current_query),
            temperature: 0.3,
            max_tokens: 128,
        };
        match complete_with_retry(self.chat.as_ref(), request).await {
            Ok(rewritten) if !rewritten.trim().is_empty() => {
                tracing::debug!(
                    original = %turn.original_query,
                    rewritten = %rewritten,
                    "Rewrote query"
                );
                turn.current_query = rewritten.trim().to_string();
            }
            Ok(_) => {
                tracing::warn!("Rewrite returned empty text, keeping current query");
            }
            Err(error) => {
                tracing::warn!(error = %error, "Rewrite call failed, keeping current query");
            }
        }
        turn.retry_count += 1;
    }

    /// Closed-book generation over the relevant set. A failed call, or a completion that
    /// itself emits the refusal string, terminates the turn as a refusal.
    async fn generate(&self, turn: &ConversationTurn, relevant: Vec<ScoredEntry>) -> TurnOutcome {
        let context = format_context(&relevant);
        let request = ChatRequest {
            prompt: prompts::generate(&turn.original_query, &context, REFUSAL_MESSAGE),
            temperature: 0.1,
            max_tokens: 1024,
        };

        let text = match complete_with_retry(self.chat.as_ref(), request).await {
            Ok(text) => text,
            Err(error) => {
                tracing::warn!(error = %error, "Generation failed after retry, refusing");
                return TurnOutcome::Refusal;
            }
        };

        if text.contains(REFUSAL_MESSAGE) {
            return TurnOutcome::Refusal;
        }

        let documents = relevant
            .into_iter()
            .map(|entry| SupportingDocument {
                element_type: entry.payload.element_type,
                page_number: entry.payload.page_number,
                image_reference: entry.payload.image_reference,
            })
            .collect();
        TurnOutcome::Answer { text, documents }
    }
}

/// Whether a router completion is exactly the `greeting` label.
///
/// Strict on purpose: anything that is not the label itself (including text that merely
/// mentions "greeting") falls through to retrieval, the fail-open default.
fn is_greeting_label(label: &str) -> bool {
    label
        .trim()
        .trim_matches(|c: char| !c.is_ascii_alphabetic())
        .eq_ignore_ascii_case("greeting")
}

/// Keep the single best non-text candidate: highest similarity, lower page on ties.
fn pick_visual_survivor(candidates: Vec<ScoredEntry>) -> Option<ScoredEntry> {
    candidates.into_iter().reduce(|best, challenger| {
        let better = challenger.score > best.score
            || (challenger.score == best.score
                && challenger.payload.page_number < best.payload.page_number);
        if better { challenger } else { best }
    })
}

fn format_context(relevant: &[ScoredEntry]) -> String {
    relevant
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            format!(
                "[{}] ({}, page {}) {}",
                index + 1,
                entry.payload.element_type.as_str(),
                entry.payload.page_number,
                entry.payload.shadow_text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DeterministicEmbeddingClient;
    use crate::index::{EntryPayload, MemoryIndex, NewEntry};
    use crate::llm::ChatClientError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Chat stub that replays a fixed script and records every prompt it was sent.
    struct ScriptedChat {
        script: Mutex<VecDeque<Result<String, String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedChat {
        fn new(script: Vec<Result<&str, &str>>) -> Self {
            Self {
                script: Mutex::new(
                    script
                        .into_iter()
                        .map(|entry| entry.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().expect("prompt lock").clone()
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedChat {
        async fn complete(&self, request: ChatRequest) -> Result<String, ChatClientError> {
            self.prompts.lock().expect("prompt lock").push(request.prompt);
            match self.script.lock().expect("script lock").pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(message)) => Err(ChatClientError::CompletionFailed(message)),
                None => panic!("chat stub ran out of scripted responses"),
            }
        }
    }

    fn entry(kind: ElementKind, page: u32, text: &str, score_hint: Vec<f32>) -> NewEntry {
        NewEntry {
            payload: EntryPayload {
                shadow_text: text.into(),
                element_type: kind,
                page_number: page,
                image_reference: match kind {
                    ElementKind::Text => None,
                    _ => Some(format!("{}_{page}_0.png", kind.as_str())),
                },
                source_document: "doc.md".into(),
                ingested_at: None,
            },
            vector: score_hint,
        }
    }

    async fn orchestrator(
        chat: Arc<ScriptedChat>,
        entries: Vec<NewEntry>,
        max_retries: u32,
    ) -> Orchestrator {
        let index = Arc::new(MemoryIndex::new());
        if !entries.is_empty() {
            index.upsert(entries).await.expect("seed index");
        }
        Orchestrator::new(
            chat,
            Arc::new(DeterministicEmbeddingClient::new(8)),
            index,
            AgentSettings {
                top_k: 10,
                max_retries,
            },
        )
    }

    fn seed_vector() -> Vec<f32> {
        vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
    }

    #[tokio::test]
    async fn greeting_bypasses_retrieval_entirely() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok("greeting"),
            Ok("Hello! How can I help?"),
        ]));
        let orchestrator = orchestrator(chat.clone(), Vec::new(), 2).await;

        let outcome = orchestrator.run("hi").await.expect("turn completes");
        match outcome {
            TurnOutcome::Answer { text, documents } => {
                assert_eq!(text, "Hello! How can I help?");
                assert!(documents.is_empty());
            }
            TurnOutcome::Refusal => panic!("greeting must not refuse"),
        }
        // Exactly the router and greeting calls; no grading or generation prompts.
        assert_eq!(chat.prompts().len(), 2);
    }

    #[tokio::test]
    async fn router_label_merely_mentioning_greeting_still_retrieves() {
        // A malformed label must fail open toward retrieval: with an empty index the
        // turn then burns its rewrite budget and refuses instead of replying directly.
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok("This is not a greeting, it asks about the document."),
            Ok("rewrite one"),
            Ok("rewrite two"),
        ]));
        let orchestrator = orchestrator(chat.clone(), Vec::new(), 2).await;

        let outcome = orchestrator
            .run("what does the table show?")
            .await
            .expect("turn completes");
        assert!(matches!(outcome, TurnOutcome::Refusal));
    }

    #[test]
    fn greeting_label_matching_is_exact() {
        assert!(is_greeting_label("greeting"));
        assert!(is_greeting_label("  Greeting.  "));
        assert!(is_greeting_label("`greeting`"));
        assert!(!is_greeting_label("not a greeting"));
        assert!(!is_greeting_label("question"));
        assert!(!is_greeting_label(""));
    }

    #[tokio::test]
    async fn empty_index_refuses_without_generation_calls() {
        // Router + two rewrite calls; retrieval finds nothing so grading never runs.
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok("question"),
            Ok("rewrite one"),
            Ok("rewrite two"),
        ]));
        let orchestrator = orchestrator(chat.clone(), Vec::new(), 2).await;

        let outcome = orchestrator
            .run("what is cardiac output?")
            .await
            .expect("turn completes");
        assert!(matches!(outcome, TurnOutcome::Refusal));
        assert!(
            chat.prompts()
                .iter()
                .all(|prompt| !prompt.contains("outside knowledge")),
            "no generation prompt may be issued"
        );
    }

    #[tokio::test]
    async fn rewrite_loop_runs_exactly_max_retries_times() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok("question"),
            Ok("no"), // grade pass 1
            Ok("first rewrite"),
            Ok("no"), // grade pass 2
            Ok("second rewrite"),
            Ok("no"), // grade pass 3
        ]));
        let entries = vec![entry(ElementKind::Text, 1, "unrelated prose", seed_vector())];
        let orchestrator = orchestrator(chat.clone(), entries, 2).await;

        let outcome = orchestrator.run("question?").await.expect("turn completes");
        assert!(matches!(outcome, TurnOutcome::Refusal));

        let rewrites = chat
            .prompts()
            .iter()
            .filter(|prompt| prompt.contains("Rewrite the question"))
            .count();
        assert_eq!(rewrites, 2, "exactly max_retries rewrites, never more");
    }

    #[tokio::test]
    async fn at_most_one_visual_element_survives_grading() {
        // Both figures pass the strict grade; only the higher-similarity one may remain.
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok("question"),
            Ok("yes"), // figure on page 1
            Ok("yes"), // figure on page 3
            Ok("The diagram shows the four chambers."),
        ]));
        let entries = vec![
            entry(ElementKind::Figure, 1, "Figure 1: heart chambers", seed_vector()),
            entry(
                ElementKind::Figure,
                3,
                "Figure 7: vascular tree",
                vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            ),
        ];
        let orchestrator = orchestrator(chat, entries, 2).await;

        let outcome = orchestrator.run("heart?").await.expect("turn completes");
        match outcome {
            TurnOutcome::Answer { documents, .. } => {
                let visuals: Vec<_> = documents
                    .iter()
                    .filter(|document| document.element_type != ElementKind::Text)
                    .collect();
                assert_eq!(visuals.len(), 1);
            }
            TurnOutcome::Refusal => panic!("graded candidates must generate"),
        }
    }

    #[tokio::test]
    async fn generation_echoing_the_refusal_string_refuses() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok("question"),
            Ok("yes"),
            Ok(REFUSAL_MESSAGE),
        ]));
        let entries = vec![entry(ElementKind::Text, 1, "some prose", seed_vector())];
        let orchestrator = orchestrator(chat, entries, 2).await;

        let outcome = orchestrator.run("question?").await.expect("turn completes");
        assert!(matches!(outcome, TurnOutcome::Refusal));
    }

    #[tokio::test]
    async fn router_failure_defaults_to_retrieval() {
        // Router errors twice (initial + retry), then the machine proceeds to retrieve
        // against an empty index and refuses after the rewrite budget.
        let chat = Arc::new(ScriptedChat::new(vec![
            Err("timeout"),
            Err("timeout"),
            Ok("rewrite one"),
            Ok("rewrite two"),
        ]));
        let orchestrator = orchestrator(chat, Vec::new(), 2).await;

        let outcome = orchestrator.run("question?").await.expect("turn completes");
        assert!(matches!(outcome, TurnOutcome::Refusal));
    }

    #[tokio::test]
    async fn generation_failure_degrades_to_refusal() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok("question"),
            Ok("yes"),
            Err("provider down"),
            Err("provider down"),
        ]));
        let entries = vec![entry(ElementKind::Text, 1, "some prose", seed_vector())];
        let orchestrator = orchestrator(chat, entries, 2).await;

        let outcome = orchestrator.run("question?").await.expect("turn completes");
        assert!(matches!(outcome, TurnOutcome::Refusal));
    }

    #[test]
    fn equal_scores_tie_break_on_lower_page() {
        let make = |page: u32| ScoredEntry {
            id: format!("id-{page}"),
            score: 0.8,
            payload: EntryPayload {
                shadow_text: "shadow".into(),
                element_type: ElementKind::Table,
                page_number: page,
                image_reference: None,
                source_document: "doc.md".into(),
                ingested_at: None,
            },
        };
        let survivor = pick_visual_survivor(vec![make(5), make(2), make(9)]).expect("survivor");
        assert_eq!(survivor.payload.page_number, 2);
    }
}
