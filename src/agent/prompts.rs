//! Prompt builders for the orchestrator's language-model calls.
//!
//! Every prompt pins the expected output shape (a closed label, a yes/no verdict, or a
//! rewritten question) so callers can parse responses with plain string checks.

/// Closed-label routing prompt: `greeting` or `question`.
pub(super) fn router(query: &str) -> String {
    format!(
        "Classify the user message below with exactly one word.\n\
Reply `greeting` if it is conversational small-talk with no information need \
(greetings, thanks, goodbyes). Reply `question` for anything else.\n\n\
Message: {query}\n\nLabel:"
    )
}

/// Short friendly reply for small-talk; no document context involved.
pub(super) fn greeting(query: &str) -> String {
    format!(
        "You are a helpful document-question-answering assistant. The user sent a \
conversational message, not a question about the document. Reply briefly and warmly, and \
invite them to ask about the uploaded document.\n\nUser message: {query}"
    )
}

/// Lenient relevance check for text chunks: reject only when clearly unrelated.
pub(super) fn grade_text(query: &str, chunk: &str) -> String {
    format!(
        "Does the passage below contain anything that could help answer the question? \
Be permissive: answer `no` only when the passage is clearly unrelated to the question's \
topic. Answer with exactly `yes` or `no`.\n\n\
Question: {query}\n\nPassage:\n{chunk}\n\nAnswer:"
    )
}

/// Strict relevance check for tables and figures.
pub(super) fn grade_visual(query: &str, kind: &str, shadow_text: &str) -> String {
    format!(
        "The description below summarizes a {kind} from a document. Answer `yes` only if \
the {kind} itself plausibly answers the question directly; if it is merely related to the \
topic, answer `no`. Answer with exactly `yes` or `no`.\n\n\
Question: {query}\n\nDescription of the {kind}:\n{shadow_text}\n\nAnswer:"
    )
}

/// Recall-oriented query transformation.
pub(super) fn rewrite(original: &str, current: &str) -> String {
    format!(
        "Rewrite the question below to improve document retrieval: expand abbreviations, \
add likely domain terminology, and make the information need explicit. Output only the \
rewritten question.\n\n\
Original question: {original}\nPrevious attempt: {current}\n\nRewritten question:"
    )
}

/// Closed-book answer generation over the graded context.
pub(super) fn generate(query: &str, context: &str, refusal: &str) -> String {
    format!(
        "Answer the question using only the context below. Do not use outside knowledge. \
If the context is insufficient to answer, reply with exactly:\n{refusal}\n\n\
Context:\n{context}\n\nQuestion: {query}\n\nAnswer:"
    )
}
