//! Prompt construction: context formatting, link removal, and message layout.

use std::sync::OnceLock;

use regex::Regex;

use crate::models::{Chunk, Message};

/// Default system instruction. `{context}` is replaced with the formatted
/// retrieval context.
pub const SYSTEM_TEMPLATE: &str = "Answer the user's question using only the context below. \
If the context does not contain the answer, say that you don't know. \
Keep the answer short: no more than three sentences.\n\nContext:\n{context}";

/// Delimiter line written after each chunk in the formatted context.
pub const CHUNK_DELIMITER: &str = "---";

fn link_regex() -> &'static Regex {
    static LINK_RE: OnceLock<Regex> = OnceLock::new();
    LINK_RE.get_or_init(|| {
        Regex::new(r"https?://(?:[a-zA-Z]|[0-9]|[$-_@.&+]|[!*\(\),]|%[0-9a-fA-F]{2})+")
            .expect("link pattern is valid")
    })
}

/// Remove every `http://` or `https://` URL from `text`.
pub fn remove_links(text: &str) -> String {
    link_regex().replace_all(text, "").into_owned()
}

/// Concatenate chunk texts in order, each followed by a `---` line, with
/// links stripped from the result.
pub fn format_context(chunks: &[Chunk]) -> String {
    let mut lines = Vec::with_capacity(chunks.len() * 2);
    for chunk in chunks {
        lines.push(chunk.text.as_str());
        lines.push(CHUNK_DELIMITER);
    }
    remove_links(&lines.join("\n"))
}

/// Render the full prompt: system instruction with context, prior turns,
/// then the new question.
pub fn build_messages(
    template: &str,
    context: &str,
    history: &[Message],
    question: &str,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(template.replace("{context}", context)));
    messages.extend(history.iter().cloned());
    messages.push(Message::user(question));
    messages
}

/// Prompt asking whether one passage helps answer a question.
pub fn relevance_prompt(question: &str, passage: &str) -> Vec<Message> {
    vec![
        Message::system(
            "You judge whether a passage is relevant to a question. \
             Reply with YES or NO only.",
        ),
        Message::user(format!(
            "Question: {}\n\nPassage:\n{}\n\nIs the passage relevant to the question?",
            question, passage
        )),
    ]
}
