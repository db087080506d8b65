//! Streaming answer pipeline.
//!
//! One call to [`AnswerPipeline::ask`] runs one conversational turn and
//! exposes it as a lazy, single-pass stream of [`Event`]s:
//!
//! ```text
//! RECEIVED ──▶ CONTEXT_RETRIEVED ──▶ PROMPT_BUILT ──▶ GENERATING ──▶ COMPLETE
//!     │               │                    │               │
//!     └───────────────┴──────── FAILED ◀───┴───────────────┘
//! ```
//!
//! - Exactly one [`Event::Context`] is emitted once retrieval succeeds,
//!   before any answer text.
//! - Every [`Event::AnswerDelta`] carries the full answer so far.
//! - An `Err` item is terminal and means the turn failed.
//! - The user question and the final answer are appended to the session's
//!   history only when the model stream ends normally and the consumer
//!   drains the event stream. Failed or abandoned turns leave history as it was.
//!
//! Turns for the same session are serialized: a second `ask` on a session
//! waits until the first turn's stream finishes or is dropped.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::error::RagError;
use crate::history::{self, ConversationHistoryRepository};
use crate::llm::ChatModel;
use crate::models::{Chunk, Message};
use crate::prompt::{build_messages, format_context, SYSTEM_TEMPLATE};
use crate::retrieve::Retriever;

/// One item of a turn's event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// The retrieved chunks, in the order they were placed in the prompt.
    Context(Vec<Chunk>),
    /// The cumulative answer text generated so far.
    AnswerDelta(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Received,
    ContextRetrieved,
    PromptBuilt,
    Generating,
    Complete,
    Failed,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnState::Received => "RECEIVED",
            TurnState::ContextRetrieved => "CONTEXT_RETRIEVED",
            TurnState::PromptBuilt => "PROMPT_BUILT",
            TurnState::Generating => "GENERATING",
            TurnState::Complete => "COMPLETE",
            TurnState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, RagError>> + Send>>;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// System instruction containing a `{context}` placeholder.
    pub system_template: String,
    /// Prior messages placed in the prompt; `0` means all of them.
    pub history_window: usize,
    /// Message count at which the conversation-length warning applies; `0` disables it.
    pub conversation_cap: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            system_template: SYSTEM_TEMPLATE.to_string(),
            history_window: 20,
            conversation_cap: 6,
        }
    }
}

/// Lazily created per-session turn locks.
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<futures::lock::Mutex<()>>>>,
}

impl SessionLocks {
    fn get(&self, session_id: &str) -> Arc<futures::lock::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(futures::lock::Mutex::new(())))
            .clone()
    }
}

/// Orchestrates retrieval, prompt construction, generation, and history.
#[derive(Clone)]
pub struct AnswerPipeline {
    retriever: Arc<Retriever>,
    model: Arc<dyn ChatModel>,
    history: Arc<dyn ConversationHistoryRepository>,
    locks: Arc<SessionLocks>,
    options: PipelineOptions,
}

impl AnswerPipeline {
    pub fn new(
        retriever: Arc<Retriever>,
        model: Arc<dyn ChatModel>,
        history: Arc<dyn ConversationHistoryRepository>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            retriever,
            model,
            history,
            locks: Arc::new(SessionLocks::default()),
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// The session's completed turns. Does not create the session.
    pub fn history(&self, session_id: &str) -> Vec<Message> {
        self.history.get(session_id)
    }

    pub fn history_len(&self, session_id: &str) -> usize {
        self.history.len(session_id)
    }

    /// True once the session's message count has reached the configured cap.
    /// Turns still run; callers surface this as a warning.
    pub fn cap_reached(&self, session_id: &str) -> bool {
        history::cap_reached(self.options.conversation_cap, self.history_len(session_id))
    }

    /// Run one turn for `session_id`. Nothing happens until the stream is polled.
    pub fn ask(&self, question: impl Into<String>, session_id: impl Into<String>) -> EventStream {
        let this = self.clone();
        let question = question.into();
        let session_id = session_id.into();

        Box::pin(stream! {
            let lock = this.locks.get(&session_id);
            let _turn = lock.lock().await;

            log_state(&session_id, TurnState::Received);
            let prior = this.history.get_or_create(&session_id);

            let chunks = match this.retriever.retrieve(&question).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    log_failure(&session_id, &e);
                    yield Err(e);
                    return;
                }
            };
            log_state(&session_id, TurnState::ContextRetrieved);
            yield Ok(Event::Context(chunks.clone()));

            let context = format_context(&chunks);
            let messages = build_messages(
                &this.options.system_template,
                &context,
                history::window(&prior, this.options.history_window),
                &question,
            );
            log_state(&session_id, TurnState::PromptBuilt);

            let mut tokens = match this.model.stream_chat(&messages).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    let e = RagError::Generation(e);
                    log_failure(&session_id, &e);
                    yield Err(e);
                    return;
                }
            };
            log_state(&session_id, TurnState::Generating);

            let mut answer = String::new();
            while let Some(fragment) = tokens.next().await {
                match fragment {
                    Ok(text) if text.is_empty() => {}
                    Ok(text) => {
                        answer.push_str(&text);
                        yield Ok(Event::AnswerDelta(answer.clone()));
                    }
                    Err(e) => {
                        let e = RagError::Generation(e);
                        log_failure(&session_id, &e);
                        yield Err(e);
                        return;
                    }
                }
            }

            this.history.append(
                &session_id,
                &[Message::user(question.clone()), Message::assistant(answer)],
            );
            log_state(&session_id, TurnState::Complete);
        })
    }
}

fn log_state(session_id: &str, state: TurnState) {
    tracing::debug!(session = session_id, state = %state, "turn state");
}

fn log_failure(session_id: &str, error: &RagError) {
    let state = TurnState::Failed;
    tracing::warn!(session = session_id, state = %state, "turn failed: {error}");
}
