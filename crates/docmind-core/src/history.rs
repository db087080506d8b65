//! Per-session conversation history.
//!
//! Histories are append-only and created lazily on first reference to a
//! session id. The in-memory repository keeps them for the process lifetime.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::Message;

/// Storage for per-session message histories.
pub trait ConversationHistoryRepository: Send + Sync {
    /// Return a snapshot of the session's messages, creating an empty
    /// history if the session is unseen.
    fn get_or_create(&self, session_id: &str) -> Vec<Message>;

    /// Return a snapshot of the session's messages without creating it.
    /// Unknown sessions read as empty.
    fn get(&self, session_id: &str) -> Vec<Message>;

    /// Append messages to the session, in order.
    fn append(&self, session_id: &str, messages: &[Message]);

    fn len(&self, session_id: &str) -> usize {
        self.get_or_create(session_id).len()
    }
}

#[derive(Default)]
pub struct InMemoryHistory {
    sessions: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions created so far.
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl ConversationHistoryRepository for InMemoryHistory {
    fn get_or_create(&self, session_id: &str) -> Vec<Message> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.entry(session_id.to_string()).or_default().clone()
    }

    fn get(&self, session_id: &str) -> Vec<Message> {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.get(session_id).cloned().unwrap_or_default()
    }

    fn append(&self, session_id: &str, messages: &[Message]) {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions
            .entry(session_id.to_string())
            .or_default()
            .extend(messages.iter().cloned());
    }

    fn len(&self, session_id: &str) -> usize {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.get(session_id).map(Vec::len).unwrap_or(0)
    }
}

/// Whether a session with `len` messages has reached the warning cap.
/// A cap of `0` disables the warning.
pub fn cap_reached(cap: usize, len: usize) -> bool {
    cap > 0 && len >= cap
}

/// The trailing `window` messages of `history`; `0` keeps everything.
pub fn window(history: &[Message], window: usize) -> &[Message] {
    if window == 0 || history.len() <= window {
        history
    } else {
        &history[history.len() - window..]
    }
}
