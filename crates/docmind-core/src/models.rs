//! Core data models shared by ingestion and retrieval.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A bounded span of document text, the atomic unit of retrieval.
///
/// `start_offset` is the character offset of `text` within the
/// concatenated source document. Chunks produced from one document have
/// non-decreasing offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub chunk_index: i64,
    pub start_offset: usize,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Chunk {
    /// Returns the `source` metadata entry (the originating file name), if any.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(|v| v.as_str())
    }
}

/// A chunk together with its embedding, as persisted in a collection.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// A chunk with a relevance score attached by search or reranking.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message of a conversation or prompt.
///
/// Conversation history only ever holds `User` and `Assistant` messages;
/// `System` appears in rendered prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}
