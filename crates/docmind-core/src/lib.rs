//! # DocuMind Core
//!
//! Runtime-agnostic logic for the DocuMind question-answering pipeline:
//! data models, two-stage chunking, the vector index abstraction, retrieval
//! stages, per-session conversation history, and the streaming answer
//! pipeline.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Concrete
//! embedding, chat-model, reranker, and storage backends live in the
//! `docmind` app crate and plug in through the traits defined here.
//!
//! ## Data Flow
//!
//! ```text
//! ingestion:  PageText ──▶ Chunker ──▶ EmbeddingProvider ──▶ VectorIndex
//!
//! question ──▶ Retriever ──▶ [rerank] ──▶ [relevance filter]
//!                  │                            │
//!                  ▼                            ▼
//!            VectorIndex               AnswerPipeline ──▶ Event stream
//!                                           │
//!                                           ▼
//!                              ConversationHistoryRepository
//! ```

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod retrieve;
pub mod store;

pub use error::{RagError, RagResult};
pub use models::{Chunk, IndexEntry, Message, Role, ScoredChunk};
pub use pipeline::{AnswerPipeline, Event, EventStream, TurnState};
