//! # DocuMind
//!
//! Local question answering over your own documents.
//!
//! DocuMind ingests PDF, DOCX, Markdown, and text files into a SQLite-backed
//! vector index, then answers questions with a retrieval-augmented chat
//! model, streaming the retrieved context and the growing answer to a CLI
//! or an HTTP client.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────┐   ┌──────────────┐
//! │  Loader   │──▶│ Chunk + Embed    │──▶│   SQLite     │
//! │ PDF/DOCX  │   │ (semantic+fixed) │   │ collections  │
//! └───────────┘   └──────────────────┘   └──────┬───────┘
//!                                               │
//!                       ┌───────────────────────┤
//!                       ▼                       ▼
//!                  ┌──────────┐  Retriever ┌──────────┐
//!                  │   CLI    │◀─ + LLM ──▶│   HTTP   │
//!                  │ (docmind)│            │   SSE    │
//!                  └──────────┘            └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docmind init                               # create database
//! docmind ingest ./papers                    # index a directory (replaces the collection)
//! docmind ask "What is the main result?"     # one question
//! docmind chat                               # multi-turn conversation
//! docmind serve                              # HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite vector index |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Streaming chat model providers |
//! | [`rerank`] | Cross-encoder reranker |
//! | [`loader`] | PDF / DOCX / text loading |
//! | [`staging`] | Upload staging and path expansion |
//! | [`ingest`] | Full-replace ingestion |
//! | [`ask`] | Pipeline assembly, `ask` and `chat` commands |
//! | [`stats`] | Index statistics |
//! | [`server`] | HTTP server |
//! | [`logging`] | Tracing setup |
//!
//! The chunker, retrieval stages, conversation history, and answer pipeline
//! live in the `docmind-core` crate.

pub mod ask;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod logging;
pub mod migrate;
pub mod rerank;
pub mod server;
pub mod sqlite_store;
pub mod staging;
pub mod stats;
