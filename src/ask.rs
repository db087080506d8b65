//! Question answering commands: `ask` (one turn) and `chat` (REPL).
//!
//! [`build_pipeline`] assembles the retrieval stages once from configuration:
//!
//! ```text
//! similarity search ──▶ [rerank] ──▶ [relevance filter]
//! ```
//!
//! A reranker that fails to load is logged and left out; retrieval then
//! keeps similarity order. With no optional stage configured the retriever
//! runs a single identity stage.

use anyhow::Result;
use futures::StreamExt;
use std::io::{BufRead, Write};
use std::sync::Arc;

use docmind_core::embedding::EmbeddingProvider;
use docmind_core::error::RagError;
use docmind_core::history::{ConversationHistoryRepository, InMemoryHistory};
use docmind_core::llm::ChatModel;
use docmind_core::pipeline::{AnswerPipeline, Event};
use docmind_core::retrieve::{IdentityStage, RelevanceFilterStage, RerankStage, Retriever};
use docmind_core::store::VectorIndex;

use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::llm::create_chat_model;
use crate::rerank::load_reranker;
use crate::sqlite_store::SqliteStore;

/// Build the answer pipeline over the SQLite index described by `config`.
pub async fn build_pipeline(config: &Config) -> Result<AnswerPipeline> {
    let pool = db::connect(config).await?;
    let index: Arc<dyn VectorIndex> = Arc::new(SqliteStore::new(pool));
    let history: Arc<dyn ConversationHistoryRepository> = Arc::new(InMemoryHistory::new());
    assemble_pipeline(config, index, history).await
}

/// Wire providers and retrieval stages around an existing index and history.
pub async fn assemble_pipeline(
    config: &Config,
    index: Arc<dyn VectorIndex>,
    history: Arc<dyn ConversationHistoryRepository>,
) -> Result<AnswerPipeline> {
    let embedder = create_provider(&config.embedding)?;
    let model = create_chat_model(&config.llm)?;
    let retriever = build_retriever(config, index, embedder, model.clone()).await;

    Ok(AnswerPipeline::new(
        Arc::new(retriever),
        model,
        history,
        config.pipeline_options(),
    ))
}

/// Assemble the ordered retrieval stages from `[retrieval]`.
pub async fn build_retriever(
    config: &Config,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    model: Arc<dyn ChatModel>,
) -> Retriever {
    let mut retriever = Retriever::new(
        index,
        embedder,
        config.storage.collection.clone(),
        config.retrieval.k,
    );

    if config.retrieval.use_reranker {
        match load_reranker(&config.retrieval.reranker_model).await {
            Ok(reranker) => {
                retriever = retriever.with_stage(Box::new(RerankStage::new(
                    reranker,
                    config.retrieval.rerank_top_n,
                )));
            }
            Err(e) => {
                let err = RagError::RerankUnavailable(e);
                tracing::warn!("{err}; continuing without reranking");
            }
        }
    }
    if config.retrieval.use_relevance_filter {
        retriever = retriever.with_stage(Box::new(RelevanceFilterStage::new(model)));
    }
    if retriever.stage_names().is_empty() {
        retriever = retriever.with_stage(Box::new(IdentityStage));
    }
    tracing::debug!(stages = ?retriever.stage_names(), "retriever assembled");
    retriever
}

/// Run one turn, printing the context and then the streamed answer.
///
/// Only the newly generated suffix of each cumulative delta is printed, so
/// the answer appears incrementally on stdout.
async fn run_turn(pipeline: &AnswerPipeline, question: &str, session: &str) -> Result<()> {
    let mut events = pipeline.ask(question, session);
    let mut printed = 0usize;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Context(chunks)) => {
                println!("Context ({} chunks):", chunks.len());
                for (i, chunk) in chunks.iter().enumerate() {
                    println!(
                        "  {}. [{}] {}",
                        i + 1,
                        chunk.source().unwrap_or("unknown"),
                        snippet(&chunk.text, 80)
                    );
                }
                println!();
            }
            Ok(Event::AnswerDelta(answer)) => {
                if let Some(fresh) = answer.get(printed..) {
                    print!("{}", fresh);
                    stdout.flush()?;
                }
                printed = answer.len();
            }
            Err(e) => {
                if printed > 0 {
                    println!();
                    println!("[answer incomplete]");
                }
                return Err(e.into());
            }
        }
    }
    println!();
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

pub async fn run_ask(config: &Config, question: &str, session: &str) -> Result<()> {
    let pipeline = build_pipeline(config).await?;
    run_turn(&pipeline, question, session).await
}

/// Interactive chat over stdin. A failed turn is reported and the loop
/// continues; the session's history only grows on successful turns.
pub async fn run_chat(config: &Config, session: &str) -> Result<()> {
    let pipeline = build_pipeline(config).await?;
    let stdin = std::io::stdin();

    println!("docmind chat (session {}). Empty line or Ctrl-D to quit.", session);
    loop {
        if pipeline.cap_reached(session) {
            println!(
                "Warning: this conversation has {} messages (cap {}); consider starting a new session.",
                pipeline.history_len(session),
                pipeline.options().conversation_cap
            );
        }
        print!("> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let question = line.trim();
        if question.is_empty() {
            break;
        }

        if let Err(e) = run_turn(&pipeline, question, session).await {
            eprintln!("Error: {:#}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_flattens_and_truncates() {
        assert_eq!(snippet("a\n\nb   c", 10), "a b c");
        assert_eq!(snippet("abcdefghij", 4), "abcd…");
    }

    fn config(extra: &str) -> Config {
        let src = format!(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"hash\"\ndims = 8\n{}",
            extra
        );
        toml::from_str(&src).unwrap()
    }

    async fn stages_for(config: &Config) -> Vec<String> {
        let index: Arc<dyn VectorIndex> =
            Arc::new(docmind_core::store::memory::InMemoryIndex::new());
        let embedder = create_provider(&config.embedding).unwrap();
        let model = create_chat_model(&config.llm).unwrap();
        let retriever = build_retriever(config, index, embedder, model).await;
        retriever.stage_names().iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_no_optional_stage_uses_identity() {
        let config = config("[retrieval]\nuse_reranker = false\n");
        assert_eq!(stages_for(&config).await, vec!["identity"]);
    }

    #[tokio::test]
    async fn test_reranker_load_failure_drops_stage() {
        let config = config(
            "[retrieval]\nreranker_model = \"no-such-reranker\"\nuse_relevance_filter = true\n",
        );
        assert_eq!(stages_for(&config).await, vec!["relevance_filter"]);
    }

    #[tokio::test]
    async fn test_assembled_pipeline_starts_with_empty_history() {
        let config = config("[retrieval]\nuse_reranker = false\n");
        let index: Arc<dyn VectorIndex> =
            Arc::new(docmind_core::store::memory::InMemoryIndex::new());
        let pipeline = assemble_pipeline(&config, index, Arc::new(InMemoryHistory::new()))
            .await
            .unwrap();
        assert_eq!(pipeline.history_len("s"), 0);
        assert!(!pipeline.cap_reached("s"));
    }
}
