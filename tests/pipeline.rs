//! End-to-end pipeline tests over the SQLite index with the offline hash
//! embedder and scripted chat models.

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use tempfile::TempDir;

use docmind::config::Config;
use docmind::ingest::ingest;
use docmind::sqlite_store::SqliteStore;
use docmind::{db, migrate};
use docmind_core::embedding::{EmbeddingProvider, HashEmbedder};
use docmind_core::error::RagError;
use docmind_core::history::InMemoryHistory;
use docmind_core::llm::{ChatModel, TokenStream};
use docmind_core::models::{Message, Role};
use docmind_core::pipeline::{AnswerPipeline, Event, PipelineOptions};
use docmind_core::retrieve::Retriever;
use docmind_core::store::VectorIndex;

/// Streams a fixed list of fragments and records every prompt it receives.
struct ScriptedModel {
    fragments: Vec<Result<String, String>>,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    fn answering(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| Ok(f.to_string())).collect(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn failing_after(fragments: &[&str]) -> Self {
        let mut model = Self::answering(fragments);
        model.fragments.push(Err("connection reset".to_string()));
        model
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(&self, messages: &[Message]) -> anyhow::Result<TokenStream> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        let items: Vec<anyhow::Result<String>> = self
            .fragments
            .iter()
            .map(|f| f.clone().map_err(|e| anyhow!(e)))
            .collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

struct TestEnv {
    _tmp: TempDir,
    config: Config,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
}

async fn setup() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let config: Config = toml::from_str(&format!(
        "[db]\npath = \"{root}/docmind.sqlite\"\n[storage]\nstaging_dir = \"{root}/staging\"\n",
        root = tmp.path().display()
    ))
    .unwrap();

    let pool = db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();

    TestEnv {
        _tmp: tmp,
        config,
        index: Arc::new(SqliteStore::new(pool)),
        embedder: Arc::new(HashEmbedder::new(64)),
    }
}

fn upload(name: &str, text: &str) -> (String, Vec<u8>) {
    (name.to_string(), text.as_bytes().to_vec())
}

fn pipeline(env: &TestEnv, model: Arc<dyn ChatModel>, cap: usize) -> AnswerPipeline {
    let retriever = Retriever::new(env.index.clone(), env.embedder.clone(), "documents", 5);
    AnswerPipeline::new(
        Arc::new(retriever),
        model,
        Arc::new(InMemoryHistory::new()),
        PipelineOptions {
            conversation_cap: cap,
            ..Default::default()
        },
    )
}

async fn sources(env: &TestEnv, query: &str) -> Vec<String> {
    let query = env.embedder.embed_query(query).await.unwrap();
    env.index
        .similarity_search("documents", &query, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.chunk.source().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_full_turn_over_ingested_collection() {
    let env = setup().await;
    ingest(
        &env.config,
        env.index.clone(),
        env.embedder.clone(),
        &[upload("france.txt", "Paris is the capital of France. ---")],
    )
    .await
    .unwrap();

    let model = Arc::new(ScriptedModel::answering(&["Paris", " is the capital."]));
    let pipeline = pipeline(&env, model.clone(), 6);

    let events: Vec<_> = pipeline
        .ask("What is the capital of France?", "s1")
        .collect()
        .await;

    let contexts: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Ok(Event::Context(chunks)) => Some(chunks.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].len(), 1);
    assert_eq!(contexts[0][0].text, "Paris is the capital of France. ---");
    assert!(matches!(events[0], Ok(Event::Context(_))));

    let Some(Ok(Event::AnswerDelta(last))) = events.last() else {
        panic!("expected a final answer delta, got {:?}", events.last());
    };
    assert_eq!(last, "Paris is the capital.");

    let history = pipeline.history("s1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1], Message::assistant("Paris is the capital."));

    let prompts = model.prompts.lock().unwrap();
    assert!(prompts[0][0].content.contains("Paris is the capital of France."));
}

#[tokio::test]
async fn test_reingest_replaces_previous_documents() {
    let env = setup().await;
    ingest(
        &env.config,
        env.index.clone(),
        env.embedder.clone(),
        &[upload("a.md", "Apples grow on trees."), upload("b.md", "Bananas are yellow.")],
    )
    .await
    .unwrap();

    let handle = ingest(
        &env.config,
        env.index.clone(),
        env.embedder.clone(),
        &[upload("c.md", "Cherries are small and red.")],
    )
    .await
    .unwrap();
    assert_eq!(handle.documents, 1);

    let found = sources(&env, "apples bananas cherries").await;
    assert!(!found.is_empty());
    assert!(found.iter().all(|s| s == "c.md"), "stale chunks: {:?}", found);

    let info = env.index.collection_info("documents").await.unwrap().unwrap();
    assert_eq!(info.chunks, handle.chunks);
}

#[tokio::test]
async fn test_failed_ingest_is_all_or_nothing() {
    let env = setup().await;
    ingest(
        &env.config,
        env.index.clone(),
        env.embedder.clone(),
        &[upload("keep.md", "This collection should survive.")],
    )
    .await
    .unwrap();

    let result = ingest(
        &env.config,
        env.index.clone(),
        env.embedder.clone(),
        &[
            upload("new.md", "A replacement document."),
            ("corrupt.docx".to_string(), b"PK broken".to_vec()),
        ],
    )
    .await;
    assert!(matches!(result, Err(RagError::Ingestion(_))));

    assert_eq!(sources(&env, "collection").await, vec!["keep.md".to_string()]);
}

#[tokio::test]
async fn test_generation_failure_leaves_history_unchanged() {
    let env = setup().await;
    ingest(
        &env.config,
        env.index.clone(),
        env.embedder.clone(),
        &[upload("france.txt", "Paris is the capital of France.")],
    )
    .await
    .unwrap();

    let pipeline = pipeline(&env, Arc::new(ScriptedModel::failing_after(&["Par"])), 6);
    let events: Vec<_> = pipeline.ask("Capital of France?", "s1").collect().await;

    assert!(matches!(events[1], Ok(Event::AnswerDelta(ref a)) if a == "Par"));
    assert!(matches!(events.last(), Some(Err(RagError::Generation(_)))));
    assert_eq!(pipeline.history_len("s1"), 0);
}

#[tokio::test]
async fn test_conversation_cap_warns_but_turns_continue() {
    let env = setup().await;
    ingest(
        &env.config,
        env.index.clone(),
        env.embedder.clone(),
        &[upload("notes.txt", "Some notes about nothing in particular.")],
    )
    .await
    .unwrap();

    let pipeline = pipeline(&env, Arc::new(ScriptedModel::answering(&["ok"])), 6);
    for turn in 0..3 {
        assert!(!pipeline.cap_reached("s1"), "cap reached early at turn {}", turn);
        let events: Vec<_> = pipeline.ask("anything?", "s1").collect().await;
        assert!(events.iter().all(|e| e.is_ok()));
    }
    assert_eq!(pipeline.history_len("s1"), 6);
    assert!(pipeline.cap_reached("s1"));

    let events: Vec<_> = pipeline.ask("one more?", "s1").collect().await;
    assert!(events.iter().all(|e| e.is_ok()));
    assert_eq!(pipeline.history_len("s1"), 8);
}
