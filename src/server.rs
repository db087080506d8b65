//! HTTP server exposing the streaming answer protocol.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/ask` | Run one turn; responds with a server-sent event stream |
//! | `GET`  | `/sessions/{id}/history` | Session messages and cap status |
//!
//! # `POST /ask` event stream
//!
//! ```text
//! event: context   data: [Chunk, ...]            exactly once, before any answer
//! event: answer    data: "cumulative answer"     zero or more
//! event: done      data: {"session_id": "..."}   turn completed and recorded
//! event: error     data: {"code": "...", "message": "..."}   turn failed (terminal)
//! ```
//!
//! A stream that ends with `error` instead of `done` is a failed turn; any
//! `answer` events already received are an incomplete answer.
//!
//! # Error Contract
//!
//! Non-stream errors use the JSON shape
//! `{ "error": { "code": "bad_request", "message": "question must not be empty" } }`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted for browser clients.

use async_stream::stream;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tower_http::cors::{Any, CorsLayer};

use docmind_core::models::Message;
use docmind_core::pipeline::{AnswerPipeline, Event};

use crate::ask::build_pipeline;
use crate::config::Config;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    pipeline: AnswerPipeline,
}

/// Starts the HTTP server on `[server] bind` and runs until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = build_pipeline(config).await?;
    let app = router(pipeline);

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("DocuMind server listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router over an assembled pipeline.
pub fn router(pipeline: AnswerPipeline) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ask", post(handle_ask))
        .route("/sessions/{id}/history", get(handle_history))
        .layer(cors)
        .with_state(AppState { pipeline })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    /// A fresh session is started when omitted.
    #[serde(default)]
    session_id: Option<String>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, AppError> {
    let question = req.question.trim().to_string();
    if question.is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let session_id = match req.session_id {
        Some(id) if !id.trim().is_empty() => id,
        Some(_) => return Err(bad_request("session_id must not be empty")),
        None => uuid::Uuid::new_v4().to_string(),
    };

    let mut events = state.pipeline.ask(question, session_id.clone());
    let sse = stream! {
        while let Some(item) = events.next().await {
            match item {
                Ok(Event::Context(chunks)) => yield Ok(json_event("context", &chunks)),
                Ok(Event::AnswerDelta(answer)) => yield Ok(json_event("answer", &answer)),
                Err(e) => {
                    let detail = ErrorDetail {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    };
                    yield Ok(json_event("error", &detail));
                    return;
                }
            }
        }
        yield Ok(json_event("done", &serde_json::json!({ "session_id": session_id })));
    };

    Ok(Sse::new(sse).keep_alive(KeepAlive::default()))
}

fn json_event<T: Serialize>(name: &str, value: &T) -> SseEvent {
    let data = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    SseEvent::default().event(name).data(data)
}

// ============ GET /sessions/{id}/history ============

#[derive(Serialize)]
struct HistoryResponse {
    session_id: String,
    messages: Vec<Message>,
    cap_reached: bool,
}

async fn handle_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<HistoryResponse> {
    Json(HistoryResponse {
        messages: state.pipeline.history(&id),
        cap_reached: state.pipeline.cap_reached(&id),
        session_id: id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docmind_core::embedding::HashEmbedder;
    use docmind_core::history::InMemoryHistory;
    use docmind_core::llm::{ChatModel, TokenStream};
    use docmind_core::models::{Chunk, IndexEntry};
    use docmind_core::pipeline::PipelineOptions;
    use docmind_core::retrieve::Retriever;
    use docmind_core::store::memory::InMemoryIndex;
    use docmind_core::store::VectorIndex;
    use std::sync::Arc;

    struct EchoModel;

    #[async_trait]
    impl ChatModel for EchoModel {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn stream_chat(&self, _messages: &[Message]) -> anyhow::Result<TokenStream> {
            let parts = vec![Ok("Paris".to_string()), Ok(" it is.".to_string())];
            Ok(Box::pin(futures::stream::iter(parts)))
        }
    }

    async fn spawn_app() -> (String, Arc<InMemoryHistory>) {
        let embedder = Arc::new(HashEmbedder::new(32));
        let index = Arc::new(InMemoryIndex::new());
        let text = "Paris is the capital of France.";
        let entry = IndexEntry {
            chunk: Chunk {
                id: "c1".to_string(),
                chunk_index: 0,
                start_offset: 0,
                text: text.to_string(),
                metadata: Default::default(),
            },
            embedding: embedder.embed_text(text),
        };
        index
            .replace_collection("documents", "hash-32", &[entry])
            .await
            .unwrap();

        let retriever = Retriever::new(index, embedder, "documents", 3);
        let history = Arc::new(InMemoryHistory::new());
        let pipeline = AnswerPipeline::new(
            Arc::new(retriever),
            Arc::new(EchoModel),
            history.clone(),
            PipelineOptions {
                conversation_cap: 2,
                ..Default::default()
            },
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(pipeline)).await.unwrap();
        });
        (format!("http://{}", addr), history)
    }

    #[tokio::test]
    async fn test_health() {
        let (base, _) = spawn_app().await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_ask_streams_events_and_records_history() {
        let (base, _) = spawn_app().await;
        let client = reqwest::Client::new();
        let body = client
            .post(format!("{}/ask", base))
            .json(&serde_json::json!({"question": "What is the capital of France?", "session_id": "s1"}))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        let context_at = body.find("event: context").unwrap();
        let answer_at = body.find("event: answer").unwrap();
        let done_at = body.find("event: done").unwrap();
        assert!(context_at < answer_at && answer_at < done_at);
        assert!(body.contains("data: \"Paris it is.\""));
        assert!(!body.contains("event: error"));

        let history: serde_json::Value = reqwest::get(format!("{}/sessions/s1/history", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["content"], "Paris it is.");
        assert_eq!(history["cap_reached"], true);
    }

    #[tokio::test]
    async fn test_history_of_unknown_session_is_empty_and_not_stored() {
        let (base, history) = spawn_app().await;
        for id in ["ghost-1", "ghost-2"] {
            let body: serde_json::Value = reqwest::get(format!("{}/sessions/{}/history", base, id))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(body["session_id"], id);
            assert!(body["messages"].as_array().unwrap().is_empty());
            assert_eq!(body["cap_reached"], false);
        }
        assert_eq!(history.session_count(), 0);
    }

    #[tokio::test]
    async fn test_ask_rejects_empty_question() {
        let (base, _) = spawn_app().await;
        let response = reqwest::Client::new()
            .post(format!("{}/ask", base))
            .json(&serde_json::json!({"question": "  "}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
    }
}
