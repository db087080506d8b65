//! Chat model backends.
//!
//! Implementations of the core [`ChatModel`] trait:
//! - **[`DisabledChat`]**: returns errors; used when no LLM is configured.
//! - **[`OllamaChat`]**: `POST /api/chat` with `stream: true`; the body is
//!   newline-delimited JSON, one object per fragment, ending with `done: true`.
//! - **[`OpenAIChat`]**: `POST /v1/chat/completions` with `stream: true`; the
//!   body is server-sent events (`data: {...}` lines) ending with `data: [DONE]`.
//!
//! A body that ends before the backend signals completion is reported as an
//! error item on the token stream, so a truncated answer is never mistaken
//! for a complete one.

use anyhow::{anyhow, bail, Context, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

pub use docmind_core::llm::{ChatModel, TokenStream};
use docmind_core::models::Message;

use crate::config::LlmConfig;

/// One parsed line of a streaming response body.
#[derive(Debug, PartialEq)]
enum StreamLine {
    Token(String),
    /// Completion signal, possibly carrying a final fragment.
    Done(Option<String>),
    Skip,
}

/// Splits a byte stream into complete lines. Bytes are buffered until a
/// newline arrives, so multi-byte characters split across network chunks
/// decode correctly.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(
                String::from_utf8_lossy(&line)
                    .trim_end_matches(['\n', '\r'])
                    .to_string(),
            );
        }
        lines
    }

    fn finish(self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        (!rest.is_empty()).then_some(rest)
    }
}

/// Turn a streaming HTTP body into a [`TokenStream`] using `parse` per line.
///
/// A body that delivers nothing for `idle_timeout` ends the stream with an
/// error, so a stalled backend cannot hold a turn open.
fn token_stream<S, B, E>(
    body: S,
    service: &'static str,
    parse: fn(&str) -> Result<StreamLine>,
    idle_timeout: Duration,
) -> TokenStream
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let mut body = Box::pin(body);

    Box::pin(stream! {
        let mut buffer = LineBuffer::default();

        loop {
            let next = match tokio::time::timeout(idle_timeout, body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    yield Err(anyhow!(
                        "{} stream stalled: no data for {}s",
                        service,
                        idle_timeout.as_secs()
                    ));
                    return;
                }
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(anyhow!("{} stream interrupted: {}", service, e));
                    return;
                }
            };
            for line in buffer.push(chunk.as_ref()) {
                match parse(&line) {
                    Ok(StreamLine::Token(text)) => yield Ok(text),
                    Ok(StreamLine::Done(last)) => {
                        if let Some(text) = last {
                            yield Ok(text);
                        }
                        return;
                    }
                    Ok(StreamLine::Skip) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        if let Some(line) = buffer.finish() {
            match parse(&line) {
                Ok(StreamLine::Done(last)) => {
                    if let Some(text) = last {
                        yield Ok(text);
                    }
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        yield Err(anyhow!("{} stream ended before the answer was complete", service));
    })
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

async fn send_chat_request(
    request: reqwest::RequestBuilder,
    service: &str,
    url: &str,
) -> Result<reqwest::Response> {
    let response = request
        .send()
        .await
        .with_context(|| format!("{} connection error ({})", service, url))?;
    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        bail!("{} API error {}: {}", service, status, body_text);
    }
    Ok(response)
}

fn http_client(config: &LlmConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

// ============ Disabled ============

pub struct DisabledChat;

#[async_trait]
impl ChatModel for DisabledChat {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn stream_chat(&self, _messages: &[Message]) -> Result<TokenStream> {
        bail!("LLM provider is disabled (set [llm] provider in the config)")
    }
}

// ============ Ollama ============

pub struct OllamaChat {
    model: String,
    url: String,
    temperature: f32,
    max_tokens: u32,
    keep_alive: String,
    idle_timeout: Duration,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model: config.model.clone(),
            url: url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            keep_alive: config.keep_alive.clone(),
            idle_timeout: Duration::from_secs(config.timeout_secs),
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, messages: &[Message]) -> Result<TokenStream> {
        let url = format!("{}/api/chat", self.url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "keep_alive": self.keep_alive,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        let response = send_chat_request(self.client.post(&url).json(&body), "Ollama", &url).await?;
        Ok(token_stream(
            response.bytes_stream(),
            "Ollama",
            parse_ollama_line,
            self.idle_timeout,
        ))
    }
}

fn parse_ollama_line(line: &str) -> Result<StreamLine> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(StreamLine::Skip);
    }
    let json: serde_json::Value =
        serde_json::from_str(line).with_context(|| format!("Invalid Ollama stream line: {}", line))?;

    if let Some(error) = json.get("error").and_then(|e| e.as_str()) {
        bail!("Ollama error: {}", error);
    }
    let content = json
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("");

    if json.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
        return Ok(StreamLine::Done(non_empty(content)));
    }
    Ok(match non_empty(content) {
        Some(text) => StreamLine::Token(text),
        None => StreamLine::Skip,
    })
}

// ============ OpenAI-compatible ============

/// Chat completions against OpenAI or any server speaking its API.
///
/// `OPENAI_API_KEY` is sent as a bearer token when set.
pub struct OpenAIChat {
    model: String,
    url: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    idle_timeout: Duration,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() && config.url.is_none() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            model: config.model.clone(),
            url: url.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            idle_timeout: Duration::from_secs(config.timeout_secs),
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, messages: &[Message]) -> Result<TokenStream> {
        let url = format!("{}/v1/chat/completions", self.url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = send_chat_request(request, "OpenAI", &url).await?;
        Ok(token_stream(
            response.bytes_stream(),
            "OpenAI",
            parse_openai_line,
            self.idle_timeout,
        ))
    }
}

fn parse_openai_line(line: &str) -> Result<StreamLine> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(StreamLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamLine::Done(None));
    }
    let json: serde_json::Value =
        serde_json::from_str(data).with_context(|| format!("Invalid OpenAI stream event: {}", data))?;

    if let Some(error) = json.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        bail!("OpenAI error: {}", message);
    }

    let choice = json.get("choices").and_then(|c| c.get(0));
    let content = choice
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("");
    let finished = choice
        .and_then(|c| c.get("finish_reason"))
        .map(|r| !r.is_null())
        .unwrap_or(false);

    if finished {
        return Ok(StreamLine::Done(non_empty(content)));
    }
    Ok(match non_empty(content) {
        Some(text) => StreamLine::Token(text),
        None => StreamLine::Skip,
    })
}

/// Create the [`ChatModel`] named by `[llm] provider`.
pub fn create_chat_model(config: &LlmConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledChat)),
        "ollama" => Ok(Arc::new(OllamaChat::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
