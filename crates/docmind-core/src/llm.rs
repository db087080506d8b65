//! Chat model trait.
//!
//! A [`ChatModel`] turns a rendered prompt (a list of [`Message`]s) into a
//! stream of text fragments. Concrete backends (Ollama, OpenAI-compatible
//! servers) live in the `docmind` app crate.

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::models::Message;

/// Incremental text fragments produced by a streaming chat call.
///
/// An `Err` item means the generation failed; no further items follow.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Start a streaming completion. Errors before the first token (bad
    /// status, unreachable server) are returned directly.
    async fn stream_chat(&self, messages: &[Message]) -> Result<TokenStream>;

    /// Run a completion to the end and return the concatenated text.
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        let mut stream = self.stream_chat(messages).await?;
        let mut out = String::new();
        while let Some(fragment) = stream.next().await {
            out.push_str(&fragment?);
        }
        Ok(out)
    }
}
