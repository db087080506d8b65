//! TOML configuration.
//!
//! Every section except `[db]` is optional; missing keys take the defaults
//! below. [`load_config`] parses and validates the file so later stages can
//! trust the values.
//!
//! ```toml
//! [db]
//! path = "./data/docmind.sqlite"
//!
//! [embedding]
//! provider = "local"
//! model = "bge-base-en-v1.5"
//!
//! [llm]
//! provider = "ollama"
//! model = "gemma2:9b"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use docmind_core::chunk::ChunkerConfig;
use docmind_core::pipeline::PipelineOptions;
use docmind_core::prompt::SYSTEM_TEMPLATE;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Fixed collection name; every ingest replaces it.
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            collection: default_collection(),
        }
    }
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("./data/staging")
}
fn default_collection() -> String {
    "documents".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_iqr_multiplier")]
    pub breakpoint_iqr_multiplier: f64,
    #[serde(default = "default_true")]
    pub semantic: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            breakpoint_iqr_multiplier: default_iqr_multiplier(),
            semantic: true,
        }
    }
}

impl ChunkingConfig {
    /// Chunker settings; `embed_batch_size` comes from `[embedding] batch_size`.
    pub fn to_chunker_config(&self, embed_batch_size: usize) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            breakpoint_iqr_multiplier: self.breakpoint_iqr_multiplier,
            semantic: self.semantic,
            embed_batch_size,
        }
    }
}

fn default_chunk_size() -> usize {
    2048
}
fn default_chunk_overlap() -> usize {
    100
}
fn default_iqr_multiplier() -> f64 {
    1.5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama or OpenAI-compatible endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// How long Ollama keeps the model loaded after a request.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_llm_model(),
            url: None,
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            keep_alive: default_keep_alive(),
        }
    }
}

fn default_llm_model() -> String {
    "gemma2:9b".to_string()
}
fn default_max_tokens() -> u32 {
    7000
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_keep_alive() -> String {
    "1h".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_true")]
    pub use_reranker: bool,
    #[serde(default = "default_reranker_model")]
    pub reranker_model: String,
    #[serde(default)]
    pub rerank_top_n: Option<usize>,
    #[serde(default)]
    pub use_relevance_filter: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            use_reranker: true,
            reranker_model: default_reranker_model(),
            rerank_top_n: None,
            use_relevance_filter: false,
        }
    }
}

fn default_k() -> usize {
    5
}
fn default_reranker_model() -> String {
    "bge-reranker-base".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    /// Message count at which the length warning is shown; 0 disables it.
    #[serde(default = "default_cap")]
    pub cap: usize,
    /// Most recent messages included in the prompt; 0 includes all.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Overrides the built-in system instruction. Must contain `{context}`.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            cap: default_cap(),
            history_window: default_history_window(),
            system_prompt: None,
        }
    }
}

fn default_cap() -> usize {
    6
}
fn default_history_window() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8642".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Globs applied when a directory is passed to `ingest`.
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.docx".to_string(),
    ]
}

impl Config {
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            system_template: self
                .conversation
                .system_prompt
                .clone()
                .unwrap_or_else(|| SYSTEM_TEMPLATE.to_string()),
            history_window: self.conversation.history_window,
            conversation_cap: self.conversation.cap,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.storage.collection.trim().is_empty() {
        bail!("storage.collection must not be empty");
    }

    // Chunking
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }
    if !config.chunking.breakpoint_iqr_multiplier.is_finite()
        || config.chunking.breakpoint_iqr_multiplier < 0.0
    {
        bail!("chunking.breakpoint_iqr_multiplier must be a non-negative number");
    }

    // Retrieval
    if config.retrieval.k < 1 {
        bail!("retrieval.k must be >= 1");
    }
    if config.retrieval.rerank_top_n == Some(0) {
        bail!("retrieval.rerank_top_n must be >= 1 when set");
    }

    // Embedding
    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" | "local" => {}
        "hash" | "openai" | "ollama" => {
            if embedding.dims.unwrap_or(0) == 0 {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
            other
        ),
    }
    if matches!(embedding.provider.as_str(), "openai" | "ollama") && embedding.model.is_none() {
        bail!(
            "embedding.model must be specified when provider is '{}'",
            embedding.provider
        );
    }
    if embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // LLM
    match config.llm.provider.as_str() {
        "disabled" | "ollama" | "openai" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled, ollama, or openai.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        bail!("llm.temperature must be in [0.0, 2.0]");
    }

    if let Some(prompt) = &config.conversation.system_prompt {
        if !prompt.contains("{context}") {
            bail!("conversation.system_prompt must contain a {{context}} placeholder");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/docmind.sqlite\"\n").unwrap();
        assert_eq!(config.storage.collection, "documents");
        assert_eq!(config.chunking.chunk_size, 2048);
        assert_eq!(config.chunking.chunk_overlap, 100);
        assert_eq!(config.retrieval.k, 5);
        assert!(config.retrieval.use_reranker);
        assert!(!config.retrieval.use_relevance_filter);
        assert_eq!(config.llm.model, "gemma2:9b");
        assert_eq!(config.llm.max_tokens, 7000);
        assert_eq!(config.llm.keep_alive, "1h");
        assert_eq!(config.conversation.cap, 6);
        assert_eq!(config.server.bind, "127.0.0.1:8642");
        assert!(!config.logging.debug);
        assert_eq!(config.ingest.include_globs.len(), 4);

        let options = config.pipeline_options();
        assert_eq!(options.conversation_cap, 6);
        assert!(options.system_template.contains("{context}"));
    }

    #[test]
    fn test_rejects_invalid_chunking() {
        let err = parse("[db]\npath = \"x\"\n[chunking]\nchunk_size = 100\nchunk_overlap = 100\n")
            .unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_enabled_embedding_requires_dims() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));

        let config = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\ndims = 64\n")
            .unwrap();
        assert!(config.embedding.is_enabled());
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"local\"\n").is_ok());
    }

    #[test]
    fn test_rejects_unknown_providers() {
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[llm]\nprovider = \"magic\"\n").is_err());
    }

    #[test]
    fn test_system_prompt_needs_placeholder() {
        let err = parse("[db]\npath = \"x\"\n[conversation]\nsystem_prompt = \"be brief\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("{context}"));
    }
}
