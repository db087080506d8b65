//! Cross-encoder reranking via fastembed.
//!
//! [`LocalReranker::try_new`] loads the model once (downloading it into the
//! fastembed cache on first use). Initialisation failure is reported to the
//! caller, which drops the rerank stage and keeps similarity order.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;

use docmind_core::retrieve::Reranker;

/// Known cross-encoder names accepted in `[retrieval] reranker_model`.
pub const SUPPORTED_RERANKERS: &[&str] = &[
    "bge-reranker-base",
    "bge-reranker-v2-m3",
    "jina-reranker-v1-turbo-en",
    "jina-reranker-v2-base-multilingual",
];

#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalReranker {
    name: String,
    model: Arc<std::sync::Mutex<fastembed::TextRerank>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalReranker {
    pub async fn try_new(model_name: &str) -> Result<Self> {
        let name = normalize_name(model_name);
        let model = to_fastembed_model(&name)?;

        let reranker = tokio::task::spawn_blocking(move || {
            fastembed::TextRerank::try_new(
                fastembed::RerankInitOptions::new(model).with_show_download_progress(false),
            )
            .map_err(|e| anyhow!("Failed to initialize reranker: {}", e))
        })
        .await??;

        tracing::debug!(model = %name, "reranker loaded");
        Ok(Self {
            name,
            model: Arc::new(std::sync::Mutex::new(reranker)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Reranker for LocalReranker {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model.clone();
        let query = query.to_string();
        let documents = documents.to_vec();

        tokio::task::spawn_blocking(move || -> Result<Vec<f32>> {
            let mut guard = model
                .lock()
                .map_err(|_| anyhow!("reranker lock poisoned"))?;
            let docs: Vec<&str> = documents.iter().map(String::as_str).collect();
            let results = guard
                .rerank(query.as_str(), docs, false, None)
                .map_err(|e| anyhow!("Rerank failed: {}", e))?;

            // Results come back sorted by score; restore input order.
            let mut scores = vec![f32::NAN; documents.len()];
            for result in results {
                if let Some(slot) = scores.get_mut(result.index) {
                    *slot = result.score;
                }
            }
            if scores.iter().any(|s| s.is_nan()) {
                return Err(anyhow!("reranker did not score every document"));
            }
            Ok(scores)
        })
        .await?
    }
}

/// Stand-in used when the crate is built without fastembed; always fails
/// to initialise, so retrieval runs without a rerank stage.
#[cfg(not(feature = "local-embeddings-fastembed"))]
pub struct LocalReranker;

#[cfg(not(feature = "local-embeddings-fastembed"))]
impl LocalReranker {
    pub async fn try_new(model_name: &str) -> Result<Self> {
        Err(anyhow!(
            "reranker '{}' requires --features local-embeddings-fastembed",
            model_name
        ))
    }
}

#[cfg(not(feature = "local-embeddings-fastembed"))]
#[async_trait]
impl Reranker for LocalReranker {
    fn model_name(&self) -> &str {
        "unavailable"
    }

    async fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>> {
        Err(anyhow!("reranking is not compiled in"))
    }
}

/// Load the configured reranker as a trait object.
pub async fn load_reranker(model_name: &str) -> Result<Arc<dyn Reranker>> {
    Ok(Arc::new(LocalReranker::try_new(model_name).await?))
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_start_matches("BAAI/")
        .trim_start_matches("jinaai/")
        .to_lowercase()
}

#[cfg(feature = "local-embeddings-fastembed")]
fn to_fastembed_model(name: &str) -> Result<fastembed::RerankerModel> {
    match name {
        "bge-reranker-base" => Ok(fastembed::RerankerModel::BGERerankerBase),
        "bge-reranker-v2-m3" => Ok(fastembed::RerankerModel::BGERerankerV2M3),
        "jina-reranker-v1-turbo-en" => Ok(fastembed::RerankerModel::JINARerankerV1TurboEn),
        "jina-reranker-v2-base-multilingual" => {
            Ok(fastembed::RerankerModel::JINARerankerV2BaseMultiligual)
        }
        other => Err(anyhow!(
            "Unknown reranker model: '{}'. Supported models: {}",
            other,
            SUPPORTED_RERANKERS.join(", ")
        )),
    }
}
