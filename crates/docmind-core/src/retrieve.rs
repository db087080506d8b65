//! Retrieval: similarity search followed by an ordered list of stages.
//!
//! A [`Retriever`] embeds the question, takes the top-`k` chunks from the
//! [`VectorIndex`], then passes them through each [`RetrievalStage`] in
//! order. The output order of the last stage is the order in which chunks
//! reach the prompt.
//!
//! | Stage | Behavior on failure |
//! |-------|---------------------|
//! | [`IdentityStage`] | never fails |
//! | [`RerankStage`] | logs, keeps incoming order |
//! | [`RelevanceFilterStage`] | fails retrieval |

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::RagError;
use crate::llm::ChatModel;
use crate::models::{Chunk, ScoredChunk};
use crate::prompt::relevance_prompt;
use crate::store::VectorIndex;

/// Cross-encoder style relevance scorer.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn model_name(&self) -> &str;

    /// Score each document against `query`; one score per document, same order.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

/// One transform over the retrieved candidates.
#[async_trait]
pub trait RetrievalStage: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(
        &self,
        question: &str,
        chunks: Vec<ScoredChunk>,
    ) -> Result<Vec<ScoredChunk>, RagError>;
}

/// Pass-through stage, used when no other stage is configured.
pub struct IdentityStage;

#[async_trait]
impl RetrievalStage for IdentityStage {
    fn name(&self) -> &str {
        "identity"
    }

    async fn apply(
        &self,
        _question: &str,
        chunks: Vec<ScoredChunk>,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        Ok(chunks)
    }
}

/// Reorders candidates by reranker score, optionally keeping only the top `n`.
///
/// A reranker failure is logged as [`RagError::RerankUnavailable`] and the
/// candidates are returned unchanged.
pub struct RerankStage {
    reranker: Arc<dyn Reranker>,
    top_n: Option<usize>,
}

impl RerankStage {
    pub fn new(reranker: Arc<dyn Reranker>, top_n: Option<usize>) -> Self {
        Self { reranker, top_n }
    }

    async fn rerank(&self, question: &str, chunks: &[ScoredChunk]) -> Result<Vec<ScoredChunk>> {
        let documents: Vec<String> = chunks.iter().map(|c| c.chunk.text.clone()).collect();
        let scores = self.reranker.score(question, &documents).await?;
        if scores.len() != chunks.len() {
            bail!(
                "reranker returned {} scores for {} documents",
                scores.len(),
                chunks.len()
            );
        }

        let mut reranked: Vec<ScoredChunk> = chunks
            .iter()
            .zip(scores)
            .map(|(c, score)| ScoredChunk {
                chunk: c.chunk.clone(),
                score: score as f64,
            })
            .collect();
        reranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        if let Some(n) = self.top_n {
            reranked.truncate(n);
        }
        Ok(reranked)
    }
}

#[async_trait]
impl RetrievalStage for RerankStage {
    fn name(&self) -> &str {
        "rerank"
    }

    async fn apply(
        &self,
        question: &str,
        chunks: Vec<ScoredChunk>,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        if chunks.is_empty() {
            return Ok(chunks);
        }
        match self.rerank(question, &chunks).await {
            Ok(reranked) => Ok(reranked),
            Err(e) => {
                let err = RagError::RerankUnavailable(e);
                tracing::warn!(
                    model = self.reranker.model_name(),
                    "{err}; keeping similarity order"
                );
                Ok(chunks)
            }
        }
    }
}

/// Drops candidates a chat model judges irrelevant to the question.
pub struct RelevanceFilterStage {
    model: Arc<dyn ChatModel>,
}

impl RelevanceFilterStage {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl RetrievalStage for RelevanceFilterStage {
    fn name(&self) -> &str {
        "relevance_filter"
    }

    async fn apply(
        &self,
        question: &str,
        chunks: Vec<ScoredChunk>,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        let mut kept = Vec::with_capacity(chunks.len());
        for candidate in chunks {
            let verdict = self
                .model
                .complete(&relevance_prompt(question, &candidate.chunk.text))
                .await
                .map_err(RagError::RetrievalUnavailable)?;
            if verdict.trim().to_uppercase().starts_with("YES") {
                kept.push(candidate);
            }
        }
        Ok(kept)
    }
}

/// Similarity search plus configured stages over one collection.
pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
    k: usize,
    stages: Vec<Box<dyn RetrievalStage>>,
}

impl Retriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        collection: impl Into<String>,
        k: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            collection: collection.into(),
            k,
            stages: Vec::new(),
        }
    }

    /// Append a stage; stages run in the order they are added.
    pub fn with_stage(mut self, stage: Box<dyn RetrievalStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Retrieve chunks for `question`, most relevant first.
    pub async fn retrieve(&self, question: &str) -> Result<Vec<Chunk>, RagError> {
        Ok(self
            .retrieve_scored(question)
            .await?
            .into_iter()
            .map(|s| s.chunk)
            .collect())
    }

    pub async fn retrieve_scored(&self, question: &str) -> Result<Vec<ScoredChunk>, RagError> {
        let query = self
            .embedder
            .embed_query(question)
            .await
            .map_err(RagError::RetrievalUnavailable)?;
        let mut chunks = self
            .index
            .similarity_search(&self.collection, &query, self.k)
            .await
            .map_err(RagError::RetrievalUnavailable)?;
        tracing::debug!(
            collection = %self.collection,
            k = self.k,
            hits = chunks.len(),
            "similarity search"
        );

        for stage in &self.stages {
            chunks = stage.apply(question, chunks).await?;
            tracing::debug!(stage = stage.name(), remaining = chunks.len(), "retrieval stage");
        }
        Ok(chunks)
    }
}
