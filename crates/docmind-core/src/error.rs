//! Error taxonomy of the retrieval-augmented answering pipeline.
//!
//! | Variant | Raised by | Recovery |
//! |---------|-----------|----------|
//! | [`RagError::Ingestion`] | loading, chunking, embedding, or writing a collection | propagated to the ingest caller |
//! | [`RagError::RetrievalUnavailable`] | query embedding, index search, relevance filter | turn fails before any event |
//! | [`RagError::RerankUnavailable`] | reranker init or query | logged; similarity order kept |
//! | [`RagError::Generation`] | chat model before or during streaming | turn fails; history untouched |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("ingestion failed: {0:#}")]
    Ingestion(#[source] anyhow::Error),

    #[error("retrieval unavailable: {0:#}")]
    RetrievalUnavailable(#[source] anyhow::Error),

    #[error("reranker unavailable: {0:#}")]
    RerankUnavailable(#[source] anyhow::Error),

    #[error("generation failed: {0:#}")]
    Generation(#[source] anyhow::Error),
}

impl RagError {
    /// Short machine-readable code, used in HTTP error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::Ingestion(_) => "ingestion_error",
            RagError::RetrievalUnavailable(_) => "retrieval_unavailable",
            RagError::RerankUnavailable(_) => "rerank_unavailable",
            RagError::Generation(_) => "generation_error",
        }
    }
}

pub type RagResult<T> = Result<T, RagError>;
