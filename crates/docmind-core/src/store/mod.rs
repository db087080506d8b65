//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait defines the storage operations needed by
//! ingestion and retrieval. Entries are grouped into named collections;
//! every vector in a collection has the same dimensionality, fixed by the
//! first write.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::cmp::Ordering;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::embedding::cosine_similarity;
use crate::models::{IndexEntry, ScoredChunk};

/// Summary of a stored collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub dims: usize,
    pub model: String,
    pub chunks: usize,
}

/// Abstract vector index.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`replace_collection`](VectorIndex::replace_collection) | Atomically swap a collection's full contents |
/// | [`upsert`](VectorIndex::upsert) | Insert or update entries by chunk id |
/// | [`similarity_search`](VectorIndex::similarity_search) | Top-k cosine search |
/// | [`collection_info`](VectorIndex::collection_info) | Dimensions, model, and size |
/// | [`drop_collection`](VectorIndex::drop_collection) | Remove a collection |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Replace every entry of `collection` with `entries`.
    ///
    /// Either the whole new set becomes visible or the previous contents
    /// remain untouched. An empty `entries` slice leaves an empty collection.
    async fn replace_collection(
        &self,
        collection: &str,
        model: &str,
        entries: &[IndexEntry],
    ) -> Result<()>;

    /// Insert or update entries by chunk id.
    ///
    /// Fails if any vector's length differs from the collection's dimensions.
    async fn upsert(&self, collection: &str, model: &str, entries: &[IndexEntry]) -> Result<()>;

    /// Return up to `k` chunks ordered by descending cosine similarity.
    ///
    /// Fails if the collection does not exist or the query's length does not
    /// match its dimensions. Returns an empty list for an empty collection.
    async fn similarity_search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    async fn collection_info(&self, collection: &str) -> Result<Option<CollectionInfo>>;

    async fn drop_collection(&self, collection: &str) -> Result<()>;
}

/// Validate that all entries share one dimensionality, matching `expected`
/// when the collection already has one. Returns the batch dimensionality.
pub fn check_dims(expected: Option<usize>, entries: &[IndexEntry]) -> Result<Option<usize>> {
    let mut dims = expected;
    for entry in entries {
        let len = entry.embedding.len();
        if len == 0 {
            bail!("chunk {} has an empty embedding", entry.chunk.id);
        }
        match dims {
            Some(d) if d != len => bail!(
                "dimension mismatch: chunk {} has {} dims, collection expects {}",
                entry.chunk.id,
                len,
                d
            ),
            Some(_) => {}
            None => dims = Some(len),
        }
    }
    Ok(dims)
}

/// Score `candidates` against `query` and keep the best `k`.
///
/// Ties keep insertion order, so results are deterministic for equal scores.
pub fn rank_by_similarity<'a, I>(query: &[f32], candidates: I, k: usize) -> Vec<ScoredChunk>
where
    I: IntoIterator<Item = &'a IndexEntry>,
{
    let mut scored: Vec<ScoredChunk> = candidates
        .into_iter()
        .map(|entry| ScoredChunk {
            chunk: entry.chunk.clone(),
            score: cosine_similarity(query, &entry.embedding) as f64,
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    scored.truncate(k);
    scored
}
