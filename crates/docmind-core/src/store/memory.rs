//! In-memory [`VectorIndex`] implementation for tests and embedded use.
//!
//! Collections live in a `HashMap` behind `std::sync::RwLock`. Search is
//! brute-force cosine similarity over every stored vector.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{IndexEntry, ScoredChunk};

use super::{check_dims, rank_by_similarity, CollectionInfo, VectorIndex};

struct MemCollection {
    dims: usize,
    model: String,
    entries: Vec<IndexEntry>,
}

/// In-memory vector index.
pub struct InMemoryIndex {
    collections: RwLock<HashMap<String, MemCollection>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory index lock poisoned")
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn replace_collection(
        &self,
        collection: &str,
        model: &str,
        entries: &[IndexEntry],
    ) -> Result<()> {
        let dims = check_dims(None, entries)?.unwrap_or(0);
        let mut collections = self.collections.write().map_err(poisoned)?;
        collections.insert(
            collection.to_string(),
            MemCollection {
                dims,
                model: model.to_string(),
                entries: entries.to_vec(),
            },
        );
        Ok(())
    }

    async fn upsert(&self, collection: &str, model: &str, entries: &[IndexEntry]) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        let existing = collections
            .get(collection)
            .filter(|c| c.dims > 0)
            .map(|c| c.dims);
        let dims = check_dims(existing, entries)?.unwrap_or(0);

        let target = collections
            .entry(collection.to_string())
            .or_insert_with(|| MemCollection {
                dims,
                model: model.to_string(),
                entries: Vec::new(),
            });
        if target.dims == 0 {
            target.dims = dims;
        }

        for entry in entries {
            match target
                .entries
                .iter_mut()
                .find(|e| e.chunk.id == entry.chunk.id)
            {
                Some(slot) => *slot = entry.clone(),
                None => target.entries.push(entry.clone()),
            }
        }
        Ok(())
    }

    async fn similarity_search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let Some(stored) = collections.get(collection) else {
            bail!("collection '{}' does not exist", collection);
        };
        if stored.entries.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != stored.dims {
            bail!(
                "query has {} dims, collection '{}' expects {}",
                query.len(),
                collection,
                stored.dims
            );
        }
        Ok(rank_by_similarity(query, &stored.entries, k))
    }

    async fn collection_info(&self, collection: &str) -> Result<Option<CollectionInfo>> {
        let collections = self.collections.read().map_err(poisoned)?;
        Ok(collections.get(collection).map(|c| CollectionInfo {
            name: collection.to_string(),
            dims: c.dims,
            model: c.model.clone(),
            chunks: c.entries.len(),
        }))
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        collections.remove(collection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn entry(id: &str, text: &str, embedding: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk: Chunk {
                id: id.to_string(),
                chunk_index: 0,
                start_offset: 0,
                text: text.to_string(),
                metadata: Default::default(),
            },
            embedding,
        }
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let index = InMemoryIndex::new();
        index
            .replace_collection(
                "docs",
                "m",
                &[
                    entry("a", "far", vec![0.0, 1.0]),
                    entry("b", "near", vec![1.0, 0.1]),
                    entry("c", "exact", vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let results = index.similarity_search("docs", &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.text, "exact");
        assert_eq!(results[1].chunk.text, "near");
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn test_replace_discards_previous_entries() {
        let index = InMemoryIndex::new();
        index
            .replace_collection("docs", "m", &[entry("a", "old", vec![1.0, 0.0])])
            .await
            .unwrap();
        index
            .replace_collection("docs", "m", &[entry("b", "new", vec![0.0, 1.0, 0.0])])
            .await
            .unwrap();

        let info = index.collection_info("docs").await.unwrap().unwrap();
        assert_eq!(info.chunks, 1);
        assert_eq!(info.dims, 3);
        let results = index
            .similarity_search("docs", &[1.0, 0.0, 0.0], 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.text, "new");
    }

    #[tokio::test]
    async fn test_upsert_rejects_dimension_mismatch() {
        let index = InMemoryIndex::new();
        index
            .upsert("docs", "m", &[entry("a", "x", vec![1.0, 0.0])])
            .await
            .unwrap();
        let err = index
            .upsert("docs", "m", &[entry("b", "y", vec![1.0, 0.0, 0.0])])
            .await;
        assert!(err.is_err());

        index
            .upsert("docs", "m", &[entry("a", "updated", vec![0.0, 1.0])])
            .await
            .unwrap();
        let info = index.collection_info("docs").await.unwrap().unwrap();
        assert_eq!(info.chunks, 1);
    }

    #[tokio::test]
    async fn test_search_edge_cases() {
        let index = InMemoryIndex::new();
        assert!(index.similarity_search("missing", &[1.0], 3).await.is_err());

        index.replace_collection("empty", "m", &[]).await.unwrap();
        assert!(index
            .similarity_search("empty", &[1.0, 0.0], 3)
            .await
            .unwrap()
            .is_empty());

        index
            .replace_collection("docs", "m", &[entry("a", "x", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert!(index.similarity_search("docs", &[1.0], 3).await.is_err());

        index.drop_collection("docs").await.unwrap();
        assert!(index.collection_info("docs").await.unwrap().is_none());
    }
}
