//! SQLite-backed [`VectorIndex`] implementation.
//!
//! Vectors are stored as little-endian `f32` BLOBs next to the chunk text.
//! Similarity search loads a collection's vectors and ranks them in Rust
//! with cosine similarity, the same metric used at ingestion time.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use docmind_core::embedding::{blob_to_vec, vec_to_blob};
use docmind_core::models::{Chunk, IndexEntry, ScoredChunk};
use docmind_core::store::{check_dims, rank_by_similarity, CollectionInfo, VectorIndex};

/// SQLite implementation of the [`VectorIndex`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Unix timestamp of the last full replacement of `collection`.
    pub async fn created_at(&self, collection: &str) -> Result<Option<i64>> {
        let ts: Option<i64> =
            sqlx::query_scalar("SELECT created_at FROM collections WHERE name = ?")
                .bind(collection)
                .fetch_optional(&self.pool)
                .await?;
        Ok(ts)
    }

    async fn collection_dims(&self, collection: &str) -> Result<Option<usize>> {
        let dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM collections WHERE name = ?")
            .bind(collection)
            .fetch_optional(&self.pool)
            .await?;
        Ok(dims.map(|d| d as usize))
    }
}

async fn insert_entries(
    tx: &mut Transaction<'_, Sqlite>,
    collection: &str,
    entries: &[IndexEntry],
) -> Result<()> {
    for entry in entries {
        let chunk = &entry.chunk;
        let metadata_json = serde_json::to_string(&chunk.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO chunks (id, collection, chunk_index, start_offset, text, metadata_json, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                collection = excluded.collection,
                chunk_index = excluded.chunk_index,
                start_offset = excluded.start_offset,
                text = excluded.text,
                metadata_json = excluded.metadata_json,
                embedding = excluded.embedding
            "#,
        )
        .bind(&chunk.id)
        .bind(collection)
        .bind(chunk.chunk_index)
        .bind(chunk.start_offset as i64)
        .bind(&chunk.text)
        .bind(&metadata_json)
        .bind(vec_to_blob(&entry.embedding))
        .execute(&mut **tx)
        .await
        .with_context(|| format!("Failed to write chunk {}", chunk.id))?;
    }
    Ok(())
}

fn row_to_entry(row: &SqliteRow) -> Result<IndexEntry> {
    let id: String = row.get("id");
    let metadata_json: String = row.get("metadata_json");
    let metadata = serde_json::from_str(&metadata_json)
        .with_context(|| format!("Invalid metadata_json for chunk {}", id))?;
    let start_offset: i64 = row.get("start_offset");
    let blob: Vec<u8> = row.get("embedding");

    Ok(IndexEntry {
        chunk: Chunk {
            id,
            chunk_index: row.get("chunk_index"),
            start_offset: start_offset.max(0) as usize,
            text: row.get("text"),
            metadata,
        },
        embedding: blob_to_vec(&blob),
    })
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn replace_collection(
        &self,
        collection: &str,
        model: &str,
        entries: &[IndexEntry],
    ) -> Result<()> {
        let dims = check_dims(None, entries)?.unwrap_or(0);
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO collections (name, dims, model, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                dims = excluded.dims,
                model = excluded.model,
                created_at = excluded.created_at
            "#,
        )
        .bind(collection)
        .bind(dims as i64)
        .bind(model)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        insert_entries(&mut tx, collection, entries).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, model: &str, entries: &[IndexEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT dims FROM collections WHERE name = ?")
                .bind(collection)
                .fetch_optional(&mut *tx)
                .await?;
        let expected = existing.filter(|d| *d > 0).map(|d| d as usize);
        let dims = check_dims(expected, entries)?.unwrap_or(0);

        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO collections (name, dims, model, created_at) VALUES (?, ?, ?, ?)",
                )
                .bind(collection)
                .bind(dims as i64)
                .bind(model)
                .bind(chrono::Utc::now().timestamp())
                .execute(&mut *tx)
                .await?;
            }
            Some(0) if dims > 0 => {
                sqlx::query("UPDATE collections SET dims = ?, model = ? WHERE name = ?")
                    .bind(dims as i64)
                    .bind(model)
                    .bind(collection)
                    .execute(&mut *tx)
                    .await?;
            }
            Some(_) => {}
        }

        insert_entries(&mut tx, collection, entries).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn similarity_search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let Some(dims) = self.collection_dims(collection).await? else {
            bail!(
                "collection '{}' does not exist (run `docmind ingest` first)",
                collection
            );
        };

        let rows = sqlx::query(
            r#"
            SELECT id, chunk_index, start_offset, text, metadata_json, embedding
            FROM chunks
            WHERE collection = ?
            ORDER BY chunk_index ASC, id ASC
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != dims {
            bail!(
                "query has {} dims, collection '{}' expects {}",
                query.len(),
                collection,
                dims
            );
        }

        let entries = rows.iter().map(row_to_entry).collect::<Result<Vec<_>>>()?;
        Ok(rank_by_similarity(query, &entries, k))
    }

    async fn collection_info(&self, collection: &str) -> Result<Option<CollectionInfo>> {
        let row = sqlx::query(
            r#"
            SELECT c.name, c.dims, c.model,
                   (SELECT COUNT(*) FROM chunks WHERE collection = c.name) AS chunk_count
            FROM collections c
            WHERE c.name = ?
            "#,
        )
        .bind(collection)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let dims: i64 = r.get("dims");
            let chunks: i64 = r.get("chunk_count");
            CollectionInfo {
                name: r.get("name"),
                dims: dims as usize,
                model: r.get("model"),
                chunks: chunks as usize,
            }
        }))
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply_schema(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn entry(id: &str, index: i64, text: &str, embedding: Vec<f32>) -> IndexEntry {
        let mut metadata = serde_json::Map::new();
        metadata.insert("source".to_string(), serde_json::Value::from("a.txt"));
        IndexEntry {
            chunk: Chunk {
                id: id.to_string(),
                chunk_index: index,
                start_offset: index as usize * 10,
                text: text.to_string(),
                metadata,
            },
            embedding,
        }
    }

    #[tokio::test]
    async fn test_search_reports_corrupt_metadata() {
        let store = memory_store().await;
        store
            .replace_collection("documents", "m", &[entry("a", 0, "north", vec![0.0, 1.0])])
            .await
            .unwrap();
        sqlx::query("UPDATE chunks SET metadata_json = '{not json' WHERE id = 'a'")
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store
            .similarity_search("documents", &[0.0, 1.0], 1)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid metadata_json for chunk a"));
    }

    #[tokio::test]
    async fn test_replace_and_search() {
        let store = memory_store().await;
        store
            .replace_collection(
                "documents",
                "m",
                &[
                    entry("a", 0, "north", vec![0.0, 1.0]),
                    entry("b", 1, "east", vec![1.0, 0.0]),
                    entry("c", 2, "north-east", vec![1.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let results = store
            .similarity_search("documents", &[1.0, 0.0], 2)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.text, "east");
        assert_eq!(results[1].chunk.text, "north-east");
        assert_eq!(results[0].chunk.start_offset, 10);
        assert_eq!(results[0].chunk.source(), Some("a.txt"));

        let info = store.collection_info("documents").await.unwrap().unwrap();
        assert_eq!(info.dims, 2);
        assert_eq!(info.chunks, 3);
        assert!(store.created_at("documents").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replace_is_not_merge() {
        let store = memory_store().await;
        store
            .replace_collection("documents", "m", &[entry("a", 0, "old", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .replace_collection(
                "documents",
                "m2",
                &[entry("b", 0, "new", vec![1.0, 0.0, 0.0])],
            )
            .await
            .unwrap();

        let results = store
            .similarity_search("documents", &[1.0, 0.0, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.text, "new");
        let info = store.collection_info("documents").await.unwrap().unwrap();
        assert_eq!(info.model, "m2");
        assert_eq!(info.dims, 3);
    }

    #[tokio::test]
    async fn test_failed_replace_keeps_previous_contents() {
        let store = memory_store().await;
        store
            .replace_collection("documents", "m", &[entry("a", 0, "old", vec![1.0, 0.0])])
            .await
            .unwrap();

        let mixed = vec![
            entry("y", 0, "one", vec![1.0, 0.0]),
            entry("z", 1, "two", vec![1.0]),
        ];
        assert!(store.replace_collection("documents", "m", &mixed).await.is_err());

        let info = store.collection_info("documents").await.unwrap().unwrap();
        assert_eq!(info.chunks, 1);
        let results = store
            .similarity_search("documents", &[1.0, 0.0], 5)
            .await
            .unwrap();
        assert_eq!(results[0].chunk.text, "old");
    }

    #[tokio::test]
    async fn test_upsert_dimension_check() {
        let store = memory_store().await;
        store
            .upsert("documents", "m", &[entry("a", 0, "x", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert!(store
            .upsert("documents", "m", &[entry("b", 1, "y", vec![1.0])])
            .await
            .is_err());
        store
            .upsert("documents", "m", &[entry("a", 0, "x2", vec![0.0, 1.0])])
            .await
            .unwrap();
        let info = store.collection_info("documents").await.unwrap().unwrap();
        assert_eq!(info.chunks, 1);
    }

    #[tokio::test]
    async fn test_search_errors() {
        let store = memory_store().await;
        assert!(store.similarity_search("missing", &[1.0], 1).await.is_err());

        store
            .replace_collection("documents", "m", &[entry("a", 0, "x", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert!(store
            .similarity_search("documents", &[1.0, 0.0, 0.0], 1)
            .await
            .is_err());

        store.drop_collection("documents").await.unwrap();
        assert!(store.collection_info("documents").await.unwrap().is_none());
    }
}
