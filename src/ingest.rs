//! Full-replace ingestion.
//!
//! ```text
//! uploads ──▶ staging dir ──▶ load pages ──▶ join "\n" ──▶ Chunker
//!                                                             │
//!        VectorIndex::replace_collection ◀── embed in batches ◀┘
//! ```
//!
//! Every run replaces the configured collection. Nothing is written to the
//! index until every document has been loaded, chunked, and embedded, and
//! the write itself is one transaction, so a failed run leaves the previous
//! collection as it was.

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use docmind_core::chunk::Chunker;
use docmind_core::embedding::EmbeddingProvider;
use docmind_core::error::RagError;
use docmind_core::models::IndexEntry;
use docmind_core::retrieve::Retriever;
use docmind_core::store::VectorIndex;

use crate::config::Config;
use crate::db;
use crate::embedding::{create_provider, embed_batched};
use crate::loader::load_pages;
use crate::sqlite_store::SqliteStore;
use crate::staging::{expand_paths, read_uploads, stage_files};

/// The freshly built collection and the index it lives in.
pub struct IndexHandle {
    pub collection: String,
    pub model: String,
    pub documents: usize,
    pub chunks: usize,
    pub dims: usize,
    pub index: Arc<dyn VectorIndex>,
}

impl IndexHandle {
    /// A retriever over this collection with no extra stages.
    pub fn retriever(&self, embedder: Arc<dyn EmbeddingProvider>, k: usize) -> Retriever {
        Retriever::new(self.index.clone(), embedder, self.collection.clone(), k)
    }
}

/// Stage `uploads`, rebuild the collection from them, and return a handle.
pub async fn ingest(
    config: &Config,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    uploads: &[(String, Vec<u8>)],
) -> Result<IndexHandle, RagError> {
    build_collection(config, index, embedder, uploads)
        .await
        .map_err(RagError::Ingestion)
}

async fn build_collection(
    config: &Config,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    uploads: &[(String, Vec<u8>)],
) -> Result<IndexHandle> {
    if uploads.is_empty() {
        bail!("no documents to ingest");
    }
    let collection = config.storage.collection.clone();
    let staged = stage_files(&config.storage.staging_dir, uploads, true)?;
    let chunker = Chunker::new(
        config
            .chunking
            .to_chunker_config(config.embedding.batch_size),
        embedder.clone(),
    );

    let mut chunks = Vec::new();
    for (path, (upload_name, _)) in staged.iter().zip(uploads) {
        let text = load_document(path).await?;
        let metadata = source_metadata(path, upload_name)?;

        let doc_chunks = chunker
            .split(&text, &metadata)
            .await
            .with_context(|| format!("Failed to chunk {}", path.display()))?;
        tracing::debug!(file = %path.display(), chunks = doc_chunks.len(), "document chunked");

        for mut chunk in doc_chunks {
            // Collection-wide position; the per-document index stays in metadata.
            chunk.chunk_index = chunks.len() as i64;
            chunks.push(chunk);
        }
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embed_batched(embedder.as_ref(), &texts, config.embedding.batch_size)
        .await
        .context("Failed to embed chunks")?;

    let entries: Vec<IndexEntry> = chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, embedding)| IndexEntry { chunk, embedding })
        .collect();

    index
        .replace_collection(&collection, embedder.model_name(), &entries)
        .await
        .with_context(|| format!("Failed to write collection '{}'", collection))?;

    tracing::info!(
        collection = %collection,
        documents = staged.len(),
        chunks = entries.len(),
        "collection replaced"
    );

    Ok(IndexHandle {
        collection,
        model: embedder.model_name().to_string(),
        documents: staged.len(),
        chunks: entries.len(),
        dims: embedder.dims(),
        index,
    })
}

/// Load a staged file and join its pages with newlines.
async fn load_document(path: &Path) -> Result<String> {
    let owned = path.to_path_buf();
    let pages = tokio::task::spawn_blocking(move || load_pages(&owned))
        .await?
        .with_context(|| format!("Failed to load {}", path.display()))?;
    Ok(pages.join("\n"))
}

/// `source` is the staged file name, unique within one run; `upload_name`
/// keeps the name the document arrived with.
fn source_metadata(path: &Path, upload_name: &str) -> Result<Map<String, Value>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read staged file: {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);

    let mut metadata = Map::new();
    let source = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    metadata.insert("source".to_string(), Value::from(source));
    metadata.insert("upload_name".to_string(), Value::from(upload_name));
    metadata.insert(
        "sha256".to_string(),
        Value::from(format!("{:x}", hasher.finalize())),
    );
    Ok(metadata)
}

/// CLI entry point for `docmind ingest <paths…>`.
pub async fn run_ingest(config: &Config, paths: &[PathBuf]) -> Result<()> {
    let files = expand_paths(paths, &config.ingest.include_globs)?;
    if files.is_empty() {
        bail!("No ingestible files found under the given paths");
    }
    let uploads = read_uploads(&files)?;

    let pool = db::connect(config).await?;
    let index: Arc<dyn VectorIndex> = Arc::new(SqliteStore::new(pool.clone()));
    let embedder = create_provider(&config.embedding)?;

    let handle = ingest(config, index, embedder, &uploads).await?;
    pool.close().await;

    println!("ingest {}", handle.collection);
    println!("  documents: {}", handle.documents);
    println!("  chunks written: {}", handle.chunks);
    println!("  model: {} ({} dims)", handle.model, handle.dims);
    println!("ok");
    Ok(())
}
