//! Index statistics.
//!
//! `docmind stats` reports what the configured collection holds: embedding
//! model, dimensionality, chunk count, per-source breakdown, and when the
//! collection was last rebuilt.

use anyhow::Result;
use sqlx::Row;

use docmind_core::store::VectorIndex;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let collection = &config.storage.collection;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("DocuMind — Index Stats");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Collection:  {}", collection);

    let Some(info) = store.collection_info(collection).await? else {
        println!();
        println!("  (not ingested yet — run `docmind ingest <paths>`)");
        println!();
        pool.close().await;
        return Ok(());
    };

    let built = match store.created_at(collection).await? {
        Some(ts) => format_ts_relative(ts),
        None => "unknown".to_string(),
    };
    println!("  Model:       {}", info.model);
    println!("  Dims:        {}", info.dims);
    println!("  Chunks:      {}", info.chunks);
    println!("  Built:       {}", built);

    let source_rows = sqlx::query(
        r#"
        SELECT json_extract(metadata_json, '$.source') AS source, COUNT(*) AS chunk_count
        FROM chunks
        WHERE collection = ?
        GROUP BY source
        ORDER BY chunk_count DESC, source ASC
        "#,
    )
    .bind(collection)
    .fetch_all(&pool)
    .await?;

    if !source_rows.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<40} {:>8}", "SOURCE", "CHUNKS");
        println!("  {}", "-".repeat(49));
        for row in &source_rows {
            let source: Option<String> = row.get("source");
            let chunk_count: i64 = row.get("chunk_count");
            println!(
                "  {:<40} {:>8}",
                source.as_deref().unwrap_or("(unknown)"),
                chunk_count
            );
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now ("3 hours ago"), falling back
/// to a date for anything older than a month.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        format_ts_iso(ts)
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        plural(delta / 60, "min")
    } else if delta < 86400 {
        plural(delta / 3600, "hour")
    } else if delta < 86400 * 30 {
        plural(delta / 86400, "day")
    } else {
        format_ts_iso(ts)
    }
}

fn plural(n: i64, unit: &str) -> String {
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
