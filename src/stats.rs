//! Database statistics: source, chunk and embedding counts, plus the session
//! backlog waiting to be archived. Used by `kb stats`.

use anyhow::Result;
use chrono::Utc;

use chat_kb_core::models::{SessionStatus, StoreStats};
use chat_kb_core::store::{KnowledgeStore, SessionStore};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let stats = store.stats().await?;
    let active = store.list_sessions(Some(SessionStatus::Active)).await?;
    let archived = store.list_sessions(Some(SessionStatus::Archived)).await?;
    let cutoff = Utc::now() - config.pipeline().archive_threshold();
    let due = active.iter().filter(|s| s.last_active_at < cutoff).count();

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    let (sources, chunks, embedded) = totals(&stats);

    println!("chat-kb database stats");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Sessions:    {} active ({} due for archive), {} archived", active.len(), due, archived.len());
    println!("  Sources:     {}", sources);
    println!("  Chunks:      {}", chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        embedded,
        chunks,
        if chunks > 0 { (embedded * 100) / chunks } else { 0 }
    );

    if !stats.sources.is_empty() {
        println!();
        println!("  By source type:");
        println!(
            "  {:<18} {:<10} {:>8} {:>8} {:>10}",
            "TYPE", "STATUS", "SOURCES", "CHUNKS", "EMBEDDED"
        );
        println!("  {}", "-".repeat(58));
        for s in &stats.sources {
            println!(
                "  {:<18} {:<10} {:>8} {:>8} {:>10}",
                s.source_type.as_str(),
                s.status.as_str(),
                s.source_count,
                s.chunk_count,
                s.embedded_count
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn totals(stats: &StoreStats) -> (i64, i64, i64) {
    stats.sources.iter().fold((0, 0, 0), |(s, c, e), row| {
        (s + row.source_count, c + row.chunk_count, e + row.embedded_count)
    })
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
