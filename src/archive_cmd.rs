//! `kb archive`: archive idle sessions, then embed their chunks.

use anyhow::Result;
use chrono::Utc;
use tracing::warn;

use chat_kb_core::archiver::SessionArchiver;
use chat_kb_core::processor::EmbeddingProcessor;

use crate::config::Config;
use crate::db;
use crate::embed_cmd::print_report;
use crate::embedding;
use crate::sqlite_store::SqliteStore;

pub async fn run_archive(config: &Config, dry_run: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let pipeline = config.pipeline();

    if dry_run {
        let archiver = SessionArchiver::new(&store, &store, pipeline);
        let due = archiver.due_sessions(Utc::now()).await?;
        println!("archive (dry-run)");
        println!(
            "  sessions idle for more than {}h: {}",
            config.archive.threshold_hours,
            due.len()
        );
        for session in &due {
            println!(
                "  {} ({} messages, last active {})",
                session.session_key,
                session.messages.len(),
                session.last_active_at.format("%Y-%m-%d %H:%M UTC")
            );
        }
        return Ok(());
    }

    // A broken provider setup must not block archiving; the chunks wait
    // for the next `kb embed pending`.
    let provider = if config.embedding.is_enabled() {
        match embedding::create_provider(&config.embedding) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(error = %e, "could not create embedding provider; chunks stay pending");
                None
            }
        }
    } else {
        None
    };

    let mut archiver = SessionArchiver::new(&store, &store, pipeline.clone());
    if let Some(provider) = &provider {
        archiver =
            archiver.with_processor(EmbeddingProcessor::new(&store, provider.as_ref(), pipeline));
    }

    let report = archiver.archive_inactive_sessions().await?;

    println!("archive");
    println!("  due: {}", report.due);
    println!("  archived: {}", report.archived);
    println!("  failed: {}", report.failed);
    println!("  chunks created: {}", report.chunks_created);
    if report.sources_replaced > 0 {
        println!("  sources replaced: {}", report.sources_replaced);
    }
    match (&report.embedding, &report.embedding_error) {
        (Some(embedding), _) => {
            println!("embed pending");
            print_report(embedding);
        }
        (None, Some(err)) => println!("  embedding failed: {}", err),
        (None, None) => println!("  embeddings: deferred (run `kb embed pending`)"),
    }
    println!("ok");
    Ok(())
}
