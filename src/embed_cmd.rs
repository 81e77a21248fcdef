//! `kb embed pending`: run one embedding sweep over the database.

use anyhow::{bail, Result};

use chat_kb_core::processor::{EmbeddingProcessor, EmbeddingReport};
use chat_kb_core::store::KnowledgeStore;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::sqlite_store::SqliteStore;

pub async fn run_embed_pending(
    config: &Config,
    batch_size_override: Option<usize>,
    max_concurrent_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);

    if dry_run {
        let stats = store.stats().await?;
        let pending: i64 = stats
            .sources
            .iter()
            .map(|s| s.chunk_count - s.embedded_count)
            .sum();
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending);
        return Ok(());
    }

    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let mut pipeline = config.pipeline();
    if let Some(batch_size) = batch_size_override {
        pipeline.batch_size = batch_size;
    }
    if let Some(max_concurrent) = max_concurrent_override {
        pipeline.max_concurrent = max_concurrent;
    }

    let processor = EmbeddingProcessor::new(&store, provider.as_ref(), pipeline);
    let report = processor.process_pending_embeddings().await?;

    println!("embed pending");
    print_report(&report);
    println!("ok");
    Ok(())
}

/// Summary lines shared with `kb archive`.
pub fn print_report(report: &EmbeddingReport) {
    if report.pending_seen == 0 {
        println!("  all chunks up to date");
        return;
    }
    println!("  pending: {}", report.pending_seen);
    println!("  embedded: {}", report.embedded);
    println!("  failed: {}", report.failed);
    if report.skipped > 0 {
        println!("  already embedded: {}", report.skipped);
    }
    println!(
        "  batches: {} ({} failed)",
        report.batches, report.failed_batches
    );
    println!("  sources completed: {}", report.sources_completed);
}
