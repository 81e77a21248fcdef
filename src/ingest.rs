//! `kb ingest`: load a text or markdown file as a `document_file` source.
//!
//! The source uri is `file://<canonical path>`, so ingesting the same file
//! again replaces its previous chunks instead of duplicating them.
//! Embedding is left to `kb embed pending`.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;

use chat_kb_core::ingest::ingest_document;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

pub async fn run_ingest(config: &Config, path: &Path, title: Option<String>) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let canonical = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    let uri = format!("file://{}", canonical.display());
    let title = title.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| uri.clone())
    });
    let metadata = json!({
        "path": canonical.display().to_string(),
        "bytes": text.len(),
    });

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let report = ingest_document(&store, &config.pipeline(), &uri, &title, &text, metadata).await?;

    println!("ingest {}", path.display());
    println!("  source: {} ({})", report.source_id, title);
    println!("  chunks written: {}", report.chunks);
    if report.replaced {
        println!("  replaced previous version");
    }
    println!("ok");
    Ok(())
}
