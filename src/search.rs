//! `kb search`: embed a query and print the top-k matching chunks.

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use chat_kb_core::embedding::embed_query;
use chat_kb_core::models::{ChunkLocation, SimilarityResult};
use chat_kb_core::search::{similarity_search, SearchFilters};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::sqlite_store::SqliteStore;

pub async fn run_search(
    config: &Config,
    query: &str,
    top_k: usize,
    source_type: Option<String>,
    filters: &[String],
) -> Result<()> {
    if query.trim().is_empty() {
        bail!("Search query must not be empty");
    }
    if !config.embedding.is_enabled() {
        bail!("Search needs an embedding provider. Set [embedding] provider in config.");
    }

    let filters = build_filters(source_type, filters)?;
    let provider = embedding::create_provider(&config.embedding)?;
    let query_vec = embed_query(provider.as_ref(), query)
        .await
        .context("Failed to embed query")?;

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let results = similarity_search(&store, &config.pipeline(), &query_vec, top_k, &filters).await?;

    if results.is_empty() {
        println!("No results.");
    } else {
        for (i, result) in results.iter().enumerate() {
            print_result(i + 1, result);
        }
    }

    pool.close().await;
    Ok(())
}

/// Turn `--source-type` and repeated `--filter key=value` flags into
/// [`SearchFilters`].
///
/// Values that parse as JSON scalars (`111111`, `true`) are used as such;
/// anything else is a string.
pub fn build_filters(source_type: Option<String>, pairs: &[String]) -> Result<SearchFilters> {
    let mut obj = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("Invalid filter '{}': expected key=value", pair))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid filter '{}': empty key", pair);
        }
        let value = match serde_json::from_str::<Value>(raw) {
            Ok(v) if !v.is_object() && !v.is_array() => v,
            _ => Value::String(raw.to_string()),
        };
        obj.insert(key.to_string(), value);
    }
    if let Some(source_type) = source_type {
        obj.insert("source_type".into(), Value::String(source_type));
    }
    Ok(SearchFilters::from_json(&Value::Object(obj))?)
}

fn print_result(rank: usize, result: &SimilarityResult) {
    println!(
        "{}. [{:.4}] {} / {}",
        rank, result.similarity, result.source_type, result.source_title
    );
    match &result.location {
        ChunkLocation::Messages {
            first_message,
            last_message,
            started_at,
            ..
        } => println!(
            "    messages: {}-{} ({})",
            first_message,
            last_message,
            started_at.format("%Y-%m-%d")
        ),
        ChunkLocation::Document { url, label } => println!("    location: {} ({})", label, url),
    }
    println!(
        "    excerpt: \"{}\"",
        excerpt(&result.content, 240).replace('\n', " ").trim()
    );
    println!("    chunk: {}  source: {}", result.chunk_id, result.source_id);
    println!();
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_kb_core::models::SourceType;
    use serde_json::json;

    #[test]
    fn test_build_filters() {
        let filters = build_filters(
            Some("discord_session".into()),
            &["channel_id=111111".into(), "session_type=thread".into()],
        )
        .unwrap();
        assert_eq!(filters.source_type, Some(SourceType::DiscordSession));
        assert_eq!(filters.metadata.get("channel_id"), Some(&json!(111111)));
        assert_eq!(filters.metadata.get("session_type"), Some(&json!("thread")));
    }

    #[test]
    fn test_build_filters_rejects_garbage() {
        assert!(build_filters(None, &["no-equals".into()]).is_err());
        assert!(build_filters(None, &["=1".into()]).is_err());
        assert!(build_filters(Some("tweets".into()), &[]).is_err());
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo", 2), "hé...");
        assert_eq!(excerpt("short", 240), "short");
    }
}
