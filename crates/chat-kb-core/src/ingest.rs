//! Document ingestion into the knowledge store.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::chunk::chunk_document;
use crate::config::PipelineConfig;
use crate::error::PipelineResult;
use crate::models::{NewSource, SourceStatus, SourceType};
use crate::store::KnowledgeStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub source_id: i64,
    pub chunks: usize,
    /// An older source with the same uri was deleted first.
    pub replaced: bool,
}

/// Store `text` as a `document_file` source with pending chunks.
///
/// Re-ingesting the same `uri` replaces the previous source and all of its
/// chunks. A document with no content is stored as an already-completed
/// source with zero chunks. Embedding happens on the next
/// [`process_pending_embeddings`](crate::processor::EmbeddingProcessor::process_pending_embeddings)
/// sweep.
pub async fn ingest_document(
    store: &dyn KnowledgeStore,
    config: &PipelineConfig,
    uri: &str,
    title: &str,
    text: &str,
    metadata: Value,
) -> PipelineResult<IngestReport> {
    config.validate()?;

    let mut replaced = false;
    if let Some(existing) = store.find_source_by_uri(SourceType::DocumentFile, uri).await? {
        store.delete_source(existing.id).await?;
        replaced = true;
    }

    let chunks = chunk_document(text, config.max_tokens, uri, title);
    let status = if chunks.is_empty() {
        SourceStatus::Completed
    } else {
        SourceStatus::Pending
    };
    let source_id = store
        .save_source_with_chunks(
            &NewSource {
                source_type: SourceType::DocumentFile,
                title: title.to_string(),
                uri: uri.to_string(),
                metadata,
                status,
            },
            &chunks,
        )
        .await?;

    debug!(source_id, uri, chunks = chunks.len(), replaced, "document ingested");

    Ok(IngestReport {
        source_id,
        chunks: chunks.len(),
        replaced,
    })
}
