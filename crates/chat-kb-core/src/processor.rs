//! Pending-embedding sweep.
//!
//! [`EmbeddingProcessor::process_pending_embeddings`] walks every chunk that
//! has no embedding, in id order, one page at a time:
//!
//! 1. Fetch a page of `batch_size × max_concurrent` pending chunks with a
//!    keyset cursor (`id > last_seen`). A chunk that fails during this
//!    sweep is behind the cursor and is not fetched again until the next
//!    sweep.
//! 2. Split the page into batches of `batch_size`.
//! 3. Embed up to `max_concurrent` batches at once.
//! 4. Validate each response (count, dimension, finite values) and write each vector
//!    with the store's write-once update.
//! 5. Mark every touched source whose chunks are now all embedded as
//!    `completed`.
//!
//! A failed batch leaves its chunks pending and never affects its
//! siblings. The processor does not retry; retrying is the provider
//! adapter's job.
//!
//! Two sweeps running against the same store at once may embed the same
//! chunk twice. The write-once guard keeps the data consistent, but the
//! provider calls are wasted, so schedule a single runner.

use std::collections::BTreeSet;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::embedding::{is_finite_vector, EmbeddingProvider};
use crate::error::{PipelineError, PipelineResult, ProviderError};
use crate::models::{PendingChunk, SourceStatus};
use crate::store::KnowledgeStore;

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbeddingReport {
    /// Pending chunks fetched from the store.
    pub pending_seen: usize,
    /// Chunks that received an embedding.
    pub embedded: usize,
    /// Chunks left pending by a failed batch or a failed write.
    pub failed: usize,
    /// Chunks that already had an embedding by the time we wrote.
    pub skipped: usize,
    /// Provider calls made.
    pub batches: usize,
    pub failed_batches: usize,
    pub sources_completed: usize,
}

enum BatchOutcome {
    Written {
        source_ids: BTreeSet<i64>,
        embedded: usize,
        skipped: usize,
        write_failures: usize,
    },
    Failed {
        error: ProviderError,
        chunks: usize,
    },
}

/// Embeds pending chunks through an [`EmbeddingProvider`] with bounded
/// concurrency.
pub struct EmbeddingProcessor<'a> {
    store: &'a dyn KnowledgeStore,
    provider: &'a dyn EmbeddingProvider,
    config: PipelineConfig,
}

impl<'a> EmbeddingProcessor<'a> {
    pub fn new(
        store: &'a dyn KnowledgeStore,
        provider: &'a dyn EmbeddingProvider,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Embed every chunk that lacks an embedding.
    ///
    /// Safe to call repeatedly; with nothing pending it makes no provider
    /// calls and changes nothing.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Provider`] if every batch of a page failed with a
    ///   permanent error (bad credentials, wrong model, dimension mismatch).
    ///   The sweep stops early.
    /// - [`PipelineError::AllBatchesFailed`] if batches were attempted and
    ///   none succeeded.
    /// - [`PipelineError::Store`] if the pending-chunk scan itself fails.
    pub async fn process_pending_embeddings(&self) -> PipelineResult<EmbeddingReport> {
        self.config.validate()?;

        let page_size = self.config.page_size();
        let mut report = EmbeddingReport::default();
        let mut cursor = 0i64;
        let mut last_error: Option<ProviderError> = None;

        loop {
            let page = self.store.pending_chunks(cursor, page_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = last.id;
            report.pending_seen += page.len();

            let outcomes: Vec<BatchOutcome> = stream::iter(page.chunks(self.config.batch_size))
                .map(|batch| self.embed_batch(batch))
                .buffer_unordered(self.config.max_concurrent)
                .collect()
                .await;

            let page_batches = outcomes.len();
            let mut page_permanent = 0usize;
            let mut touched = BTreeSet::new();

            for outcome in outcomes {
                report.batches += 1;
                match outcome {
                    BatchOutcome::Written {
                        source_ids,
                        embedded,
                        skipped,
                        write_failures,
                    } => {
                        report.embedded += embedded;
                        report.skipped += skipped;
                        report.failed += write_failures;
                        touched.extend(source_ids);
                    }
                    BatchOutcome::Failed { error, chunks } => {
                        report.failed_batches += 1;
                        report.failed += chunks;
                        if error.is_permanent() {
                            page_permanent += 1;
                        }
                        last_error = Some(error);
                    }
                }
            }

            report.sources_completed += self.complete_sources(&touched).await;

            if page_batches > 0 && page_permanent == page_batches {
                if let Some(err) = last_error.clone() {
                    error!(
                        batches = page_batches,
                        "every batch in page failed permanently; halting sweep"
                    );
                    return Err(PipelineError::Provider(err));
                }
            }

            if page.len() < page_size {
                break;
            }
        }

        report.sources_completed += self.reconcile_sources().await;

        if report.batches > 0 && report.failed_batches == report.batches {
            if let Some(last) = last_error {
                return Err(PipelineError::AllBatchesFailed {
                    failed: report.failed_batches,
                    last,
                });
            }
        }

        info!(
            pending = report.pending_seen,
            embedded = report.embedded,
            failed = report.failed,
            batches = report.batches,
            failed_batches = report.failed_batches,
            sources_completed = report.sources_completed,
            "embedding sweep finished"
        );

        Ok(report)
    }

    async fn embed_batch(&self, batch: &[PendingChunk]) -> BatchOutcome {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let tokens: usize = batch.iter().map(|c| c.token_count).sum();
        debug!(
            chunks = batch.len(),
            tokens,
            first_chunk = batch.first().map(|c| c.id),
            "embedding batch"
        );

        let vectors = match self.provider.embed(&texts).await {
            Ok(vectors) => vectors,
            Err(error) => {
                log_batch_failure(&error, batch.len());
                return BatchOutcome::Failed {
                    error,
                    chunks: batch.len(),
                };
            }
        };

        if let Err(error) = self.check_vectors(batch.len(), &vectors) {
            log_batch_failure(&error, batch.len());
            return BatchOutcome::Failed {
                error,
                chunks: batch.len(),
            };
        }

        let mut source_ids = BTreeSet::new();
        let mut embedded = 0;
        let mut skipped = 0;
        let mut write_failures = 0;

        for (chunk, vector) in batch.iter().zip(vectors.iter()) {
            match self.store.set_chunk_embedding(chunk.id, vector).await {
                Ok(true) => {
                    embedded += 1;
                    source_ids.insert(chunk.source_id);
                }
                Ok(false) => {
                    skipped += 1;
                    source_ids.insert(chunk.source_id);
                }
                Err(e) => {
                    warn!(chunk_id = chunk.id, error = %e, "failed to store embedding");
                    write_failures += 1;
                }
            }
        }

        BatchOutcome::Written {
            source_ids,
            embedded,
            skipped,
            write_failures,
        }
    }

    fn check_vectors(&self, expected_count: usize, vectors: &[Vec<f32>]) -> Result<(), ProviderError> {
        if vectors.len() != expected_count {
            return Err(ProviderError::Permanent(format!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                expected_count
            )));
        }
        let dims = self.config.embedding_dims;
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(ProviderError::Permanent(
                PipelineError::DimensionMismatch {
                    expected: dims,
                    actual: bad.len(),
                }
                .to_string(),
            ));
        }
        if !vectors.iter().all(|v| is_finite_vector(v)) {
            return Err(ProviderError::Permanent(
                PipelineError::NonFiniteEmbedding.to_string(),
            ));
        }
        Ok(())
    }

    /// Mark each source with no pending chunks left as completed. Returns
    /// how many sources changed status.
    async fn complete_sources(&self, source_ids: &BTreeSet<i64>) -> usize {
        let mut completed = 0;
        for &source_id in source_ids {
            match self.try_complete_source(source_id).await {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => warn!(source_id, error = %e, "failed to update source status"),
            }
        }
        completed
    }

    /// A pending source with no chunks at all is left alone: sources are
    /// created together with their chunks, so an empty pending one is still
    /// being written by someone else.
    async fn try_complete_source(&self, source_id: i64) -> anyhow::Result<bool> {
        if self.store.pending_chunk_count(source_id).await? > 0 {
            return Ok(false);
        }
        if self.store.chunk_count(source_id).await? == 0 {
            return Ok(false);
        }
        match self.store.get_source(source_id).await? {
            Some(source) if source.status == SourceStatus::Pending => {
                self.store
                    .set_source_status(source_id, SourceStatus::Completed)
                    .await?;
                debug!(source_id, "source completed");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Pick up pending sources whose chunks were all embedded but whose
    /// status update was lost.
    async fn reconcile_sources(&self) -> usize {
        let pending = match self.store.list_sources(Some(SourceStatus::Pending)).await {
            Ok(sources) => sources,
            Err(e) => {
                warn!(error = %e, "failed to list pending sources");
                return 0;
            }
        };
        let ids: BTreeSet<i64> = pending.iter().map(|s| s.id).collect();
        self.complete_sources(&ids).await
    }
}

fn log_batch_failure(error: &ProviderError, chunks: usize) {
    match error {
        ProviderError::Transient(_) => {
            warn!(chunks, error = %error, "embedding batch failed; chunks stay pending")
        }
        ProviderError::Permanent(_) | ProviderError::Unknown(_) => {
            error!(chunks, error = %error, "embedding batch failed; chunks stay pending")
        }
    }
}
