//! Session archiving.
//!
//! [`SessionArchiver::archive_inactive_sessions`] turns every active session
//! that has been idle for longer than the configured threshold into a
//! `discord_session` knowledge source:
//!
//! ```text
//! list_inactive(cutoff)
//!   └─ per session ─▶ chunk transcript ─▶ replace source by uri
//!                     ─▶ save source + chunks (one write) ─▶ mark session archived
//! then (optional) EmbeddingProcessor::process_pending_embeddings()
//! ```
//!
//! Sessions are independent units. A failure leaves that session active so
//! the next run picks it up again. A source whose session could not be
//! flipped is marked `failed` and is replaced (not duplicated) on that
//! retry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::chunk::chunk_session;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{ChatSession, NewSource, SessionStatus, SourceStatus, SourceType};
use crate::processor::{EmbeddingProcessor, EmbeddingReport};
use crate::store::{KnowledgeStore, SessionStore};

/// Outcome of one archiving run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveReport {
    /// Sessions past the inactivity threshold.
    pub due: usize,
    pub archived: usize,
    pub failed: usize,
    pub chunks_created: usize,
    /// Sources left behind by an earlier, interrupted run and replaced.
    pub sources_replaced: usize,
    /// Report of the embedding sweep, if a processor is attached and it
    /// succeeded.
    pub embedding: Option<EmbeddingReport>,
    pub embedding_error: Option<String>,
}

struct ArchivedSession {
    source_id: i64,
    chunks: usize,
    replaced: bool,
}

/// Archives idle sessions into the knowledge store.
pub struct SessionArchiver<'a> {
    knowledge: &'a dyn KnowledgeStore,
    sessions: &'a dyn SessionStore,
    config: PipelineConfig,
    processor: Option<EmbeddingProcessor<'a>>,
}

impl<'a> SessionArchiver<'a> {
    pub fn new(
        knowledge: &'a dyn KnowledgeStore,
        sessions: &'a dyn SessionStore,
        config: PipelineConfig,
    ) -> Self {
        Self {
            knowledge,
            sessions,
            config,
            processor: None,
        }
    }

    /// Run an embedding sweep after archiving. Without a processor, new
    /// chunks stay pending until the next scheduled sweep.
    pub fn with_processor(mut self, processor: EmbeddingProcessor<'a>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Sessions that a run at `now` would archive, oldest first.
    pub async fn due_sessions(&self, now: DateTime<Utc>) -> PipelineResult<Vec<ChatSession>> {
        self.config.validate()?;
        let cutoff = now - self.config.archive_threshold();
        Ok(self.sessions.list_inactive(cutoff).await?)
    }

    pub async fn archive_inactive_sessions(&self) -> PipelineResult<ArchiveReport> {
        self.archive_inactive_sessions_at(Utc::now()).await
    }

    /// Archive every session idle since before `now - threshold`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::AllSessionsFailed`] if sessions were due and not
    ///   one of them could be archived.
    /// - [`PipelineError::Store`] if the session listing itself fails.
    ///
    /// A failing embedding sweep is not an error here; it is recorded in
    /// [`ArchiveReport::embedding_error`] and the chunks stay pending.
    pub async fn archive_inactive_sessions_at(
        &self,
        now: DateTime<Utc>,
    ) -> PipelineResult<ArchiveReport> {
        let due = self.due_sessions(now).await?;
        let mut report = ArchiveReport {
            due: due.len(),
            ..ArchiveReport::default()
        };

        for session in &due {
            match self.archive_session(session).await {
                Ok(done) => {
                    report.archived += 1;
                    report.chunks_created += done.chunks;
                    if done.replaced {
                        report.sources_replaced += 1;
                    }
                    debug!(
                        session_key = %session.session_key,
                        source_id = done.source_id,
                        chunks = done.chunks,
                        "session archived"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        session_key = %session.session_key,
                        error = %format!("{e:#}"),
                        "failed to archive session; it stays active"
                    );
                }
            }
        }

        if report.due > 0 && report.archived == 0 {
            error!(failed = report.failed, "every due session failed to archive");
            return Err(PipelineError::AllSessionsFailed {
                failed: report.failed,
            });
        }

        if let Some(processor) = &self.processor {
            match processor.process_pending_embeddings().await {
                Ok(embedding) => report.embedding = Some(embedding),
                Err(e) => {
                    error!(error = %e, "embedding sweep after archiving failed");
                    report.embedding_error = Some(e.to_string());
                }
            }
        }

        info!(
            due = report.due,
            archived = report.archived,
            failed = report.failed,
            chunks = report.chunks_created,
            "archive run finished"
        );

        Ok(report)
    }

    async fn archive_session(&self, session: &ChatSession) -> anyhow::Result<ArchivedSession> {
        let chunks = chunk_session(&session.messages, self.config.max_tokens);

        let uri = session.source_uri();
        let mut replaced = false;
        if let Some(existing) = self
            .knowledge
            .find_source_by_uri(SourceType::DiscordSession, &uri)
            .await?
        {
            self.knowledge.delete_source(existing.id).await?;
            replaced = true;
        }

        let status = if chunks.is_empty() {
            SourceStatus::Completed
        } else {
            SourceStatus::Pending
        };
        let source_id = self
            .knowledge
            .save_source_with_chunks(&session_source(session, status), &chunks)
            .await?;

        // Flip last: an archived session always has its chunks stored.
        if let Err(e) = self
            .sessions
            .set_session_status(&session.session_key, SessionStatus::Archived)
            .await
        {
            if let Err(mark) = self
                .knowledge
                .set_source_status(source_id, SourceStatus::Failed)
                .await
            {
                warn!(source_id, error = %mark, "could not mark source failed");
            }
            return Err(e);
        }

        Ok(ArchivedSession {
            source_id,
            chunks: chunks.len(),
            replaced,
        })
    }
}

fn session_source(session: &ChatSession, status: SourceStatus) -> NewSource {
    NewSource {
        source_type: SourceType::DiscordSession,
        title: format!(
            "Discord {} session {}",
            session.session_type.as_str(),
            session.session_key
        ),
        uri: session.source_uri(),
        metadata: session_metadata(session),
        status,
    }
}

/// Scoping identifiers go in as JSON numbers so `{"channel_id": 111111}`
/// filters match.
fn session_metadata(session: &ChatSession) -> Value {
    json!({
        "session_key": session.session_key,
        "session_type": session.session_type.as_str(),
        "guild_id": session.guild_id,
        "channel_id": session.channel_id,
        "user_id": session.user_id,
        "message_count": session.messages.len(),
        "first_message_at": session.messages.first().map(|m| m.timestamp.to_rfc3339()),
        "last_message_at": session.messages.last().map(|m| m.timestamp.to_rfc3339()),
    })
}
