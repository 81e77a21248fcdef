//! Storage abstraction for chat-kb.
//!
//! [`KnowledgeStore`] covers sources, chunks and their embeddings, including
//! similarity search. [`SessionStore`] covers the bot's conversation
//! sessions. Some deployments back both with one database, which is why a
//! single type (e.g. [`memory::InMemoryStore`]) may implement both.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    ChatSession, KnowledgeChunk, KnowledgeSource, Message, NewChunk, NewSource, PendingChunk,
    SessionStatus, SimilarityResult, SourceStatus, SourceType, StoreStats,
};
use crate::search::SearchFilters;

/// Persistence for knowledge sources, chunks and embeddings.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`save_source`](KnowledgeStore::save_source) | Create a source, returning its id |
/// | [`save_source_with_chunks`](KnowledgeStore::save_source_with_chunks) | Create a source and its chunks atomically |
/// | [`find_source_by_uri`](KnowledgeStore::find_source_by_uri) | Look up a source for reuse |
/// | [`set_source_status`](KnowledgeStore::set_source_status) | Move a source through its lifecycle |
/// | [`save_chunk`](KnowledgeStore::save_chunk) | Persist one pending chunk |
/// | [`pending_chunks`](KnowledgeStore::pending_chunks) | Keyset-paged scan of chunks without embeddings |
/// | [`set_chunk_embedding`](KnowledgeStore::set_chunk_embedding) | Write-once embedding update |
/// | [`similarity_search`](KnowledgeStore::similarity_search) | Filtered top-k cosine ranking |
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn save_source(&self, source: &NewSource) -> Result<i64>;

    /// Create a source together with its pending chunks in one atomic
    /// write. No reader sees the source without all of its chunks.
    async fn save_source_with_chunks(
        &self,
        source: &NewSource,
        chunks: &[NewChunk],
    ) -> Result<i64>;

    async fn get_source(&self, id: i64) -> Result<Option<KnowledgeSource>>;

    async fn find_source_by_uri(
        &self,
        source_type: SourceType,
        uri: &str,
    ) -> Result<Option<KnowledgeSource>>;

    /// All sources, optionally restricted to one status, ascending by id.
    async fn list_sources(&self, status: Option<SourceStatus>) -> Result<Vec<KnowledgeSource>>;

    async fn set_source_status(&self, id: i64, status: SourceStatus) -> Result<()>;

    /// Delete a source and, by cascade, all of its chunks.
    async fn delete_source(&self, id: i64) -> Result<()>;

    async fn save_chunk(&self, source_id: i64, chunk: &NewChunk) -> Result<i64>;

    /// Delete every chunk of a source, returning how many were removed.
    async fn delete_chunks(&self, source_id: i64) -> Result<u64>;

    /// Chunks with no embedding and `id > after_id`, ascending by id, at
    /// most `limit` of them.
    async fn pending_chunks(&self, after_id: i64, limit: usize) -> Result<Vec<PendingChunk>>;

    /// Attach an embedding to a chunk that does not have one yet.
    ///
    /// Returns `false` without writing if the chunk already has an
    /// embedding or no longer exists.
    async fn set_chunk_embedding(&self, chunk_id: i64, embedding: &[f32]) -> Result<bool>;

    async fn pending_chunk_count(&self, source_id: i64) -> Result<u64>;

    /// All chunks of a source, embedded or not.
    async fn chunk_count(&self, source_id: i64) -> Result<u64>;

    async fn chunks_for_source(&self, source_id: i64) -> Result<Vec<KnowledgeChunk>>;

    /// Rank embedded chunks against `query`.
    ///
    /// Results satisfy `filters`, carry a similarity in `[0.0, 1.0]`, are
    /// ordered by similarity descending then chunk id ascending, and number
    /// at most `top_k`.
    async fn similarity_search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SimilarityResult>>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Persistence for chat sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, key: &str) -> Result<Option<ChatSession>>;

    /// Create or overwrite a session. Fails if the stored session is
    /// archived; archiving is one-way.
    async fn save_session(&self, session: &ChatSession) -> Result<()>;

    /// Append one message to the session keyed by `template.session_key`,
    /// creating the session from `template` on first interaction.
    ///
    /// Fails if the session is archived.
    async fn append_message(&self, template: &ChatSession, message: &Message)
        -> Result<ChatSession>;

    /// Active sessions whose `last_active_at` is strictly before `cutoff`,
    /// oldest first.
    async fn list_inactive(&self, cutoff: DateTime<Utc>) -> Result<Vec<ChatSession>>;

    async fn set_session_status(&self, key: &str, status: SessionStatus) -> Result<()>;

    async fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<ChatSession>>;
}
