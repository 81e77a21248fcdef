//! In-memory [`KnowledgeStore`] and [`SessionStore`] for tests and embedding
//! in other hosts.
//!
//! Everything lives behind `std::sync::RwLock`; ids are assigned from a
//! counter starting at 1. Similarity search is brute-force over every
//! embedded chunk.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::normalized_similarity;
use crate::models::{
    ChatSession, KnowledgeChunk, KnowledgeSource, Message, NewChunk, NewSource, PendingChunk,
    SessionStatus, SimilarityResult, SourceStatus, SourceType, SourceTypeStats, StoreStats,
};
use crate::search::{rank_results, SearchFilters};

use super::{KnowledgeStore, SessionStore};

#[derive(Default)]
struct Knowledge {
    next_id: i64,
    sources: BTreeMap<i64, KnowledgeSource>,
    chunks: BTreeMap<i64, KnowledgeChunk>,
}

impl Knowledge {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_source(&mut self, source: &NewSource) -> i64 {
        let id = self.allocate_id();
        self.sources.insert(
            id,
            KnowledgeSource {
                id,
                source_type: source.source_type,
                title: source.title.clone(),
                uri: source.uri.clone(),
                metadata: source.metadata.clone(),
                status: source.status,
                created_at: Utc::now(),
            },
        );
        id
    }

    fn insert_chunk(&mut self, source_id: i64, chunk: &NewChunk) -> i64 {
        let id = self.allocate_id();
        self.chunks.insert(
            id,
            KnowledgeChunk {
                id,
                source_id,
                content: chunk.content.clone(),
                location: chunk.location.clone(),
                token_count: chunk.token_count,
                hash: chunk.hash.clone(),
                embedding: None,
            },
        );
        id
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    knowledge: RwLock<Knowledge>,
    sessions: RwLock<BTreeMap<String, ChatSession>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn knowledge(&self) -> Result<RwLockReadGuard<'_, Knowledge>> {
        self.knowledge
            .read()
            .map_err(|_| anyhow!("knowledge store lock poisoned"))
    }

    fn knowledge_mut(&self) -> Result<RwLockWriteGuard<'_, Knowledge>> {
        self.knowledge
            .write()
            .map_err(|_| anyhow!("knowledge store lock poisoned"))
    }

    fn sessions(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, ChatSession>>> {
        self.sessions
            .read()
            .map_err(|_| anyhow!("session store lock poisoned"))
    }

    fn sessions_mut(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, ChatSession>>> {
        self.sessions
            .write()
            .map_err(|_| anyhow!("session store lock poisoned"))
    }

    /// Every chunk currently stored, ascending by id.
    pub fn all_chunks(&self) -> Result<Vec<KnowledgeChunk>> {
        Ok(self.knowledge()?.chunks.values().cloned().collect())
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn save_source(&self, source: &NewSource) -> Result<i64> {
        Ok(self.knowledge_mut()?.insert_source(source))
    }

    async fn save_source_with_chunks(
        &self,
        source: &NewSource,
        chunks: &[NewChunk],
    ) -> Result<i64> {
        let mut k = self.knowledge_mut()?;
        let source_id = k.insert_source(source);
        for chunk in chunks {
            k.insert_chunk(source_id, chunk);
        }
        Ok(source_id)
    }

    async fn get_source(&self, id: i64) -> Result<Option<KnowledgeSource>> {
        Ok(self.knowledge()?.sources.get(&id).cloned())
    }

    async fn find_source_by_uri(
        &self,
        source_type: SourceType,
        uri: &str,
    ) -> Result<Option<KnowledgeSource>> {
        Ok(self
            .knowledge()?
            .sources
            .values()
            .find(|s| s.source_type == source_type && s.uri == uri)
            .cloned())
    }

    async fn list_sources(&self, status: Option<SourceStatus>) -> Result<Vec<KnowledgeSource>> {
        Ok(self
            .knowledge()?
            .sources
            .values()
            .filter(|s| status.map_or(true, |st| s.status == st))
            .cloned()
            .collect())
    }

    async fn set_source_status(&self, id: i64, status: SourceStatus) -> Result<()> {
        let mut k = self.knowledge_mut()?;
        match k.sources.get_mut(&id) {
            Some(source) => {
                source.status = status;
                Ok(())
            }
            None => bail!("source {} not found", id),
        }
    }

    async fn delete_source(&self, id: i64) -> Result<()> {
        let mut k = self.knowledge_mut()?;
        k.chunks.retain(|_, c| c.source_id != id);
        k.sources.remove(&id);
        Ok(())
    }

    async fn save_chunk(&self, source_id: i64, chunk: &NewChunk) -> Result<i64> {
        let mut k = self.knowledge_mut()?;
        if !k.sources.contains_key(&source_id) {
            bail!("source {} not found", source_id);
        }
        Ok(k.insert_chunk(source_id, chunk))
    }

    async fn delete_chunks(&self, source_id: i64) -> Result<u64> {
        let mut k = self.knowledge_mut()?;
        let before = k.chunks.len();
        k.chunks.retain(|_, c| c.source_id != source_id);
        Ok((before - k.chunks.len()) as u64)
    }

    async fn pending_chunks(&self, after_id: i64, limit: usize) -> Result<Vec<PendingChunk>> {
        let k = self.knowledge()?;
        Ok(k.chunks
            .range(after_id.saturating_add(1)..)
            .map(|(_, c)| c)
            .filter(|c| c.is_pending())
            .take(limit)
            .map(|c| PendingChunk {
                id: c.id,
                source_id: c.source_id,
                content: c.content.clone(),
                token_count: c.token_count,
            })
            .collect())
    }

    async fn set_chunk_embedding(&self, chunk_id: i64, embedding: &[f32]) -> Result<bool> {
        let mut k = self.knowledge_mut()?;
        match k.chunks.get_mut(&chunk_id) {
            Some(chunk) if chunk.embedding.is_none() => {
                chunk.embedding = Some(embedding.to_vec());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_chunk_count(&self, source_id: i64) -> Result<u64> {
        let k = self.knowledge()?;
        Ok(k.chunks
            .values()
            .filter(|c| c.source_id == source_id && c.is_pending())
            .count() as u64)
    }

    async fn chunk_count(&self, source_id: i64) -> Result<u64> {
        let k = self.knowledge()?;
        Ok(k.chunks.values().filter(|c| c.source_id == source_id).count() as u64)
    }

    async fn chunks_for_source(&self, source_id: i64) -> Result<Vec<KnowledgeChunk>> {
        let k = self.knowledge()?;
        Ok(k.chunks
            .values()
            .filter(|c| c.source_id == source_id)
            .cloned()
            .collect())
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SimilarityResult>> {
        let k = self.knowledge()?;
        let results = k
            .chunks
            .values()
            .filter_map(|c| {
                let embedding = c.embedding.as_ref()?;
                let source = k.sources.get(&c.source_id)?;
                if !filters.matches(source.source_type, &source.metadata) {
                    return None;
                }
                Some(SimilarityResult {
                    chunk_id: c.id,
                    source_id: source.id,
                    content: c.content.clone(),
                    similarity: normalized_similarity(query, embedding),
                    source_metadata: source.metadata.clone(),
                    source_type: source.source_type,
                    source_title: source.title.clone(),
                    location: c.location.clone(),
                })
            })
            .collect();
        Ok(rank_results(results, top_k))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let k = self.knowledge()?;
        let mut groups: BTreeMap<(&'static str, &'static str), SourceTypeStats> = BTreeMap::new();
        for source in k.sources.values() {
            let entry = groups
                .entry((source.source_type.as_str(), source.status.as_str()))
                .or_insert_with(|| SourceTypeStats {
                    source_type: source.source_type,
                    status: source.status,
                    source_count: 0,
                    chunk_count: 0,
                    embedded_count: 0,
                });
            entry.source_count += 1;
            for c in k.chunks.values().filter(|c| c.source_id == source.id) {
                entry.chunk_count += 1;
                if !c.is_pending() {
                    entry.embedded_count += 1;
                }
            }
        }
        Ok(StoreStats {
            sources: groups.into_values().collect(),
        })
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn load_session(&self, key: &str) -> Result<Option<ChatSession>> {
        Ok(self.sessions()?.get(key).cloned())
    }

    async fn save_session(&self, session: &ChatSession) -> Result<()> {
        let mut sessions = self.sessions_mut()?;
        if sessions.get(&session.session_key).is_some_and(|s| s.is_archived()) {
            bail!("session {} is archived", session.session_key);
        }
        sessions.insert(session.session_key.clone(), session.clone());
        Ok(())
    }

    async fn append_message(
        &self,
        template: &ChatSession,
        message: &Message,
    ) -> Result<ChatSession> {
        let mut sessions = self.sessions_mut()?;
        let session = sessions
            .entry(template.session_key.clone())
            .or_insert_with(|| template.clone());
        if session.is_archived() {
            bail!("session {} is archived", session.session_key);
        }
        session.push_message(message.clone());
        Ok(session.clone())
    }

    async fn list_inactive(&self, cutoff: DateTime<Utc>) -> Result<Vec<ChatSession>> {
        let mut due: Vec<ChatSession> = self
            .sessions()?
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.last_active_at < cutoff)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.last_active_at
                .cmp(&b.last_active_at)
                .then_with(|| a.session_key.cmp(&b.session_key))
        });
        Ok(due)
    }

    async fn set_session_status(&self, key: &str, status: SessionStatus) -> Result<()> {
        let mut sessions = self.sessions_mut()?;
        match sessions.get_mut(key) {
            Some(session) => {
                session.status = status;
                Ok(())
            }
            None => bail!("session {} not found", key),
        }
    }

    async fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<ChatSession>> {
        Ok(self
            .sessions()?
            .values()
            .filter(|s| status.map_or(true, |st| s.status == st))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkLocation, Role, SessionType};
    use serde_json::json;

    fn new_chunk(text: &str) -> NewChunk {
        NewChunk {
            content: text.to_string(),
            location: ChunkLocation::Document {
                url: "file:///t".into(),
                label: "t §1".into(),
            },
            token_count: 1,
            hash: crate::chunk::content_hash(text),
        }
    }

    fn new_source(uri: &str) -> NewSource {
        NewSource {
            source_type: SourceType::DocumentFile,
            title: "t".into(),
            uri: uri.into(),
            metadata: json!({}),
            status: SourceStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_embedding_is_write_once() {
        let store = InMemoryStore::new();
        let sid = store.save_source(&new_source("file:///t")).await.unwrap();
        let cid = store.save_chunk(sid, &new_chunk("a")).await.unwrap();

        assert!(store.set_chunk_embedding(cid, &[1.0, 0.0]).await.unwrap());
        assert!(!store.set_chunk_embedding(cid, &[0.0, 1.0]).await.unwrap());
        let chunks = store.chunks_for_source(sid).await.unwrap();
        assert_eq!(chunks[0].embedding.as_deref(), Some(&[1.0f32, 0.0][..]));
    }

    #[tokio::test]
    async fn test_pending_chunks_keyset_paging() {
        let store = InMemoryStore::new();
        let sid = store.save_source(&new_source("file:///t")).await.unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(store.save_chunk(sid, &new_chunk(&format!("c{i}"))).await.unwrap());
        }
        store.set_chunk_embedding(ids[1], &[1.0]).await.unwrap();

        let page1 = store.pending_chunks(0, 2).await.unwrap();
        assert_eq!(page1.iter().map(|c| c.id).collect::<Vec<_>>(), vec![ids[0], ids[2]]);
        let page2 = store.pending_chunks(ids[2], 10).await.unwrap();
        assert_eq!(page2.iter().map(|c| c.id).collect::<Vec<_>>(), vec![ids[3], ids[4]]);
        assert_eq!(store.pending_chunk_count(sid).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_delete_source_cascades() {
        let store = InMemoryStore::new();
        let sid = store.save_source(&new_source("file:///t")).await.unwrap();
        store.save_chunk(sid, &new_chunk("a")).await.unwrap();
        store.delete_source(sid).await.unwrap();
        assert!(store.get_source(sid).await.unwrap().is_none());
        assert!(store.all_chunks().unwrap().is_empty());
        assert!(store.save_chunk(sid, &new_chunk("b")).await.is_err());
    }

    #[tokio::test]
    async fn test_append_creates_then_rejects_archived() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let template = ChatSession::new("mention:9", SessionType::Mention, now);
        let msg = Message {
            role: Role::User,
            content: "hey".into(),
            timestamp: now,
        };
        let s = store.append_message(&template, &msg).await.unwrap();
        assert_eq!(s.messages.len(), 1);
        let s = store.append_message(&template, &msg).await.unwrap();
        assert_eq!(s.messages.len(), 2);

        store
            .set_session_status("mention:9", SessionStatus::Archived)
            .await
            .unwrap();
        assert!(store.append_message(&template, &msg).await.is_err());
    }

    #[tokio::test]
    async fn test_save_session_cannot_overwrite_archived() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut session = ChatSession::new("thread:3", SessionType::Thread, now);
        store.save_session(&session).await.unwrap();
        store
            .set_session_status("thread:3", SessionStatus::Archived)
            .await
            .unwrap();

        session.push_message(Message {
            role: Role::User,
            content: "late".into(),
            timestamp: now,
        });
        assert!(store.save_session(&session).await.is_err());
        let loaded = store.load_session("thread:3").await.unwrap().unwrap();
        assert!(loaded.is_archived());
        assert!(loaded.messages.is_empty());
    }

    #[tokio::test]
    async fn test_source_with_chunks_saved_together() {
        let store = InMemoryStore::new();
        let sid = store
            .save_source_with_chunks(&new_source("file:///t"), &[new_chunk("a"), new_chunk("b")])
            .await
            .unwrap();
        assert_eq!(store.chunk_count(sid).await.unwrap(), 2);
        assert_eq!(store.pending_chunk_count(sid).await.unwrap(), 2);
        let chunks = store.chunks_for_source(sid).await.unwrap();
        assert_eq!(
            chunks.iter().map(|c| c.content.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }
}
