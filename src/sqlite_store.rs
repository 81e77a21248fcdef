//! SQLite-backed [`KnowledgeStore`] and [`SessionStore`].
//!
//! Timestamps are stored as Unix milliseconds, source metadata and chunk
//! locations as JSON text, embeddings as little-endian `f32` BLOBs. Vector
//! search is brute force: every embedded chunk that passes the SQL-side
//! `source_type` filter is scored in Rust.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use chat_kb_core::embedding::{blob_to_vec, normalized_similarity, vec_to_blob};
use chat_kb_core::models::{
    ChatSession, ChunkLocation, KnowledgeChunk, KnowledgeSource, Message, NewChunk, NewSource,
    PendingChunk, SessionStatus, SimilarityResult, SourceStatus, SourceType, SourceTypeStats,
    StoreStats,
};
use chat_kb_core::search::{rank_results, SearchFilters};
use chat_kb_core::store::{KnowledgeStore, SessionStore};

/// SQLite implementation of both store traits, sharing one pool.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn messages_for(&self, key: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT role, content, timestamp FROM chat_messages WHERE session_key = ? ORDER BY id ASC",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Message> {
                let role: String = row.try_get("role")?;
                Ok(Message {
                    role: role.parse()?,
                    content: row.try_get("content")?,
                    timestamp: from_millis(row.try_get("timestamp")?)?,
                })
            })
            .collect()
    }

    async fn sessions_from_rows(&self, rows: &[SqliteRow]) -> Result<Vec<ChatSession>> {
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("session_key")?;
            let messages = self.messages_for(&key).await?;
            sessions.push(session_from_row(row, messages)?);
        }
        Ok(sessions)
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn snowflake_to_sql(id: Option<u64>) -> Result<Option<i64>> {
    id.map(i64::try_from)
        .transpose()
        .context("snowflake does not fit in a SQLite integer")
}

fn snowflake_from_sql(id: Option<i64>) -> Result<Option<u64>> {
    id.map(u64::try_from)
        .transpose()
        .context("negative snowflake in database")
}

fn source_from_row(row: &SqliteRow) -> Result<KnowledgeSource> {
    let source_type: String = row.try_get("source_type")?;
    let status: String = row.try_get("status")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    Ok(KnowledgeSource {
        id: row.try_get("id")?,
        source_type: source_type.parse()?,
        title: row.try_get("title")?,
        uri: row.try_get("uri")?,
        metadata: parse_metadata(&metadata_json, row.try_get("id")?)?,
        status: status.parse()?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

fn parse_metadata(metadata_json: &str, source_id: i64) -> Result<serde_json::Value> {
    serde_json::from_str(metadata_json)
        .with_context(|| format!("Corrupt metadata_json for source {}", source_id))
}

fn session_from_row(row: &SqliteRow, messages: Vec<Message>) -> Result<ChatSession> {
    let session_type: String = row.try_get("session_type")?;
    let status: String = row.try_get("status")?;
    Ok(ChatSession {
        session_key: row.try_get("session_key")?,
        session_type: session_type.parse()?,
        messages,
        guild_id: snowflake_from_sql(row.try_get("guild_id")?)?,
        channel_id: snowflake_from_sql(row.try_get("channel_id")?)?,
        user_id: snowflake_from_sql(row.try_get("user_id")?)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        last_active_at: from_millis(row.try_get("last_active_at")?)?,
        status: status.parse()?,
    })
}

const SOURCE_COLUMNS: &str = "id, source_type, title, uri, metadata_json, status, created_at";
const SESSION_COLUMNS: &str =
    "session_key, session_type, guild_id, channel_id, user_id, created_at, last_active_at, status";

async fn upsert_session_row(conn: &mut SqliteConnection, session: &ChatSession) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chat_sessions (session_key, session_type, guild_id, channel_id, user_id,
                                   created_at, last_active_at, status)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(session_key) DO UPDATE SET
            session_type = excluded.session_type,
            guild_id = excluded.guild_id,
            channel_id = excluded.channel_id,
            user_id = excluded.user_id,
            created_at = excluded.created_at,
            last_active_at = excluded.last_active_at,
            status = excluded.status
        "#,
    )
    .bind(&session.session_key)
    .bind(session.session_type.as_str())
    .bind(snowflake_to_sql(session.guild_id)?)
    .bind(snowflake_to_sql(session.channel_id)?)
    .bind(snowflake_to_sql(session.user_id)?)
    .bind(session.created_at.timestamp_millis())
    .bind(session.last_active_at.timestamp_millis())
    .bind(session.status.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_message(conn: &mut SqliteConnection, key: &str, message: &Message) -> Result<()> {
    sqlx::query(
        "INSERT INTO chat_messages (session_key, role, content, timestamp) VALUES (?, ?, ?, ?)",
    )
    .bind(key)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(message.timestamp.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_source(conn: &mut SqliteConnection, source: &NewSource) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO knowledge_sources (source_type, title, uri, metadata_json, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(source.source_type.as_str())
    .bind(&source.title)
    .bind(&source.uri)
    .bind(serde_json::to_string(&source.metadata)?)
    .bind(source.status.as_str())
    .bind(Utc::now().timestamp_millis())
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn insert_chunk(
    conn: &mut SqliteConnection,
    source_id: i64,
    chunk: &NewChunk,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO knowledge_chunks (source_id, content, location_json, token_count, hash)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(source_id)
    .bind(&chunk.content)
    .bind(serde_json::to_string(&chunk.location)?)
    .bind(chunk.token_count as i64)
    .bind(&chunk.hash)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("Failed to save chunk for source {}", source_id))?;

    Ok(result.last_insert_rowid())
}

#[async_trait]
impl KnowledgeStore for SqliteStore {
    async fn save_source(&self, source: &NewSource) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_source(&mut *conn, source).await
    }

    async fn save_source_with_chunks(
        &self,
        source: &NewSource,
        chunks: &[NewChunk],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let source_id = insert_source(&mut *tx, source).await?;
        for chunk in chunks {
            insert_chunk(&mut *tx, source_id, chunk).await?;
        }
        tx.commit().await?;
        Ok(source_id)
    }

    async fn get_source(&self, id: i64) -> Result<Option<KnowledgeSource>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM knowledge_sources WHERE id = ?",
            SOURCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(source_from_row).transpose()
    }

    async fn find_source_by_uri(
        &self,
        source_type: SourceType,
        uri: &str,
    ) -> Result<Option<KnowledgeSource>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM knowledge_sources WHERE source_type = ? AND uri = ? ORDER BY id DESC LIMIT 1",
            SOURCE_COLUMNS
        ))
        .bind(source_type.as_str())
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_sources(&self, status: Option<SourceStatus>) -> Result<Vec<KnowledgeSource>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM knowledge_sources WHERE (? IS NULL OR status = ?) ORDER BY id ASC",
            SOURCE_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(source_from_row).collect()
    }

    async fn set_source_status(&self, id: i64, status: SourceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE knowledge_sources SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("source {} not found", id);
        }
        Ok(())
    }

    async fn delete_source(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM knowledge_sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_chunk(&self, source_id: i64, chunk: &NewChunk) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_chunk(&mut *conn, source_id, chunk).await
    }

    async fn delete_chunks(&self, source_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM knowledge_chunks WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn pending_chunks(&self, after_id: i64, limit: usize) -> Result<Vec<PendingChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, content, token_count
            FROM knowledge_chunks
            WHERE embedding IS NULL AND id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PendingChunk> {
                let token_count: i64 = row.try_get("token_count")?;
                Ok(PendingChunk {
                    id: row.try_get("id")?,
                    source_id: row.try_get("source_id")?,
                    content: row.try_get("content")?,
                    token_count: usize::try_from(token_count)?,
                })
            })
            .collect()
    }

    async fn set_chunk_embedding(&self, chunk_id: i64, embedding: &[f32]) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE knowledge_chunks SET embedding = ?, embedded_at = ? WHERE id = ? AND embedding IS NULL",
        )
        .bind(vec_to_blob(embedding))
        .bind(Utc::now().timestamp_millis())
        .bind(chunk_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn pending_chunk_count(&self, source_id: i64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM knowledge_chunks WHERE source_id = ? AND embedding IS NULL",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count)?)
    }

    async fn chunk_count(&self, source_id: i64) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_chunks WHERE source_id = ?")
                .bind(source_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(u64::try_from(count)?)
    }

    async fn chunks_for_source(&self, source_id: i64) -> Result<Vec<KnowledgeChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, content, location_json, token_count, hash, embedding
            FROM knowledge_chunks
            WHERE source_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<KnowledgeChunk> {
                let location_json: String = row.try_get("location_json")?;
                let token_count: i64 = row.try_get("token_count")?;
                let blob: Option<Vec<u8>> = row.try_get("embedding")?;
                Ok(KnowledgeChunk {
                    id: row.try_get("id")?,
                    source_id: row.try_get("source_id")?,
                    content: row.try_get("content")?,
                    location: serde_json::from_str(&location_json)?,
                    token_count: usize::try_from(token_count)?,
                    hash: row.try_get("hash")?,
                    embedding: blob.map(|b| blob_to_vec(&b)),
                })
            })
            .collect()
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SimilarityResult>> {
        let source_type = filters.source_type.map(|t| t.as_str());
        let rows = sqlx::query(
            r#"
            SELECT c.id AS chunk_id, c.source_id, c.content, c.location_json, c.embedding,
                   s.source_type, s.title, s.metadata_json
            FROM knowledge_chunks c
            JOIN knowledge_sources s ON s.id = c.source_id
            WHERE c.embedding IS NOT NULL
              AND (? IS NULL OR s.source_type = ?)
            "#,
        )
        .bind(source_type)
        .bind(source_type)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::new();
        for row in &rows {
            let source_type: SourceType = row.try_get::<String, _>("source_type")?.parse()?;
            let metadata_json: String = row.try_get("metadata_json")?;
            let metadata = parse_metadata(&metadata_json, row.try_get("source_id")?)?;
            if !filters.matches(source_type, &metadata) {
                continue;
            }

            let blob: Vec<u8> = row.try_get("embedding")?;
            let location_json: String = row.try_get("location_json")?;
            let location: ChunkLocation = serde_json::from_str(&location_json)?;
            results.push(SimilarityResult {
                chunk_id: row.try_get("chunk_id")?,
                source_id: row.try_get("source_id")?,
                content: row.try_get("content")?,
                similarity: normalized_similarity(query, &blob_to_vec(&blob)),
                source_metadata: metadata,
                source_type,
                source_title: row.try_get("title")?,
                location,
            });
        }

        Ok(rank_results(results, top_k))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let rows = sqlx::query(
            r#"
            SELECT s.source_type, s.status,
                   COUNT(DISTINCT s.id) AS source_count,
                   COUNT(c.id) AS chunk_count,
                   COUNT(c.embedding) AS embedded_count
            FROM knowledge_sources s
            LEFT JOIN knowledge_chunks c ON c.source_id = s.id
            GROUP BY s.source_type, s.status
            ORDER BY s.source_type, s.status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let sources = rows
            .iter()
            .map(|row| -> Result<SourceTypeStats> {
                let source_type: String = row.try_get("source_type")?;
                let status: String = row.try_get("status")?;
                Ok(SourceTypeStats {
                    source_type: source_type.parse()?,
                    status: status.parse()?,
                    source_count: row.try_get("source_count")?,
                    chunk_count: row.try_get("chunk_count")?,
                    embedded_count: row.try_get("embedded_count")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StoreStats { sources })
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn load_session(&self, key: &str) -> Result<Option<ChatSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM chat_sessions WHERE session_key = ?",
            SESSION_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let messages = self.messages_for(key).await?;
                Ok(Some(session_from_row(&row, messages)?))
            }
            None => Ok(None),
        }
    }

    async fn save_session(&self, session: &ChatSession) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM chat_sessions WHERE session_key = ?")
                .bind(&session.session_key)
                .fetch_optional(&mut *tx)
                .await?;
        if status.as_deref() == Some(SessionStatus::Archived.as_str()) {
            bail!("session {} is archived", session.session_key);
        }

        upsert_session_row(&mut *tx, session).await?;
        sqlx::query("DELETE FROM chat_messages WHERE session_key = ?")
            .bind(&session.session_key)
            .execute(&mut *tx)
            .await?;
        for message in &session.messages {
            insert_message(&mut *tx, &session.session_key, message).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn append_message(
        &self,
        template: &ChatSession,
        message: &Message,
    ) -> Result<ChatSession> {
        let key = template.session_key.as_str();
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM chat_sessions WHERE session_key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        match status.as_deref() {
            None => {
                upsert_session_row(&mut *tx, template).await?;
                for m in &template.messages {
                    insert_message(&mut *tx, key, m).await?;
                }
            }
            Some(s) if s == SessionStatus::Archived.as_str() => {
                bail!("session {} is archived", key);
            }
            Some(_) => {}
        }

        insert_message(&mut *tx, key, message).await?;
        sqlx::query(
            "UPDATE chat_sessions SET last_active_at = MAX(last_active_at, ?) WHERE session_key = ?",
        )
        .bind(message.timestamp.timestamp_millis())
        .bind(key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.load_session(key)
            .await?
            .ok_or_else(|| anyhow!("session {} vanished after append", key))
    }

    async fn list_inactive(&self, cutoff: DateTime<Utc>) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chat_sessions WHERE status = ? AND last_active_at < ? \
             ORDER BY last_active_at ASC, session_key ASC",
            SESSION_COLUMNS
        ))
        .bind(SessionStatus::Active.as_str())
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        self.sessions_from_rows(&rows).await
    }

    async fn set_session_status(&self, key: &str, status: SessionStatus) -> Result<()> {
        let result = sqlx::query("UPDATE chat_sessions SET status = ? WHERE session_key = ?")
            .bind(status.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("session {} not found", key);
        }
        Ok(())
    }

    async fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chat_sessions WHERE (? IS NULL OR status = ?) ORDER BY session_key ASC",
            SESSION_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        self.sessions_from_rows(&rows).await
    }
}
