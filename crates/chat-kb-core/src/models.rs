//! Core data models shared by the pipeline, the stores and the CLI.
//!
//! Knowledge side: [`KnowledgeSource`] groups [`KnowledgeChunk`]s; a chunk
//! is pending until its `embedding` is set. Conversation side:
//! [`ChatSession`] holds the ordered transcript that the archiver turns
//! into a source.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Returned when a stored or user-supplied enum label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseLabelError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseLabelError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Origin of a knowledge source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    DiscordSession,
    DocumentFile,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::DiscordSession => "discord_session",
            SourceType::DocumentFile => "document_file",
        }
    }
}

impl FromStr for SourceType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discord_session" => Ok(SourceType::DiscordSession),
            "document_file" => Ok(SourceType::DocumentFile),
            other => Err(ParseLabelError::new("source type", other)),
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source lifecycle: `pending` until every chunk has an embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Pending,
    Completed,
    Failed,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Completed => "completed",
            SourceStatus::Failed => "failed",
        }
    }
}

impl FromStr for SourceStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SourceStatus::Pending),
            "completed" => Ok(SourceStatus::Completed),
            "failed" => Ok(SourceStatus::Failed),
            other => Err(ParseLabelError::new("source status", other)),
        }
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to [`KnowledgeStore::save_source`](crate::store::KnowledgeStore::save_source).
#[derive(Debug, Clone)]
pub struct NewSource {
    pub source_type: SourceType,
    pub title: String,
    pub uri: String,
    /// JSON object. Top-level keys are what search filters match against.
    pub metadata: serde_json::Value,
    pub status: SourceStatus,
}

/// A logical origin document that groups chunks.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeSource {
    pub id: i64,
    pub source_type: SourceType,
    pub title: String,
    pub uri: String,
    pub metadata: serde_json::Value,
    pub status: SourceStatus,
    pub created_at: DateTime<Utc>,
}

/// Pointer from a chunk back to where its text came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkLocation {
    /// Inclusive range of message indices within a session transcript.
    Messages {
        first_message: usize,
        last_message: usize,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
    Document {
        url: String,
        label: String,
    },
}

/// A chunk produced by the chunker, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub content: String,
    pub location: ChunkLocation,
    pub token_count: usize,
    /// SHA-256 of `content`, hex encoded.
    pub hash: String,
}

/// A persisted chunk. `embedding` is `None` while the chunk is pending.
#[derive(Debug, Clone)]
pub struct KnowledgeChunk {
    pub id: i64,
    pub source_id: i64,
    pub content: String,
    pub location: ChunkLocation,
    pub token_count: usize,
    pub hash: String,
    pub embedding: Option<Vec<f32>>,
}

impl KnowledgeChunk {
    pub fn is_pending(&self) -> bool {
        self.embedding.is_none()
    }
}

/// The slice of a pending chunk the embedding processor needs.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub id: i64,
    pub source_id: i64,
    pub content: String,
    pub token_count: usize,
}

/// How the bot came to be talking in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Mention,
    Thread,
    Eavesdrop,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Mention => "mention",
            SessionType::Thread => "thread",
            SessionType::Eavesdrop => "eavesdrop",
        }
    }
}

impl FromStr for SessionType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mention" => Ok(SessionType::Mention),
            "thread" => Ok(SessionType::Thread),
            "eavesdrop" => Ok(SessionType::Eavesdrop),
            other => Err(ParseLabelError::new("session type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Archived => "archived",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "archived" => Ok(SessionStatus::Archived),
            other => Err(ParseLabelError::new("session status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(ParseLabelError::new("role", other)),
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A conversation scope tracked by the bot.
///
/// Messages are append-only and kept in insertion order. Once `status` is
/// [`SessionStatus::Archived`] the session is read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    /// `<scope>:<id>`, e.g. `thread:1203`.
    pub session_key: String,
    pub session_type: SessionType,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub guild_id: Option<u64>,
    #[serde(default)]
    pub channel_id: Option<u64>,
    #[serde(default)]
    pub user_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl ChatSession {
    /// A fresh, empty, active session created at `now`.
    pub fn new(session_key: impl Into<String>, session_type: SessionType, now: DateTime<Utc>) -> Self {
        Self {
            session_key: session_key.into(),
            session_type,
            messages: Vec::new(),
            guild_id: None,
            channel_id: None,
            user_id: None,
            created_at: now,
            last_active_at: now,
            status: SessionStatus::Active,
        }
    }

    /// Append a message and bump `last_active_at`.
    pub fn push_message(&mut self, message: Message) {
        if message.timestamp > self.last_active_at {
            self.last_active_at = message.timestamp;
        }
        self.messages.push(message);
    }

    pub fn is_archived(&self) -> bool {
        self.status == SessionStatus::Archived
    }

    /// URI under which the archived transcript is stored as a source.
    pub fn source_uri(&self) -> String {
        format!("discord-session://{}", self.session_key)
    }
}

/// A ranked search hit. Transient, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarityResult {
    pub chunk_id: i64,
    pub source_id: i64,
    pub content: String,
    /// Normalized into `[0.0, 1.0]`.
    pub similarity: f64,
    pub source_metadata: serde_json::Value,
    pub source_type: SourceType,
    pub source_title: String,
    pub location: ChunkLocation,
}

/// Aggregate counts reported by `kb stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub sources: Vec<SourceTypeStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceTypeStats {
    pub source_type: SourceType,
    pub status: SourceStatus,
    pub source_count: i64,
    pub chunk_count: i64,
    pub embedded_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_labels_roundtrip_through_from_str() {
        for t in [SourceType::DiscordSession, SourceType::DocumentFile] {
            assert_eq!(t.as_str().parse::<SourceType>().unwrap(), t);
        }
        for s in [
            SourceStatus::Pending,
            SourceStatus::Completed,
            SourceStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<SourceStatus>().unwrap(), s);
        }
        assert!("webpage".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_push_message_bumps_last_active() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();
        let mut session = ChatSession::new("thread:1", SessionType::Thread, t0);
        session.push_message(Message {
            role: Role::User,
            content: "hi".into(),
            timestamp: t1,
        });
        assert_eq!(session.last_active_at, t1);
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.source_uri(), "discord-session://thread:1");
    }

    #[test]
    fn test_location_serializes_with_kind_tag() {
        let loc = ChunkLocation::Document {
            url: "file:///notes.md".into(),
            label: "notes §1".into(),
        };
        let json = serde_json::to_value(&loc).unwrap();
        assert_eq!(json["kind"], "document");
        let back: ChunkLocation = serde_json::from_value(json).unwrap();
        assert_eq!(back, loc);
    }
}
