//! `kb session import` and `kb session list`.
//!
//! Import reads a JSON transcript (one session object or an array of them)
//! and appends each message through [`SessionStore::append_message`], the
//! same path the bot uses on every turn:
//!
//! ```json
//! {
//!   "session_key": "thread:1203",
//!   "session_type": "thread",
//!   "guild_id": 42,
//!   "channel_id": 111111,
//!   "messages": [
//!     { "role": "user", "content": "hi", "timestamp": "2024-06-01T12:00:00Z" }
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use std::path::Path;

use chat_kb_core::models::{ChatSession, Message, SessionStatus, SessionType};
use chat_kb_core::store::SessionStore;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Deserialize)]
pub struct SessionImport {
    pub session_key: String,
    pub session_type: SessionType,
    #[serde(default)]
    pub guild_id: Option<u64>,
    #[serde(default)]
    pub channel_id: Option<u64>,
    #[serde(default)]
    pub user_id: Option<u64>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImportFile {
    Many(Vec<SessionImport>),
    One(SessionImport),
}

impl SessionImport {
    /// The session as it looks before its first message.
    fn template(&self) -> ChatSession {
        let started = self
            .messages
            .first()
            .map(|m| m.timestamp)
            .unwrap_or_else(Utc::now);
        let mut session = ChatSession::new(self.session_key.clone(), self.session_type, started);
        session.guild_id = self.guild_id;
        session.channel_id = self.channel_id;
        session.user_id = self.user_id;
        session
    }
}

/// Parse an import file's contents.
pub fn parse_import(content: &str) -> Result<Vec<SessionImport>> {
    let parsed: ImportFile =
        serde_json::from_str(content).context("Invalid session transcript JSON")?;
    Ok(match parsed {
        ImportFile::Many(sessions) => sessions,
        ImportFile::One(session) => vec![session],
    })
}

/// Append every imported message to the store. Returns the number of
/// messages written.
pub async fn import_sessions(store: &dyn SessionStore, sessions: &[SessionImport]) -> Result<usize> {
    let mut written = 0;
    for import in sessions {
        let template = import.template();
        for message in &import.messages {
            store
                .append_message(&template, message)
                .await
                .with_context(|| format!("Failed to append to session {}", import.session_key))?;
            written += 1;
        }
        if import.messages.is_empty() && store.load_session(&import.session_key).await?.is_none() {
            store.save_session(&template).await?;
        }
    }
    Ok(written)
}

pub async fn run_import(config: &Config, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let sessions = parse_import(&content)?;

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let written = import_sessions(&store, &sessions).await?;

    println!("session import {}", path.display());
    println!("  sessions: {}", sessions.len());
    println!("  messages appended: {}", written);
    println!("ok");
    Ok(())
}

pub async fn run_list(config: &Config, status: Option<SessionStatus>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let sessions = store.list_sessions(status).await?;

    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    println!(
        "{:<28} {:<10} {:<9} {:>8}  LAST ACTIVE",
        "SESSION", "TYPE", "STATUS", "MESSAGES"
    );
    for s in &sessions {
        println!(
            "{:<28} {:<10} {:<9} {:>8}  {}",
            s.session_key,
            s.session_type.as_str(),
            s.status.as_str(),
            s.messages.len(),
            s.last_active_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
