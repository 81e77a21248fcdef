//! # chat-kb
//!
//! SQLite storage, HTTP embedding providers and CLI commands around the
//! [`chat_kb_core`] pipeline.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌───────────────┐
//! │ chat_sessions│──▶│ SessionArchiver  │──▶│ knowledge_*   │
//! │  (SQLite)    │   │ chunk + persist  │   │   (SQLite)    │
//! └──────────────┘   └──────────────────┘   └──────┬────────┘
//!                                                  │ pending chunks
//!                    ┌──────────────────┐          ▼
//!                    │ OpenAI / Ollama  │◀── EmbeddingProcessor
//!                    └──────────────────┘
//! ```
//!
//! - [`sqlite_store::SqliteStore`] implements both core store traits.
//! - [`embedding`] provides the HTTP providers and their retry policy.
//! - The `*_cmd`, [`ingest`], [`search`], [`sessions`] and [`stats`]
//!   modules back the `kb` subcommands.

pub mod archive_cmd;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod ingest;
pub mod migrate;
pub mod search;
pub mod sessions;
pub mod sqlite_store;
pub mod stats;
