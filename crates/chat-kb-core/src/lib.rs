//! # chat-kb core
//!
//! Runtime-agnostic knowledge-base pipeline for a Discord bot: data models,
//! chunking, store traits, the embedding processor, the session archiver,
//! document ingest and similarity search.
//!
//! This crate contains no tokio, sqlx, HTTP client or filesystem I/O.
//! Storage and embedding providers come in through the
//! [`store::KnowledgeStore`], [`store::SessionStore`] and
//! [`embedding::EmbeddingProvider`] traits; the `chat-kb` crate supplies the
//! SQLite and HTTP implementations.
//!
//! ```text
//! SessionArchiver ──▶ chunk ──▶ KnowledgeStore ◀── EmbeddingProcessor ──▶ EmbeddingProvider
//!                                     ▲
//!                          similarity_search
//! ```

pub mod archiver;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod models;
pub mod processor;
pub mod search;
pub mod store;

pub use archiver::{ArchiveReport, SessionArchiver};
pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult, ProviderError};
pub use processor::{EmbeddingProcessor, EmbeddingReport};
pub use search::{similarity_search, SearchFilters};
