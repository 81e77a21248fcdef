//! # chat-kb CLI (`kb`)
//!
//! Operates the knowledge base behind the Discord bot: imports session
//! transcripts, archives idle sessions into searchable sources, ingests
//! documents, embeds pending chunks and runs similarity search.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and run schema migrations |
//! | `kb session import <file>` | Append a JSON transcript to the session store |
//! | `kb session list` | List sessions and their status |
//! | `kb archive` | Archive idle sessions, then embed their chunks |
//! | `kb ingest <path>` | Ingest a text/markdown file as a document source |
//! | `kb embed pending` | Embed every chunk without an embedding |
//! | `kb search "<query>"` | Top-k similarity search with metadata filters |
//! | `kb stats` | Source, chunk, embedding and session counts |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`); command
//! output goes to stdout.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chat_kb::{archive_cmd, config, embed_cmd, ingest, migrate, search, sessions, stats};
use chat_kb_core::models::SessionStatus;

#[derive(Parser)]
#[command(
    name = "kb",
    about = "chat-kb: archive Discord bot conversations into a vector-searchable knowledge base",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage chat sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Archive sessions idle for longer than `[archive].threshold_hours`.
    ///
    /// Each archived session becomes a `discord_session` source. When an
    /// embedding provider is configured the new chunks are embedded right
    /// away; otherwise they wait for `kb embed pending`.
    Archive {
        /// List the sessions that would be archived without changing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Ingest a text or markdown file as a `document_file` source.
    Ingest {
        path: PathBuf,

        /// Source title. Defaults to the file name without extension.
        #[arg(long)]
        title: Option<String>,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Similarity search over embedded chunks.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long, default_value_t = 10)]
        top_k: usize,

        /// Only return chunks from this source type (`discord_session`, `document_file`).
        #[arg(long)]
        source_type: Option<String>,

        /// Exact-match filter on source metadata, e.g. `--filter channel_id=111111`.
        /// May be repeated; all filters must match.
        #[arg(long = "filter")]
        filters: Vec<String>,
    },

    /// Show source, chunk, embedding and session counts.
    Stats,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Append messages from a JSON transcript file.
    Import { path: PathBuf },

    /// List sessions.
    List {
        /// Only show sessions with this status (`active` or `archived`).
        #[arg(long)]
        status: Option<SessionStatus>,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed every chunk that has no embedding yet.
    Pending {
        /// Override the batch size from config (texts per provider call).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Override the number of provider calls in flight.
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Show the pending count without calling the provider.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Session { action } => match action {
            SessionAction::Import { path } => sessions::run_import(&cfg, &path).await?,
            SessionAction::List { status } => sessions::run_list(&cfg, status).await?,
        },
        Commands::Archive { dry_run } => archive_cmd::run_archive(&cfg, dry_run).await?,
        Commands::Ingest { path, title } => ingest::run_ingest(&cfg, &path, title).await?,
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                batch_size,
                max_concurrent,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, batch_size, max_concurrent, dry_run).await?;
            }
        },
        Commands::Search {
            query,
            top_k,
            source_type,
            filters,
        } => search::run_search(&cfg, &query, top_k, source_type, &filters).await?,
        Commands::Stats => stats::run_stats(&cfg).await?,
    }

    Ok(())
}
