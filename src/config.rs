//! Configuration parsing and validation.
//!
//! `kb` is configured with a single TOML file (default
//! `./config/kb.toml`):
//!
//! ```toml
//! [db]
//! path = "./data/kb.sqlite"
//!
//! [chunking]
//! max_tokens = 500
//!
//! [embedding]
//! provider = "openai"        # "disabled" | "openai" | "ollama"
//! model = "text-embedding-3-small"
//! dims = 1536
//! batch_size = 64
//! max_concurrent = 4
//! max_retries = 5
//! timeout_secs = 30
//!
//! [archive]
//! threshold_hours = 24
//! ```
//!
//! Only `[db]` is required. Everything else falls back to the defaults
//! above, with embeddings disabled.
//!
//! The OpenAI provider reads its key from `OPENAI_API_KEY`; `main` loads a
//! `.env` file first if one exists.

use anyhow::{bail, Context, Result};
use chat_kb_core::config::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// SQLite file; parent directories are created on first connect.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    500
}

/// Embedding provider settings.
///
/// `model` and `dims` are required for every provider except
/// `"disabled"`. `url` is only read by the Ollama provider.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_concurrent() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    /// Sessions idle for longer than this many hours are archived.
    #[serde(default = "default_threshold_hours")]
    pub threshold_hours: i64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            threshold_hours: default_threshold_hours(),
        }
    }
}

fn default_threshold_hours() -> i64 {
    24
}

impl Config {
    /// Pipeline tuning derived from this config.
    ///
    /// With embeddings disabled `dims` may be unset; the pipeline default
    /// is used, which only matters for dimension checks that never run.
    pub fn pipeline(&self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            batch_size: self.embedding.batch_size,
            max_concurrent: self.embedding.max_concurrent,
            embedding_dims: self.embedding.dims.unwrap_or(defaults.embedding_dims),
            archive_threshold_hours: self.archive.threshold_hours,
            max_tokens: self.chunking.max_tokens,
        }
    }
}

/// Read, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.max_concurrent == 0 {
        bail!("embedding.max_concurrent must be > 0");
    }
    if config.archive.threshold_hours <= 0 {
        bail!("archive.threshold_hours must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/kb.sqlite\"\n").unwrap();
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.chunking.max_tokens, 500);
        assert_eq!(config.archive.threshold_hours, 24);

        let pipeline = config.pipeline();
        assert_eq!(pipeline.batch_size, 64);
        assert_eq!(pipeline.max_concurrent, 4);
        assert_eq!(pipeline.page_size(), 256);
    }

    #[test]
    fn test_enabled_provider_needs_model_and_dims() {
        let err = parse(
            r#"
            [db]
            path = "kb.sqlite"
            [embedding]
            provider = "openai"
            model = "text-embedding-3-small"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));

        let ok = parse(
            r#"
            [db]
            path = "kb.sqlite"
            [embedding]
            provider = "ollama"
            model = "nomic-embed-text"
            dims = 768
            max_concurrent = 2
            "#,
        )
        .unwrap();
        assert_eq!(ok.pipeline().embedding_dims, 768);
        assert_eq!(ok.pipeline().max_concurrent, 2);
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse(include_str!("../config/kb.example.toml")).unwrap();
        assert_eq!(config.embedding.provider, "openai");
        assert_eq!(config.pipeline().embedding_dims, 1536);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse("[db]\npath = \"a\"\n[embedding]\nprovider = \"magic\"\n").is_err());
        assert!(parse("[db]\npath = \"a\"\n[embedding]\nmax_concurrent = 0\n").is_err());
        assert!(parse("[db]\npath = \"a\"\n[archive]\nthreshold_hours = 0\n").is_err());
        assert!(parse("[db]\npath = \"a\"\n[chunking]\nmax_tokens = 0\n").is_err());
    }
}
