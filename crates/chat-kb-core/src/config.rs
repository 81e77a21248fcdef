//! Pipeline tuning parameters, decoupled from application config.
//!
//! The application builds a [`PipelineConfig`] from its TOML file and
//! hands it to each component at construction.

use chrono::Duration;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Texts per provider call.
    pub batch_size: usize,
    /// Provider calls in flight at once.
    pub max_concurrent: usize,
    /// Required length of every stored and query vector.
    pub embedding_dims: usize,
    /// Sessions idle for longer than this are archived.
    pub archive_threshold_hours: i64,
    /// Approximate token budget per chunk.
    pub max_tokens: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_concurrent: 4,
            embedding_dims: 1536,
            archive_threshold_hours: 24,
            max_tokens: 500,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.max_concurrent == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_concurrent must be > 0".into(),
            ));
        }
        if self.embedding_dims == 0 {
            return Err(PipelineError::InvalidConfig(
                "embedding_dims must be > 0".into(),
            ));
        }
        if self.archive_threshold_hours <= 0 {
            return Err(PipelineError::InvalidConfig(
                "archive_threshold_hours must be > 0".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(PipelineError::InvalidConfig("max_tokens must be > 0".into()));
        }
        Ok(())
    }

    /// Number of pending chunks fetched per store round-trip: enough to
    /// keep every concurrency slot busy with a full batch.
    pub fn page_size(&self) -> usize {
        self.batch_size.saturating_mul(self.max_concurrent).max(1)
    }

    pub fn archive_threshold(&self) -> Duration {
        Duration::hours(self.archive_threshold_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_values_rejected() {
        let cfg = PipelineConfig {
            max_concurrent: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(PipelineError::InvalidConfig(_))));

        let cfg = PipelineConfig {
            archive_threshold_hours: 0,
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_page_size_covers_all_slots() {
        let cfg = PipelineConfig {
            batch_size: 8,
            max_concurrent: 3,
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.page_size(), 24);
    }
}
