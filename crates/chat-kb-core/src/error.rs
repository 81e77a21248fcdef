//! Error types for the knowledge pipeline.
//!
//! [`ProviderError`] is the closed set of failures an embedding adapter may
//! report; the pipeline only ever branches on its variant, never on the
//! underlying HTTP or SDK error. [`PipelineError`] is what the processor,
//! archiver and search return to their callers.

use thiserror::Error;

/// Classified failure from an embedding provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Rate limits, timeouts, 5xx, dropped connections. Worth trying again
    /// on the next sweep.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Auth failures, rejected input, malformed responses, disabled
    /// provider. Retrying will not help until configuration changes.
    #[error("permanent provider error: {0}")]
    Permanent(String),
    #[error("provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderError::Permanent(_))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding has non-finite components")]
    NonFiniteEmbedding,

    #[error("all {failed} embedding batches failed; last error: {last}")]
    AllBatchesFailed { failed: usize, last: ProviderError },

    #[error("all {failed} due sessions failed to archive")]
    AllSessionsFailed { failed: usize },

    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
