//! Similarity search over embedded chunks.
//!
//! The ranking contract is shared by every [`KnowledgeStore`] backend:
//!
//! 1. Skip chunks without an embedding.
//! 2. Keep chunks whose source satisfies every [`SearchFilters`] clause.
//! 3. Score with cosine similarity mapped onto `[0, 1]`.
//! 4. Sort by score (desc), chunk id (asc).
//! 5. Truncate to `top_k`.
//!
//! Backends implement steps 1–3 however suits them and finish with
//! [`rank_results`]. [`similarity_search`] is the entry point callers use;
//! it checks preconditions and re-asserts the ordering and bounds.

use serde_json::{Map, Value};

use crate::config::PipelineConfig;
use crate::embedding::is_finite_vector;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{SimilarityResult, SourceType};
use crate::store::KnowledgeStore;

/// AND-combined filter over a chunk's source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub source_type: Option<SourceType>,
    /// Exact-match clauses against top-level keys of the source metadata.
    pub metadata: Map<String, Value>,
}

impl SearchFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = Some(source_type);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build filters from a flat JSON object such as
    /// `{"source_type": "discord_session", "channel_id": 111111}`.
    ///
    /// `source_type` is lifted into its own clause; every other key becomes
    /// a metadata clause.
    pub fn from_json(value: &Value) -> PipelineResult<Self> {
        let obj = value.as_object().ok_or_else(|| {
            PipelineError::InvalidConfig("search filters must be a JSON object".into())
        })?;

        let mut filters = Self::new();
        for (key, v) in obj {
            if key == "source_type" {
                let label = v.as_str().ok_or_else(|| {
                    PipelineError::InvalidConfig("source_type filter must be a string".into())
                })?;
                let parsed = label
                    .parse::<SourceType>()
                    .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
                filters.source_type = Some(parsed);
            } else {
                filters.metadata.insert(key.clone(), v.clone());
            }
        }
        Ok(filters)
    }

    pub fn is_empty(&self) -> bool {
        self.source_type.is_none() && self.metadata.is_empty()
    }

    pub fn matches(&self, source_type: SourceType, metadata: &Value) -> bool {
        if let Some(wanted) = self.source_type {
            if wanted != source_type {
                return false;
            }
        }
        self.metadata.iter().all(|(key, wanted)| {
            metadata
                .get(key)
                .is_some_and(|stored| values_match(stored, wanted))
        })
    }
}

/// Exact equality, except that a number and a string holding the same
/// digits compare equal. Discord snowflakes show up both ways.
fn values_match(stored: &Value, wanted: &Value) -> bool {
    match (stored, wanted) {
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        _ => stored == wanted,
    }
}

/// Sort by similarity descending, break ties by chunk id, truncate.
pub fn rank_results(mut results: Vec<SimilarityResult>, top_k: usize) -> Vec<SimilarityResult> {
    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(top_k);
    results
}

/// Run a filtered top-k similarity search against a [`KnowledgeStore`].
///
/// # Errors
///
/// - [`PipelineError::DimensionMismatch`] if `query_embedding` does not
///   have the configured dimension.
/// - [`PipelineError::NonFiniteEmbedding`] if it contains NaN or infinity.
/// - [`PipelineError::Store`] if the backend fails.
pub async fn similarity_search<S: KnowledgeStore + ?Sized>(
    store: &S,
    config: &PipelineConfig,
    query_embedding: &[f32],
    top_k: usize,
    filters: &SearchFilters,
) -> PipelineResult<Vec<SimilarityResult>> {
    if query_embedding.len() != config.embedding_dims {
        return Err(PipelineError::DimensionMismatch {
            expected: config.embedding_dims,
            actual: query_embedding.len(),
        });
    }
    if !is_finite_vector(query_embedding) {
        return Err(PipelineError::NonFiniteEmbedding);
    }
    if top_k == 0 {
        return Ok(Vec::new());
    }

    let mut results = store
        .similarity_search(query_embedding, top_k, filters)
        .await?;

    for r in &mut results {
        r.similarity = if r.similarity.is_nan() {
            0.5
        } else {
            r.similarity.clamp(0.0, 1.0)
        };
    }

    tracing::debug!(
        top_k,
        returned = results.len(),
        filtered = !filters.is_empty(),
        "similarity search"
    );

    Ok(rank_results(results, top_k))
}
