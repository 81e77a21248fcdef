//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] capability boundary plus pure helper
//! functions for vector serialization and similarity computation.
//!
//! Concrete provider implementations (OpenAI, Ollama) live in the `chat-kb`
//! app crate. Retrying belongs to those adapters; the pipeline treats any
//! error returned here as final for the current sweep.

use async_trait::async_trait;

use crate::error::ProviderError;

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Embed a single query text.
///
/// Convenience wrapper around [`EmbeddingProvider::embed`] for search queries.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> Result<Vec<f32>, ProviderError> {
    provider
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Permanent("empty embedding response".into()))
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use chat_kb_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Trailing bytes that do not form
/// a whole `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, zero-magnitude vectors and vectors with non-finite
/// components.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine(a, b) as f32
}

/// Accumulates in f64 so large components cannot overflow the norms.
fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if !denom.is_finite() || denom < f64::EPSILON {
        return 0.0;
    }

    let cos = dot / denom;
    if cos.is_finite() {
        cos.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Cosine similarity mapped onto `[0.0, 1.0]`: `(cos + 1) / 2`.
///
/// Orthogonal vectors score `0.5`, opposite vectors `0.0`. Never NaN.
pub fn normalized_similarity(a: &[f32], b: &[f32]) -> f64 {
    ((cosine(a, b) + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// True if every component is a finite number.
pub fn is_finite_vector(v: &[f32]) -> bool {
    v.iter().all(|x| x.is_finite())
}
