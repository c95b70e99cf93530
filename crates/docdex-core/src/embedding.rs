//! Embedding provider trait and vector helpers.
//!
//! [`EmbeddingProvider`] is the seam between docdex and a model backend.
//! A provider embeds one batch per call and reports failures as
//! [`IndexError::TransientProvider`](crate::error::IndexError) (safe to
//! retry) or [`IndexError::Provider`](crate::error::IndexError) (not).
//! Batching, retries, timeouts and concurrency are layered on top by the
//! application, so implementations stay a thin client.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::EmbeddingStamp;

/// Result of embedding one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingBatch {
    /// One vector per input, in input order.
    pub vectors: Vec<Vec<f32>>,
    /// Tokens billed by the provider; zero when it does not report usage.
    pub tokens_used: u64,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded in the index (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Dimensionality of every vector this provider returns.
    fn dims(&self) -> usize;

    /// Embed a single batch. Must return exactly `texts.len()` vectors.
    async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch>;

    fn stamp(&self) -> EmbeddingStamp {
        EmbeddingStamp {
            model: self.model_name().to_string(),
            dims: self.dims(),
        }
    }
}

/// Rough token estimate (4 characters per token, rounded up).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Dollar cost of `tokens` at `price_per_1k` per thousand tokens.
pub fn estimate_cost(tokens: u64, price_per_1k: f64) -> f64 {
    tokens as f64 / 1000.0 * price_per_1k
}

/// Little-endian f32 bytes, 4 per dimension.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`vec_to_blob`]. Trailing bytes that do not form a full
/// float are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty, zero-norm or
/// mismatched-length inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (dot, na, nb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(d, x2, y2), (x, y)| {
            (d + x * y, x2 + x * x, y2 + y * y)
        });
    let denom = na.sqrt() * nb.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

/// Map cosine similarity onto a `[0, 1]` relevance score.
pub fn relevance_score(similarity: f32) -> f64 {
    ((1.0 + similarity as f64) / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_roundtrip() {
        let v = vec![0.5f32, -1.25, 3.0];
        let blob = vec_to_blob(&v);
        assert_eq!(blob.len(), 12);
        assert_eq!(blob_to_vec(&blob), v);
    }

    #[test]
    fn test_cosine_bounds() {
        let a = [1.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&a, &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &a), 0.0);
    }

    #[test]
    fn test_relevance_score_range() {
        assert_eq!(relevance_score(1.0), 1.0);
        assert_eq!(relevance_score(-1.0), 0.0);
        assert_eq!(relevance_score(0.0), 0.5);
    }

    #[test]
    fn test_estimates() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
        let cost = estimate_cost(50_000, 0.00002);
        assert!((cost - 0.001).abs() < 1e-12);
    }
}
