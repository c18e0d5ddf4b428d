//! Embedder trait and vector utilities.
//!
//! Defines the [`Embedder`] trait every embedding backend implements, the
//! offline [`HashEmbedder`], and pure helpers for vector serialization and
//! similarity.
//!
//! Network and model-backed providers (OpenAI, Ollama, fastembed) live in
//! the `folio` app crate.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::EmbeddingError;

/// A black-box text → vector function with a fixed output size.
///
/// Implementations are shared across concurrent indexing jobs and search
/// requests, so they must be `Send + Sync`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a passage of document text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a search query. Models with asymmetric query/passage
    /// encodings override this.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(text).await
    }

    /// Embed several passages, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Deterministic feature-hashing embedder.
///
/// Lowercases the text, splits it into alphanumeric tokens, and hashes
/// each token into one of `dims` buckets. The bag-of-words vector is
/// L2-normalized, so cosine similarity reflects shared vocabulary. Needs
/// no model and no network.
pub struct HashEmbedder {
    dims: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            model: format!("hash-{}", dims),
        }
    }

    /// Synchronous core of [`Embedder::embed`].
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        let lower = text.to_lowercase();
        for token in lower.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            vec[idx] += 1.0;
        }
        normalize(&mut vec);
        vec
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_text(text))
    }
}

/// Scale `vec` to unit length in place. Zero vectors are left untouched.
pub fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use folio_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_hash_embedder_dims_and_norm() {
        let e = HashEmbedder::new(64);
        assert_eq!(e.dims(), 64);
        assert_eq!(e.model_name(), "hash-64");
        let v = e.embed_text("The quick brown fox");
        assert_eq!(v.len(), 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_deterministic_and_case_insensitive() {
        let e = HashEmbedder::new(128);
        assert_eq!(e.embed_text("Rust Cargo"), e.embed_text("rust, cargo!"));
    }

    #[test]
    fn test_hash_embedder_shared_vocabulary_scores_higher() {
        let e = HashEmbedder::new(256);
        let query = e.embed_text("rust cargo crates");
        let close = e.embed_text("notes about rust and cargo crates");
        let far = e.embed_text("python machine learning notebooks");
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_hash_embedder_empty_text_is_zero() {
        let e = HashEmbedder::new(8);
        assert!(e.embed_text("  ...  ").iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_default_embed_batch_preserves_order() {
        let e = HashEmbedder::new(32);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let out = e.embed_batch(&texts).await.unwrap();
        assert_eq!(out[0], e.embed_text("alpha"));
        assert_eq!(out[1], e.embed_text("beta"));
    }
}
