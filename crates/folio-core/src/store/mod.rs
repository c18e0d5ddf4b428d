//! Vector store abstraction.
//!
//! A [`VectorStore`] holds one container's documents, chunks, and vectors.
//! Each container owns exactly one store; stores never share state.
//!
//! Writes are atomic per document: a concurrent reader observes a
//! document either entirely before or entirely after an
//! [`upsert`](VectorStore::upsert) or
//! [`delete_by_path`](VectorStore::delete_by_path), never a mix of old and
//! new chunks.

pub mod memory;

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::models::{Chunk, ChunkHit, DocumentRecord, DocumentStatus, Fingerprint, StoreStats};

/// Storage backend for one container.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorStore::upsert) | Replace a document and all its chunks |
/// | [`mark_status`](VectorStore::mark_status) | Record a failed or pending document, keeping its chunks |
/// | [`delete_by_path`](VectorStore::delete_by_path) | Remove a document and its chunks |
/// | [`nearest_k`](VectorStore::nearest_k) | Cosine-similarity k-NN over chunks |
/// | [`keyword_k`](VectorStore::keyword_k) | Term-match ranking over chunk text |
/// | [`stored_fingerprints`](VectorStore::stored_fingerprints) | Path → fingerprint map for delta computation |
/// | [`clear`](VectorStore::clear) | Drop every document and unpin the dimensionality |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace `doc` together with exactly `chunks`.
    ///
    /// Any chunks previously stored for the path are removed in the same
    /// atomic step. The first vectors ever written pin the store's
    /// dimensionality; later writes with another size fail with
    /// [`StoreError::DimensionMismatch`] unless no other document holds
    /// chunks.
    async fn upsert(&self, doc: &DocumentRecord, chunks: &[Chunk]) -> Result<(), StoreError>;

    /// Record that `path` could not be (re)indexed.
    ///
    /// Clears the stored fingerprint so the next pass retries the file.
    /// Existing chunks stay searchable. Creates a chunkless record if the
    /// path is not yet stored.
    async fn mark_status(
        &self,
        path: &Path,
        status: DocumentStatus,
        error: &str,
        model: &str,
    ) -> Result<(), StoreError>;

    /// Remove a document and its chunks. Returns whether anything was removed.
    async fn delete_by_path(&self, path: &Path) -> Result<bool, StoreError>;

    /// Up to `k` chunks ranked by cosine similarity to `query`.
    ///
    /// Ties are broken by most recent `indexed_at`, then path, then chunk
    /// index. With a `prefix`, only chunks whose path lies under it
    /// (component-wise) are considered.
    async fn nearest_k(
        &self,
        query: &[f32],
        k: usize,
        prefix: Option<&Path>,
    ) -> Result<Vec<ChunkHit>, StoreError>;

    /// Up to `k` chunks containing any of the terms of `query`, best match
    /// first. Scores are positive and only comparable within one call.
    ///
    /// `query` is plain text; see [`keyword_terms`] for how it is split.
    async fn keyword_k(
        &self,
        query: &str,
        k: usize,
        prefix: Option<&Path>,
    ) -> Result<Vec<ChunkHit>, StoreError>;

    /// Every stored path with its fingerprint; `None` for documents that
    /// are pending or failed.
    async fn stored_fingerprints(
        &self,
    ) -> Result<BTreeMap<PathBuf, Option<Fingerprint>>, StoreError>;

    /// Remove every document and chunk and forget the pinned
    /// dimensionality, in one atomic step.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Distinct embedding models of the documents that hold chunks.
    async fn models(&self) -> Result<Vec<String>, StoreError>;

    async fn get_document(&self, path: &Path) -> Result<Option<DocumentRecord>, StoreError>;

    /// Chunks of one document in chunk-index order.
    async fn get_chunks(&self, path: &Path) -> Result<Vec<Chunk>, StoreError>;

    /// All documents, ordered by path.
    async fn list_documents(&self) -> Result<Vec<DocumentRecord>, StoreError>;

    /// Number of document records, whatever their status.
    async fn document_count(&self) -> Result<usize, StoreError>;

    /// Pinned vector dimensionality, `None` until a vector is written.
    async fn dims(&self) -> Result<Option<usize>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Sort hits best-first with the store's deterministic tie-break.
pub fn rank_hits(hits: &mut [ChunkHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.indexed_at.cmp(&a.indexed_at))
            .then(a.path.cmp(&b.path))
            .then(a.chunk_index.cmp(&b.chunk_index))
    });
}

/// Whether `path` lies under `prefix`, compared component-wise
/// (`/data/p1` does not contain `/data/p10/a.txt`).
pub fn in_scope(path: &Path, prefix: Option<&Path>) -> bool {
    prefix.map_or(true, |p| path.starts_with(p))
}

/// Lowercased alphanumeric terms of a keyword query, deduplicated in
/// order of first appearance.
pub fn keyword_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in query.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let word = word.to_lowercase();
        if !terms.contains(&word) {
            terms.push(word);
        }
    }
    terms
}

/// Check that every chunk carries a vector of one size and return it.
pub fn chunk_dims(chunks: &[Chunk]) -> Result<Option<usize>, StoreError> {
    let Some(first) = chunks.first() else {
        return Ok(None);
    };
    let dims = first.vector.len();
    for c in chunks {
        if c.vector.len() != dims {
            return Err(StoreError::DimensionMismatch {
                expected: dims,
                actual: c.vector.len(),
            });
        }
    }
    Ok(Some(dims))
}
