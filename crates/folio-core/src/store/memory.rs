//! In-memory [`VectorStore`] for tests and ephemeral containers.
//!
//! All state sits behind one `std::sync::RwLock`, so every write swaps a
//! whole document entry at once. Vector search is brute-force cosine
//! similarity; keyword search counts matching terms.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::StoreError;
use crate::models::{
    now_millis, Chunk, ChunkHit, DocumentRecord, DocumentStatus, Fingerprint, StoreStats,
};

use super::{chunk_dims, in_scope, keyword_terms, rank_hits, VectorStore};

struct StoredDoc {
    record: DocumentRecord,
    chunks: Vec<Chunk>,
}

#[derive(Default)]
struct State {
    docs: BTreeMap<PathBuf, StoredDoc>,
    dims: Option<usize>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    mutations: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful mutating calls since creation.
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Corrupted("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Corrupted("store lock poisoned".to_string()))
    }

    fn bump(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn upsert(&self, doc: &DocumentRecord, chunks: &[Chunk]) -> Result<(), StoreError> {
        let dims = chunk_dims(chunks)?;
        let mut state = self.write()?;

        if let (Some(new), Some(pinned)) = (dims, state.dims) {
            if new != pinned {
                let others_hold_chunks = state
                    .docs
                    .iter()
                    .any(|(p, d)| p != &doc.path && !d.chunks.is_empty());
                if others_hold_chunks {
                    return Err(StoreError::DimensionMismatch {
                        expected: pinned,
                        actual: new,
                    });
                }
            }
        }
        if dims.is_some() {
            state.dims = dims;
        }

        let mut record = doc.clone();
        record.chunk_ids = chunks.iter().map(|c| c.id.clone()).collect();
        state.docs.insert(
            doc.path.clone(),
            StoredDoc {
                record,
                chunks: chunks.to_vec(),
            },
        );
        drop(state);
        self.bump();
        Ok(())
    }

    async fn mark_status(
        &self,
        path: &Path,
        status: DocumentStatus,
        error: &str,
        model: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        match state.docs.get_mut(path) {
            Some(stored) => {
                stored.record.fingerprint = None;
                stored.record.status = status;
                stored.record.error = Some(error.to_string());
            }
            None => {
                state.docs.insert(
                    path.to_path_buf(),
                    StoredDoc {
                        record: DocumentRecord {
                            path: path.to_path_buf(),
                            fingerprint: None,
                            status,
                            error: Some(error.to_string()),
                            chunk_ids: Vec::new(),
                            indexed_at: now_millis(),
                            model: model.to_string(),
                        },
                        chunks: Vec::new(),
                    },
                );
            }
        }
        drop(state);
        self.bump();
        Ok(())
    }

    async fn delete_by_path(&self, path: &Path) -> Result<bool, StoreError> {
        let removed = self.write()?.docs.remove(path).is_some();
        if removed {
            self.bump();
        }
        Ok(removed)
    }

    async fn nearest_k(
        &self,
        query: &[f32],
        k: usize,
        prefix: Option<&Path>,
    ) -> Result<Vec<ChunkHit>, StoreError> {
        let state = self.read()?;
        let mut hits: Vec<ChunkHit> = state
            .docs
            .values()
            .filter(|d| in_scope(&d.record.path, prefix))
            .flat_map(|d| {
                d.chunks.iter().map(move |c| ChunkHit {
                    path: c.path.clone(),
                    chunk_index: c.chunk_index,
                    start: c.start,
                    end: c.end,
                    text: c.text.clone(),
                    score: cosine_similarity(query, &c.vector),
                    indexed_at: d.record.indexed_at,
                })
            })
            .collect();
        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn keyword_k(
        &self,
        query: &str,
        k: usize,
        prefix: Option<&Path>,
    ) -> Result<Vec<ChunkHit>, StoreError> {
        let terms = keyword_terms(query);
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let state = self.read()?;
        let mut hits = Vec::new();
        for d in state.docs.values() {
            if !in_scope(&d.record.path, prefix) {
                continue;
            }
            for c in &d.chunks {
                let matches = keyword_terms(&c.text)
                    .iter()
                    .filter(|t| terms.contains(t))
                    .count();
                if matches == 0 {
                    continue;
                }
                hits.push(ChunkHit {
                    path: c.path.clone(),
                    chunk_index: c.chunk_index,
                    start: c.start,
                    end: c.end,
                    text: c.text.clone(),
                    score: matches as f32,
                    indexed_at: d.record.indexed_at,
                });
            }
        }
        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn stored_fingerprints(
        &self,
    ) -> Result<BTreeMap<PathBuf, Option<Fingerprint>>, StoreError> {
        let state = self.read()?;
        Ok(state
            .docs
            .iter()
            .map(|(p, d)| (p.clone(), d.record.fingerprint.clone()))
            .collect())
    }

    async fn get_document(&self, path: &Path) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.read()?.docs.get(path).map(|d| d.record.clone()))
    }

    async fn get_chunks(&self, path: &Path) -> Result<Vec<Chunk>, StoreError> {
        Ok(self
            .read()?
            .docs
            .get(path)
            .map(|d| d.chunks.clone())
            .unwrap_or_default())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        Ok(self
            .read()?
            .docs
            .values()
            .map(|d| d.record.clone())
            .collect())
    }

    async fn document_count(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.docs.len())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.docs.clear();
        state.dims = None;
        drop(state);
        self.bump();
        Ok(())
    }

    async fn models(&self) -> Result<Vec<String>, StoreError> {
        let state = self.read()?;
        let mut models: Vec<String> = state
            .docs
            .values()
            .filter(|d| !d.chunks.is_empty())
            .map(|d| d.record.model.clone())
            .collect();
        models.sort();
        models.dedup();
        Ok(models)
    }

    async fn dims(&self) -> Result<Option<usize>, StoreError> {
        Ok(self.read()?.dims)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.read()?;
        let mut stats = StoreStats {
            dims: state.dims,
            ..StoreStats::default()
        };
        let mut latest = i64::MIN;
        for d in state.docs.values() {
            stats.documents += 1;
            stats.chunks += d.chunks.len();
            match d.record.status {
                DocumentStatus::Indexed => stats.indexed += 1,
                DocumentStatus::Pending => stats.pending += 1,
                DocumentStatus::Failed => stats.failed += 1,
            }
            if d.record.status == DocumentStatus::Indexed && d.record.indexed_at >= latest {
                latest = d.record.indexed_at;
                stats.model = Some(d.record.model.clone());
            }
        }
        Ok(stats)
    }
}
