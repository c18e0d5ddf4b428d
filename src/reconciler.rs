//! Index reconciliation.
//!
//! Brings one container's store in line with its roots on disk:
//!
//! ```text
//! scan roots ──▶ live fingerprints ─┐
//!                                   ├─▶ compute_delta ─▶ deletes, then adds/updates
//! store ──▶ stored fingerprints ────┘                    (path order, one document at a time)
//! ```
//!
//! Each write is extract → chunk → embed → upsert, and the upsert carries
//! the new fingerprint in the same transaction as the chunks. A pass that
//! stops early, by cancellation or crash, leaves every document either at
//! its old or its new state, and the next pass derives only what is left.
//!
//! Per-file failures are recorded on the document and never abort the
//! pass: extraction failures mark it `failed`, embedding failures mark it
//! `pending`. Store failures are container-level and end the pass.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use folio_core::chunk::{chunk_text, make_chunk};
use folio_core::embedding::Embedder;
use folio_core::error::{ExtractionError, FolioError, Result};
use folio_core::extract::ContentExtractor;
use folio_core::models::{now_millis, DocumentRecord, DocumentStatus, Fingerprint};
use folio_core::reconcile::{compute_delta, DeltaMode};
use folio_core::store::VectorStore;

use crate::config::ChunkingConfig;
use crate::progress::{IndexProgressEvent, IndexProgressReporter};
use crate::scanner::{FileScanner, ScanEntry};

/// Chunks sent to the embedder per request.
const EMBED_BATCH: usize = 32;

/// Cooperative cancellation flag shared between a job and its owner.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct IndexReport {
    pub container: String,
    pub rebuild: bool,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Files passed over by the ignore policy (too large, unsupported).
    pub skipped: usize,
    /// Extraction failures.
    pub failed: usize,
    /// Embedding failures, retried next pass.
    pub pending: usize,
    /// Files that could not be fingerprinted.
    pub scan_errors: usize,
    pub unreachable_roots: Vec<PathBuf>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl IndexReport {
    /// Documents whose stored state changed.
    pub fn changed(&self) -> usize {
        self.added + self.updated + self.deleted + self.failed + self.pending
    }
}

/// Result of reconciling a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOutcome {
    Unchanged,
    Indexed,
    Failed,
    Pending,
    /// Documents removed (a deleted directory removes everything under it).
    Deleted(usize),
    /// Outside every root, or dropped by the ignore policy and not stored.
    Ignored,
    /// A directory appeared; only a full pass picks up its contents.
    Rescan,
}

enum WriteOutcome {
    Indexed,
    Failed,
    Pending,
}

/// Applies deltas to one container's store.
pub struct Reconciler {
    container: String,
    store: Arc<dyn VectorStore>,
    scanner: FileScanner,
    extractor: Arc<dyn ContentExtractor>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    extract_timeout: Duration,
    progress: Arc<dyn IndexProgressReporter>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        container: impl Into<String>,
        store: Arc<dyn VectorStore>,
        scanner: FileScanner,
        extractor: Arc<dyn ContentExtractor>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkingConfig,
        extract_timeout: Duration,
        progress: Arc<dyn IndexProgressReporter>,
    ) -> Self {
        Self {
            container: container.into(),
            store,
            scanner,
            extractor,
            embedder,
            chunking,
            extract_timeout,
            progress,
        }
    }

    fn store_err(&self, e: folio_core::error::StoreError) -> FolioError {
        FolioError::from_store(&self.container, e)
    }

    /// Run one full pass over `roots`.
    pub async fn run(
        &self,
        roots: &[PathBuf],
        mode: DeltaMode,
        cancel: &CancelToken,
    ) -> Result<IndexReport> {
        let started = Instant::now();
        let mut report = IndexReport {
            container: self.container.clone(),
            rebuild: mode == DeltaMode::Rebuild,
            ..IndexReport::default()
        };

        self.progress.report(IndexProgressEvent::Scanning {
            container: self.container.clone(),
        });

        let scanner = self.scanner.clone();
        let scan_roots = roots.to_vec();
        let entries =
            tokio::task::spawn_blocking(move || scanner.scan(&scan_roots).collect::<Vec<_>>())
                .await
                .map_err(|e| FolioError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let mut live: BTreeMap<PathBuf, Fingerprint> = BTreeMap::new();
        let mut preserved: Vec<PathBuf> = Vec::new();
        for entry in entries {
            match entry {
                ScanEntry::File { path, fingerprint } => {
                    live.insert(path, fingerprint);
                }
                ScanEntry::Skipped { path, reason } => {
                    debug!(container = %self.container, path = %path.display(), %reason, "skipped");
                    report.skipped += 1;
                }
                ScanEntry::Error { path, message } => {
                    warn!(
                        container = %self.container,
                        path = %path.display(),
                        error = %message,
                        "scan error"
                    );
                    report.scan_errors += 1;
                    preserved.push(path);
                }
                ScanEntry::RootUnavailable { root, message } => {
                    warn!(
                        container = %self.container,
                        root = %root.display(),
                        error = %message,
                        "root unavailable, keeping its documents"
                    );
                    preserved.push(root.clone());
                    report.unreachable_roots.push(root);
                }
            }
        }

        let stored = self
            .store
            .stored_fingerprints()
            .await
            .map_err(|e| self.store_err(e))?;
        let delta = compute_delta(&live, &stored, mode, &preserved);
        report.unchanged = delta.unchanged;

        info!(
            container = %self.container,
            add = delta.added.len(),
            update = delta.updated.len(),
            delete = delta.deleted.len(),
            unchanged = delta.unchanged,
            "delta computed"
        );

        let total = delta.len() as u64;
        let mut n = 0u64;
        let added: std::collections::HashSet<&PathBuf> =
            delta.added.iter().map(|(p, _)| p).collect();

        for path in &delta.deleted {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            n += 1;
            self.report_applying(n, total, path);
            if self
                .store
                .delete_by_path(path)
                .await
                .map_err(|e| self.store_err(e))?
            {
                debug!(container = %self.container, path = %path.display(), "deleted");
                report.deleted += 1;
            }
        }

        if !report.cancelled {
            for (path, fingerprint) in delta.writes() {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                n += 1;
                self.report_applying(n, total, &path);
                match self.write_document(&path, fingerprint).await? {
                    WriteOutcome::Indexed if added.contains(&path) => report.added += 1,
                    WriteOutcome::Indexed => report.updated += 1,
                    WriteOutcome::Failed => report.failed += 1,
                    WriteOutcome::Pending => report.pending += 1,
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.progress.report(IndexProgressEvent::Finished {
            container: self.container.clone(),
            changed: report.changed() as u64,
            cancelled: report.cancelled,
        });
        info!(
            container = %self.container,
            added = report.added,
            updated = report.updated,
            deleted = report.deleted,
            failed = report.failed,
            pending = report.pending,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "index pass finished"
        );
        Ok(report)
    }

    fn report_applying(&self, n: u64, total: u64, path: &Path) {
        self.progress.report(IndexProgressEvent::Applying {
            container: self.container.clone(),
            n,
            total,
            path: path.to_path_buf(),
        });
    }

    /// Reconcile one path reported by a filesystem event.
    pub async fn reconcile_path(&self, roots: &[PathBuf], path: &Path) -> Result<PathOutcome> {
        let path = normalize_event_path(path);
        let Some(root) = roots.iter().find(|r| path.starts_with(r)) else {
            return Ok(PathOutcome::Ignored);
        };

        if path.is_dir() {
            return Ok(PathOutcome::Rescan);
        }

        if !path.exists() {
            let stored = self
                .store
                .stored_fingerprints()
                .await
                .map_err(|e| self.store_err(e))?;
            let mut removed = 0;
            for doc in stored.keys().filter(|p| p.starts_with(&path)) {
                if self
                    .store
                    .delete_by_path(doc)
                    .await
                    .map_err(|e| self.store_err(e))?
                {
                    removed += 1;
                }
            }
            debug!(container = %self.container, path = %path.display(), removed, "path removed");
            return Ok(if removed > 0 {
                PathOutcome::Deleted(removed)
            } else {
                PathOutcome::Ignored
            });
        }

        let scanner = self.scanner.clone();
        let (scan_root, scan_path) = (root.clone(), path.clone());
        let entry = tokio::task::spawn_blocking(move || scanner.scan_one(&scan_root, &scan_path))
            .await
            .map_err(|e| FolioError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        match entry {
            Some(ScanEntry::File { fingerprint, .. }) => {
                let stored = self
                    .store
                    .get_document(&path)
                    .await
                    .map_err(|e| self.store_err(e))?;
                if stored.and_then(|d| d.fingerprint).as_ref() == Some(&fingerprint) {
                    return Ok(PathOutcome::Unchanged);
                }
                Ok(match self.write_document(&path, fingerprint).await? {
                    WriteOutcome::Indexed => PathOutcome::Indexed,
                    WriteOutcome::Failed => PathOutcome::Failed,
                    WriteOutcome::Pending => PathOutcome::Pending,
                })
            }
            Some(ScanEntry::Error { message, .. }) => {
                warn!(
                    container = %self.container,
                    path = %path.display(),
                    error = %message,
                    "scan error"
                );
                Ok(PathOutcome::Unchanged)
            }
            Some(ScanEntry::Skipped { .. }) | Some(ScanEntry::RootUnavailable { .. }) | None => {
                let removed = self
                    .store
                    .delete_by_path(&path)
                    .await
                    .map_err(|e| self.store_err(e))?;
                Ok(if removed {
                    PathOutcome::Deleted(1)
                } else {
                    PathOutcome::Ignored
                })
            }
        }
    }

    /// Extract, chunk, embed, and upsert one document.
    async fn write_document(&self, path: &Path, fingerprint: Fingerprint) -> Result<WriteOutcome> {
        let model = self.embedder.model_name().to_string();

        let text = match tokio::time::timeout(self.extract_timeout, self.extractor.extract(path))
            .await
            .unwrap_or(Err(ExtractionError::Timeout(self.extract_timeout)))
        {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    container = %self.container,
                    path = %path.display(),
                    error = %e,
                    "extraction failed"
                );
                self.store
                    .mark_status(path, DocumentStatus::Failed, &e.to_string(), &model)
                    .await
                    .map_err(|e| self.store_err(e))?;
                return Ok(WriteOutcome::Failed);
            }
        };

        let cfg = self.chunking.for_path(path);
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let spans = chunk_text(&text, &ext, cfg, self.chunking.strategy);

        let mut vectors = Vec::with_capacity(spans.len());
        for batch in spans.chunks(EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|s| s.text.to_string()).collect();
            match self.embedder.embed_batch(&texts).await {
                Ok(v) => vectors.extend(v),
                Err(e) => {
                    warn!(
                        container = %self.container,
                        path = %path.display(),
                        error = %e,
                        "embedding failed, document pending"
                    );
                    self.store
                        .mark_status(path, DocumentStatus::Pending, &e.to_string(), &model)
                        .await
                        .map_err(|e| self.store_err(e))?;
                    return Ok(WriteOutcome::Pending);
                }
            }
        }

        let chunks: Vec<_> = spans
            .iter()
            .zip(vectors)
            .map(|(span, vector)| make_chunk(path, span, vector))
            .collect();

        let record = DocumentRecord {
            path: path.to_path_buf(),
            fingerprint: Some(fingerprint),
            status: DocumentStatus::Indexed,
            error: None,
            chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
            indexed_at: now_millis(),
            model,
        };
        self.store
            .upsert(&record, &chunks)
            .await
            .map_err(|e| self.store_err(e))?;

        debug!(
            container = %self.container,
            path = %path.display(),
            chunks = chunks.len(),
            "indexed"
        );
        Ok(WriteOutcome::Indexed)
    }
}

/// Canonicalize an event path, falling back to the canonical parent for
/// paths that no longer exist.
fn normalize_event_path(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::FileExtractor;
    use crate::progress::NoProgress;
    use crate::scanner::ScanPolicy;
    use folio_core::embedding::HashEmbedder;
    use folio_core::store::memory::InMemoryStore;
    use std::fs;
    use tempfile::TempDir;

    fn reconciler(store: Arc<InMemoryStore>) -> Reconciler {
        let extractor: Arc<dyn ContentExtractor> = Arc::new(FileExtractor::default());
        let policy = ScanPolicy::from_config(&crate::config::ScannerConfig::default()).unwrap();
        Reconciler::new(
            "test",
            store,
            FileScanner::new(policy, extractor.clone()),
            extractor,
            Arc::new(HashEmbedder::new(32)),
            ChunkingConfig::default(),
            Duration::from_secs(5),
            Arc::new(NoProgress),
        )
    }

    fn root(dir: &TempDir) -> PathBuf {
        dir.path().canonicalize().unwrap()
    }

    #[tokio::test]
    async fn test_first_pass_adds_everything() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        fs::write(dir.path().join("b.md"), "beta").unwrap();
        fs::write(dir.path().join("c.bin"), "gamma").unwrap();

        let store = Arc::new(InMemoryStore::new());
        let report = reconciler(store.clone())
            .run(&[root(&dir)], DeltaMode::Incremental, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.added, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.document_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        let store = Arc::new(InMemoryStore::new());
        let r = reconciler(store.clone());
        r.run(&[root(&dir)], DeltaMode::Incremental, &CancelToken::new())
            .await
            .unwrap();
        let before = store.mutations();

        let report = r
            .run(&[root(&dir)], DeltaMode::Incremental, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.changed(), 0);
        assert_eq!(report.unchanged, 1);
        assert_eq!(store.mutations(), before);
    }

    #[tokio::test]
    async fn test_semantic_strategy_cuts_at_headings() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.md"), "# One\nalpha line\n# Two\nbeta line\n").unwrap();
        let store = Arc::new(InMemoryStore::new());
        let mut r = reconciler(store.clone());
        r.chunking = ChunkingConfig {
            strategy: folio_core::chunk::ChunkStrategy::Semantic,
            max_bytes: Some(20),
            overlap_bytes: Some(4),
        };
        r.run(&[root(&dir)], DeltaMode::Incremental, &CancelToken::new())
            .await
            .unwrap();

        let doc = store
            .get_document(&root(&dir).join("a.md"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.chunk_ids.len(), 2);
        let hits = store.keyword_k("beta", 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "# Two\nbeta line\n");
    }

    #[tokio::test]
    async fn test_empty_file_indexed_without_chunks() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("empty.txt"), "   \n").unwrap();
        let store = Arc::new(InMemoryStore::new());
        reconciler(store.clone())
            .run(&[root(&dir)], DeltaMode::Incremental, &CancelToken::new())
            .await
            .unwrap();
        let doc = store
            .get_document(&root(&dir).join("empty.txt"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
        assert!(doc.chunk_ids.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_applies_nothing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        let store = Arc::new(InMemoryStore::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = reconciler(store.clone())
            .run(&[root(&dir)], DeltaMode::Incremental, &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(store.document_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_path_lifecycle() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);
        let file = root.join("note.md");
        let store = Arc::new(InMemoryStore::new());
        let r = reconciler(store.clone());
        let roots = vec![root.clone()];

        fs::write(&file, "first draft").unwrap();
        assert_eq!(r.reconcile_path(&roots, &file).await.unwrap(), PathOutcome::Indexed);
        assert_eq!(r.reconcile_path(&roots, &file).await.unwrap(), PathOutcome::Unchanged);

        fs::write(&file, "second draft, longer").unwrap();
        assert_eq!(r.reconcile_path(&roots, &file).await.unwrap(), PathOutcome::Indexed);

        fs::remove_file(&file).unwrap();
        assert_eq!(r.reconcile_path(&roots, &file).await.unwrap(), PathOutcome::Deleted(1));
        assert_eq!(store.document_count().await.unwrap(), 0);

        let outside = TempDir::new().unwrap();
        let stray = outside.path().join("x.md");
        fs::write(&stray, "x").unwrap();
        assert_eq!(r.reconcile_path(&roots, &stray).await.unwrap(), PathOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_reconcile_path_new_directory_requests_rescan() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);
        fs::create_dir_all(root.join("sub")).unwrap();
        let r = reconciler(Arc::new(InMemoryStore::new()));
        assert_eq!(
            r.reconcile_path(&[root.clone()], &root.join("sub")).await.unwrap(),
            PathOutcome::Rescan
        );
    }
}
