//! Container management.
//!
//! [`ContainerManager`] owns the registry, one [`SqliteStore`] per
//! container, and the indexing job slot of each container.
//!
//! # Jobs
//!
//! A container runs at most one indexing job at a time. When a second
//! request arrives the configured [`JobPolicy`] decides: `reject` fails it
//! with [`FolioError::IndexingInProgress`], `supersede` cancels the running
//! job, waits for it to stop before its next file, then starts the new
//! one. Watch events wait their turn instead.
//!
//! Searches never take the job slot; they read the store while a job
//! writes to it, and SQLite transactions keep each document whole.
//!
//! # Corruption
//!
//! A store that fails its integrity check on open is reported as
//! [`FolioError::IndexCorruption`] to searches. An index request moves the
//! damaged files aside as `*.corrupt-<timestamp>` and rebuilds that
//! container from scratch.
//!
//! Closing a store, moving or removing its files, and opening it again
//! happen under one hold of the stores lock, so a concurrent search never
//! reopens files that are about to disappear.
//!
//! # Embedding changes
//!
//! A container never holds vectors from two models. A rebuild under a new
//! model or dimensionality clears the store first, which also re-pins the
//! dimensions. An incremental pass under a new model of the same size is
//! promoted to such a rebuild; under a new size it is refused.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use folio_core::embedding::Embedder;
use folio_core::error::{EmbeddingError, FolioError, Result, StoreError};
use folio_core::extract::ContentExtractor;
use folio_core::models::{now_millis, SearchResult, StoreStats};
use folio_core::reconcile::DeltaMode;
use folio_core::search::{SearchEngine, SearchOptions};
use folio_core::store::VectorStore;

use crate::config::{Config, JobPolicy};
use crate::embedding::create_embedder;
use crate::extract::FileExtractor;
use crate::progress::{IndexProgressReporter, NoProgress};
use crate::reconciler::{CancelToken, IndexReport, PathOutcome, Reconciler};
use crate::registry::{store_file_name, ContainerRecord, IndexedPath, Registry};
use crate::scanner::{FileScanner, ScanPolicy};
use crate::sqlite_store::SqliteStore;

/// How to claim a container's job slot when it is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Reject,
    Supersede,
    Wait,
}

impl From<JobPolicy> for Claim {
    fn from(policy: JobPolicy) -> Self {
        match policy {
            JobPolicy::Reject => Claim::Reject,
            JobPolicy::Supersede => Claim::Supersede,
        }
    }
}

/// What occupies a job slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Index,
    Rebuild,
    Watch,
    Reset,
    Maintenance,
}

/// Public view of a running job.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobInfo {
    pub id: u64,
    pub kind: JobKind,
    pub started_at: i64,
    /// Cancellation requested; the job stops before its next file.
    pub cancelling: bool,
}

struct JobSlot {
    info: JobInfo,
    cancel: CancelToken,
    done: watch::Receiver<bool>,
}

type JobTable = Arc<Mutex<HashMap<String, JobSlot>>>;

/// Holds a container's job slot; frees it on drop, even if the job panics.
struct SlotGuard {
    jobs: JobTable,
    container: String,
    id: u64,
    cancel: CancelToken,
    done: watch::Sender<bool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            if jobs.get(&self.container).map(|s| s.info.id) == Some(self.id) {
                jobs.remove(&self.container);
            }
        }
        let _ = self.done.send(true);
    }
}

/// A background indexing job.
#[derive(Debug)]
pub struct IndexJob {
    pub id: u64,
    pub container: String,
    handle: tokio::task::JoinHandle<Result<IndexReport>>,
}

impl IndexJob {
    /// Wait for the job to finish.
    pub async fn wait(self) -> Result<IndexReport> {
        self.handle
            .await
            .map_err(|e| FolioError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

/// Snapshot returned by [`ContainerManager::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatus {
    pub name: String,
    pub description: String,
    pub active: bool,
    pub paths: Vec<IndexedPath>,
    pub store_path: PathBuf,
    pub stats: StoreStats,
    pub job: Option<JobInfo>,
}

pub struct ContainerManager {
    config: Config,
    registry: tokio::sync::Mutex<Registry>,
    stores: tokio::sync::Mutex<HashMap<String, Arc<SqliteStore>>>,
    jobs: JobTable,
    next_job: AtomicU64,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn ContentExtractor>,
    scanner: FileScanner,
    search: SearchEngine,
    progress: Arc<dyn IndexProgressReporter>,
}

impl ContainerManager {
    /// Build a manager with explicit collaborators.
    pub fn new(
        config: Config,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn ContentExtractor>,
    ) -> anyhow::Result<Self> {
        let registry = Registry::load(&config.registry_path())?;
        let policy = ScanPolicy::from_config(&config.scanner)?;
        let scanner = FileScanner::new(policy, extractor.clone());
        let search = SearchEngine::new(embedder.clone(), config.retrieval.search_params());
        Ok(Self {
            registry: tokio::sync::Mutex::new(registry),
            stores: tokio::sync::Mutex::new(HashMap::new()),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_job: AtomicU64::new(1),
            embedder,
            extractor,
            scanner,
            search,
            progress: Arc::new(NoProgress),
            config,
        })
    }

    /// Build a manager with the embedder and extractor named in `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let extractor: Arc<dyn ContentExtractor> =
            Arc::new(FileExtractor::from_config(&config.extraction));
        Self::new(config, embedder, extractor)
    }

    pub fn with_progress(mut self, progress: Arc<dyn IndexProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Write the registry and open the default container's store.
    pub async fn init(&self) -> Result<()> {
        std::fs::create_dir_all(self.config.containers_dir())?;
        let active = {
            let registry = self.registry.lock().await;
            registry.save(&self.config.registry_path())?;
            registry.active.clone()
        };
        self.store(&active).await?;
        Ok(())
    }

    // ============ registry ============

    pub async fn list(&self) -> Vec<ContainerRecord> {
        self.registry.lock().await.list().cloned().collect()
    }

    pub async fn active(&self) -> String {
        self.registry.lock().await.active.clone()
    }

    /// `name`, or the active container when `None`.
    pub async fn resolve(&self, name: Option<&str>) -> String {
        match name {
            Some(n) => n.to_string(),
            None => self.active().await,
        }
    }

    pub async fn create(&self, name: &str, description: &str) -> Result<ContainerRecord> {
        let mut registry = self.registry.lock().await;
        let record = registry.create(name, description)?.clone();
        registry.save(&self.config.registry_path())?;
        info!(container = name, "container created");
        Ok(record)
    }

    pub async fn set_active(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        registry.set_active(name)?;
        registry.save(&self.config.registry_path())
    }

    /// Delete a container, its paths, and its database files.
    ///
    /// A running job is cancelled first.
    pub async fn delete(&self, name: &str) -> Result<()> {
        {
            let registry = self.registry.lock().await;
            if name == crate::registry::DEFAULT_CONTAINER {
                return Err(FolioError::DefaultContainer);
            }
            registry.get(name)?;
        }

        let _slot = self.claim(name, Claim::Supersede, JobKind::Maintenance).await?;
        {
            let mut registry = self.registry.lock().await;
            registry.remove(name)?;
            registry.save(&self.config.registry_path())?;
        }
        {
            let mut stores = self.stores.lock().await;
            if let Some(store) = stores.remove(name) {
                store.close().await;
            }
            remove_db_files(&self.store_path(name))?;
        }
        info!(container = name, "container deleted");
        Ok(())
    }

    /// Register a folder with a container.
    pub async fn add_path(&self, name: &str, dir: &Path) -> Result<PathBuf> {
        let root = dir.canonicalize().map_err(|e| FolioError::InvalidPath {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !root.is_dir() {
            return Err(FolioError::InvalidPath {
                path: dir.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        let mut registry = self.registry.lock().await;
        registry.add_path(name, root.clone())?;
        registry.save(&self.config.registry_path())?;
        info!(container = name, root = %root.display(), "path added");
        Ok(root)
    }

    /// Unregister a folder and drop its documents from the store.
    ///
    /// Fails with `IndexingInProgress` while a job runs on the container.
    pub async fn remove_path(&self, name: &str, dir: &Path) -> Result<usize> {
        let root = dir
            .canonicalize()
            .or_else(|_| std::path::absolute(dir))
            .map_err(|e| FolioError::InvalidPath {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?;

        let _slot = self.claim(name, Claim::Reject, JobKind::Maintenance).await?;
        let remaining = {
            let mut registry = self.registry.lock().await;
            registry.remove_path(name, &root)?;
            registry.save(&self.config.registry_path())?;
            registry.get(name)?.roots()
        };

        let store = self.store(name).await?;
        let stored = store
            .stored_fingerprints()
            .await
            .map_err(|e| FolioError::from_store(name, e))?;
        let mut removed = 0;
        for path in stored.keys() {
            if path.starts_with(&root) && !remaining.iter().any(|r| path.starts_with(r)) {
                if store
                    .delete_by_path(path)
                    .await
                    .map_err(|e| FolioError::from_store(name, e))?
                {
                    removed += 1;
                }
            }
        }
        info!(container = name, root = %root.display(), removed, "path removed");
        Ok(removed)
    }

    pub async fn status(&self, name: &str) -> Result<ContainerStatus> {
        let (record, active) = {
            let registry = self.registry.lock().await;
            (registry.get(name)?.clone(), registry.active == name)
        };
        let store = self.store(name).await?;
        let stats = store
            .stats()
            .await
            .map_err(|e| FolioError::from_store(name, e))?;
        Ok(ContainerStatus {
            name: record.name,
            description: record.description,
            active,
            paths: record.paths,
            store_path: store.path().to_path_buf(),
            stats,
            job: self.job(name),
        })
    }

    /// The job running on `name`, if any.
    pub fn job(&self, name: &str) -> Option<JobInfo> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| {
                jobs.get(name).map(|s| JobInfo {
                    cancelling: s.cancel.is_cancelled(),
                    ..s.info.clone()
                })
            })
    }

    // ============ stores ============

    fn store_path(&self, name: &str) -> PathBuf {
        self.config.containers_dir().join(store_file_name(name))
    }

    /// The open store of an existing container.
    pub async fn store(&self, name: &str) -> Result<Arc<SqliteStore>> {
        // Stores lock before registry lock, everywhere both are held.
        let mut stores = self.stores.lock().await;
        self.registry.lock().await.get(name)?;
        if let Some(store) = stores.get(name) {
            return Ok(store.clone());
        }
        let store = self.open_store(name).await?;
        stores.insert(name.to_string(), store.clone());
        Ok(store)
    }

    async fn open_store(&self, name: &str) -> Result<Arc<SqliteStore>> {
        let store = SqliteStore::open(&self.store_path(name))
            .await
            .map_err(|e| FolioError::from_store(name, e))?;
        Ok(Arc::new(store))
    }

    /// Close `name`'s store, let `prepare` act on its database path, then
    /// open it again. The stores lock is held throughout.
    async fn reopen_store<T>(
        &self,
        name: &str,
        prepare: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<(Arc<SqliteStore>, T)> {
        let mut stores = self.stores.lock().await;
        self.registry.lock().await.get(name)?;
        if let Some(store) = stores.remove(name) {
            store.close().await;
        }
        let prepared = prepare(&self.store_path(name))?;
        let store = self.open_store(name).await?;
        stores.insert(name.to_string(), store.clone());
        Ok((store, prepared))
    }

    /// Open the store for writing, quarantining it first if it is corrupted.
    async fn store_for_indexing(&self, name: &str) -> Result<Arc<SqliteStore>> {
        match self.store(name).await {
            Err(FolioError::IndexCorruption { detail, .. }) => {
                error!(container = name, %detail, "index corrupted, rebuilding from scratch");
                let (store, moved) = self.reopen_store(name, quarantine_db_files).await?;
                for path in &moved {
                    warn!(container = name, path = %path.display(), "moved damaged file aside");
                }
                Ok(store)
            }
            other => other,
        }
    }

    /// Drop all indexed data for a container and start with an empty store.
    pub async fn reset(&self, name: &str) -> Result<()> {
        self.registry.lock().await.get(name)?;
        let _slot = self
            .claim(name, self.config.indexing.job_policy.into(), JobKind::Reset)
            .await?;
        self.reopen_store(name, remove_db_files).await?;
        info!(container = name, "index reset");
        Ok(())
    }

    // ============ search ============

    pub async fn search(
        &self,
        name: &str,
        query: &str,
        k: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        let store = self.store(name).await?;
        self.search.search(name, store.as_ref(), query, k, opts).await
    }

    // ============ jobs ============

    async fn claim(&self, name: &str, claim: Claim, kind: JobKind) -> Result<SlotGuard> {
        loop {
            let waiting = {
                let mut jobs = self
                    .jobs
                    .lock()
                    .map_err(|_| FolioError::Config("job table poisoned".to_string()))?;
                match jobs.get(name) {
                    None => {
                        let id = self.next_job.fetch_add(1, Ordering::SeqCst);
                        let cancel = CancelToken::new();
                        let (done_tx, done_rx) = watch::channel(false);
                        jobs.insert(
                            name.to_string(),
                            JobSlot {
                                info: JobInfo {
                                    id,
                                    kind,
                                    started_at: now_millis(),
                                    cancelling: false,
                                },
                                cancel: cancel.clone(),
                                done: done_rx,
                            },
                        );
                        return Ok(SlotGuard {
                            jobs: self.jobs.clone(),
                            container: name.to_string(),
                            id,
                            cancel,
                            done: done_tx,
                        });
                    }
                    Some(slot) => match claim {
                        Claim::Reject => {
                            return Err(FolioError::IndexingInProgress(name.to_string()))
                        }
                        Claim::Supersede => {
                            info!(container = name, job = slot.info.id, "superseding running job");
                            slot.cancel.cancel();
                            slot.done.clone()
                        }
                        Claim::Wait => slot.done.clone(),
                    },
                }
            };
            let mut waiting = waiting;
            let _ = waiting.wait_for(|done| *done).await;
        }
    }

    /// Cancel the running job on `name`. Returns whether one was running.
    pub fn stop(&self, name: &str) -> bool {
        let Ok(jobs) = self.jobs.lock() else {
            return false;
        };
        match jobs.get(name) {
            Some(slot) => {
                info!(container = name, job = slot.info.id, "stop requested");
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Start an indexing pass in the background.
    pub async fn spawn_index(self: &Arc<Self>, name: &str, mode: DeltaMode) -> Result<IndexJob> {
        self.registry.lock().await.get(name)?;
        if !self.config.embedding.is_enabled() {
            return Err(FolioError::Embedding(EmbeddingError::Disabled));
        }

        let kind = match mode {
            DeltaMode::Incremental => JobKind::Index,
            DeltaMode::Rebuild => JobKind::Rebuild,
        };
        let slot = self
            .claim(name, self.config.indexing.job_policy.into(), kind)
            .await?;
        let id = slot.id;

        let manager = self.clone();
        let container = name.to_string();
        let handle = tokio::spawn(async move {
            let result = manager.run_pass(&container, mode, &slot.cancel).await;
            if let Err(e) = &result {
                error!(container = %container, error = %e, "index pass failed");
            }
            drop(slot);
            result
        });

        Ok(IndexJob {
            id,
            container: name.to_string(),
            handle,
        })
    }

    /// Run an indexing pass and wait for its report.
    pub async fn index(self: &Arc<Self>, name: &str, mode: DeltaMode) -> Result<IndexReport> {
        self.spawn_index(name, mode).await?.wait().await
    }

    fn reconciler(&self, name: &str, store: Arc<SqliteStore>) -> Reconciler {
        Reconciler::new(
            name,
            store,
            self.scanner.clone(),
            self.extractor.clone(),
            self.embedder.clone(),
            self.config.chunking.clone(),
            self.config.extraction.timeout(),
            self.progress.clone(),
        )
    }

    async fn run_pass(
        &self,
        name: &str,
        mode: DeltaMode,
        cancel: &CancelToken,
    ) -> Result<IndexReport> {
        let store = self.store_for_indexing(name).await?;
        let mode = self.prepare_store(name, store.as_ref(), mode).await?;

        let roots = self.registry.lock().await.get(name)?.roots();
        let report = self.reconciler(name, store).run(&roots, mode, cancel).await?;

        if !report.cancelled {
            let scanned: Vec<PathBuf> = roots
                .into_iter()
                .filter(|r| !report.unreachable_roots.contains(r))
                .collect();
            let mut registry = self.registry.lock().await;
            registry.mark_scanned(name, &scanned, now_millis())?;
            registry.save(&self.config.registry_path())?;
        }
        Ok(report)
    }

    /// Make the store hold only vectors of the configured embedder before
    /// a pass, returning the mode the pass must run in.
    ///
    /// | Stored vectors | Incremental | Rebuild |
    /// |----------------|-------------|---------|
    /// | same model and size | unchanged | unchanged |
    /// | other model, same size | cleared, promoted to rebuild | cleared |
    /// | other size | `DimensionMismatch` | cleared, dimensions re-pinned |
    async fn prepare_store(
        &self,
        name: &str,
        store: &dyn VectorStore,
        mode: DeltaMode,
    ) -> Result<DeltaMode> {
        let stats = store
            .stats()
            .await
            .map_err(|e| FolioError::from_store(name, e))?;
        let dims = self.embedder.dims();
        let model = self.embedder.model_name();
        let resized = stats.dims.filter(|stored| *stored != dims);

        if let Some(stored) = resized {
            if stats.chunks > 0 && mode == DeltaMode::Incremental {
                error!(
                    container = name,
                    stored,
                    configured = dims,
                    "embedding dimensions changed; run `folio rebuild` or `folio reset`"
                );
                return Err(FolioError::Store(StoreError::DimensionMismatch {
                    expected: stored,
                    actual: dims,
                }));
            }
        }

        let stale: Vec<String> = store
            .models()
            .await
            .map_err(|e| FolioError::from_store(name, e))?
            .into_iter()
            .filter(|m| m != model)
            .collect();
        let mode = if !stale.is_empty() && mode == DeltaMode::Incremental {
            warn!(
                container = name,
                stored = %stale.join(","),
                configured = %model,
                "embedding model changed; re-embedding every document"
            );
            DeltaMode::Rebuild
        } else {
            mode
        };

        if resized.is_some() || !stale.is_empty() {
            info!(
                container = name,
                dims,
                model = %model,
                "clearing vectors of the previous embedding"
            );
            store
                .clear()
                .await
                .map_err(|e| FolioError::from_store(name, e))?;
        }
        Ok(mode)
    }

    /// Apply a filesystem event for one path. Waits for any running job.
    ///
    /// An embedding change turns the event into a full rebuild.
    pub async fn reconcile_path(&self, name: &str, path: &Path) -> Result<PathOutcome> {
        let slot = self.claim(name, Claim::Wait, JobKind::Watch).await?;
        let store = self.store_for_indexing(name).await?;
        let mode = self
            .prepare_store(name, store.as_ref(), DeltaMode::Incremental)
            .await?;
        let roots = self.registry.lock().await.get(name)?.roots();
        let reconciler = self.reconciler(name, store);
        if mode == DeltaMode::Rebuild {
            reconciler.run(&roots, mode, &slot.cancel).await?;
            return Ok(PathOutcome::Rescan);
        }

        let outcome = reconciler.reconcile_path(&roots, path).await?;
        debug!(container = name, path = %path.display(), ?outcome, "watch event applied");
        if outcome == PathOutcome::Rescan {
            reconciler
                .run(&roots, DeltaMode::Incremental, &slot.cancel)
                .await?;
        }
        Ok(outcome)
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// The database file and its WAL sidecars.
fn db_files(path: &Path) -> [PathBuf; 3] {
    [
        path.to_path_buf(),
        sidecar(path, "-wal"),
        sidecar(path, "-shm"),
    ]
}

fn remove_db_files(path: &Path) -> Result<()> {
    for file in db_files(path) {
        match std::fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Rename the database files to `*.corrupt-<timestamp>`.
fn quarantine_db_files(path: &Path) -> Result<Vec<PathBuf>> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f").to_string();
    let mut moved = Vec::new();
    for file in db_files(path) {
        if file.exists() {
            let target = sidecar(&file, &format!(".corrupt-{stamp}"));
            std::fs::rename(&file, &target)?;
            moved.push(target);
        }
    }
    Ok(moved)
}
