//! Filesystem scanner.
//!
//! Walks a container's roots and yields one [`ScanEntry`] per candidate
//! file. The walk is lazy: entries are produced as the iterator advances,
//! and calling [`FileScanner::scan`] again restarts it from scratch.
//!
//! Ignore policy, in order:
//!
//! 1. `.git`, `node_modules`, and `target` directories are pruned.
//! 2. `scanner.exclude_globs` drop files silently.
//! 3. A non-empty `scanner.include_globs` keeps only matching files.
//! 4. Files no extractor supports are reported as skipped (`unsupported`).
//! 5. Files above `scanner.max_file_bytes` are reported as skipped (`too_large`).
//!
//! Globs match the path relative to its root. Reported paths are absolute
//! and lie under the canonicalized root; each physical file is reported at
//! most once per scan, so symlink cycles and overlapping roots terminate.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use folio_core::extract::ContentExtractor;
use folio_core::models::Fingerprint;

use crate::config::ScannerConfig;

const PRUNED_DIRS: &[&str] = &[".git", "node_modules", "target"];

/// Why a file was passed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge,
    Unsupported,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooLarge => write!(f, "too_large"),
            SkipReason::Unsupported => write!(f, "unsupported"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEntry {
    File {
        path: PathBuf,
        fingerprint: Fingerprint,
    },
    Skipped {
        path: PathBuf,
        reason: SkipReason,
    },
    /// The file exists but could not be read or fingerprinted.
    Error { path: PathBuf, message: String },
    /// A registered root is missing or unreadable.
    RootUnavailable { root: PathBuf, message: String },
}

/// Compiled ignore policy.
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    pub max_file_bytes: u64,
    pub follow_symlinks: bool,
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl ScanPolicy {
    pub fn from_config(config: &ScannerConfig) -> Result<Self> {
        let include = if config.include_globs.is_empty() {
            None
        } else {
            Some(build_globset(&config.include_globs)?)
        };
        Ok(Self {
            max_file_bytes: config.max_file_bytes,
            follow_symlinks: config.follow_symlinks,
            include,
            exclude: build_globset(&config.exclude_globs)?,
        })
    }

    /// Whether glob rules drop `relative` without reporting it.
    fn is_ignored(&self, relative: &Path) -> bool {
        if self.exclude.is_match(relative) {
            return true;
        }
        match &self.include {
            Some(set) => !set.is_match(relative),
            None => false,
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn in_pruned_dir(relative: &Path) -> bool {
    relative
        .parent()
        .map(|dir| {
            dir.components()
                .any(|c| PRUNED_DIRS.iter().any(|p| c.as_os_str() == *p))
        })
        .unwrap_or(false)
}

/// Enumerates files under a set of roots.
#[derive(Clone)]
pub struct FileScanner {
    policy: ScanPolicy,
    extractor: Arc<dyn ContentExtractor>,
}

impl FileScanner {
    pub fn new(policy: ScanPolicy, extractor: Arc<dyn ContentExtractor>) -> Self {
        Self { policy, extractor }
    }

    /// Start a walk over `roots`, in the given order.
    pub fn scan(&self, roots: &[PathBuf]) -> ScanIter {
        ScanIter {
            policy: self.policy.clone(),
            extractor: self.extractor.clone(),
            roots: roots.iter().cloned().collect(),
            current: None,
            visited: HashSet::new(),
        }
    }

    /// Classify a single path under `root`, as a full scan would.
    ///
    /// Returns `None` when the path is gone, is not a regular file, or is
    /// dropped by the ignore rules.
    pub fn scan_one(&self, root: &Path, path: &Path) -> Option<ScanEntry> {
        let relative = path.strip_prefix(root).ok()?;
        if in_pruned_dir(relative) || self.policy.is_ignored(relative) {
            return None;
        }
        let meta = if self.policy.follow_symlinks {
            std::fs::metadata(path)
        } else {
            std::fs::symlink_metadata(path)
        };
        match meta {
            Ok(m) if m.is_file() => Some(classify(&self.policy, &*self.extractor, path)),
            _ => None,
        }
    }
}

/// Lazy iterator returned by [`FileScanner::scan`].
pub struct ScanIter {
    policy: ScanPolicy,
    extractor: Arc<dyn ContentExtractor>,
    roots: VecDeque<PathBuf>,
    current: Option<(PathBuf, walkdir::IntoIter)>,
    visited: HashSet<PathBuf>,
}

impl ScanIter {
    /// Open the next root, or report why it cannot be walked.
    fn open_root(&mut self, root: PathBuf) -> Option<ScanEntry> {
        let canonical = match root.canonicalize() {
            Ok(c) => c,
            Err(e) => {
                return Some(ScanEntry::RootUnavailable {
                    root,
                    message: e.to_string(),
                })
            }
        };
        if !canonical.is_dir() {
            return Some(ScanEntry::RootUnavailable {
                root,
                message: "not a directory".to_string(),
            });
        }
        if let Err(e) = std::fs::read_dir(&canonical) {
            return Some(ScanEntry::RootUnavailable {
                root,
                message: e.to_string(),
            });
        }

        let walker = WalkDir::new(&canonical)
            .follow_links(self.policy.follow_symlinks)
            .sort_by_file_name()
            .into_iter();
        self.current = Some((canonical, walker));
        None
    }
}

impl Iterator for ScanIter {
    type Item = ScanEntry;

    fn next(&mut self) -> Option<ScanEntry> {
        loop {
            let Some((root, walker)) = self.current.as_mut() else {
                let root = self.roots.pop_front()?;
                if let Some(entry) = self.open_root(root) {
                    return Some(entry);
                }
                continue;
            };

            let entry = match walker.next() {
                None => {
                    self.current = None;
                    continue;
                }
                Some(Ok(entry)) => entry,
                Some(Err(err)) => {
                    if err.loop_ancestor().is_some() {
                        continue;
                    }
                    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    return Some(ScanEntry::Error {
                        path,
                        message: err.to_string(),
                    });
                }
            };

            if entry.depth() > 0 && entry.file_type().is_dir() {
                let name = entry.file_name();
                if PRUNED_DIRS.iter().any(|p| name == *p) {
                    walker.skip_current_dir();
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&*root).unwrap_or(path);
            if self.policy.is_ignored(relative) {
                continue;
            }

            let physical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            if !self.visited.insert(physical) {
                continue;
            }

            return Some(classify(&self.policy, &*self.extractor, path));
        }
    }
}

fn classify(policy: &ScanPolicy, extractor: &dyn ContentExtractor, path: &Path) -> ScanEntry {
    if !extractor.supports(path) {
        return ScanEntry::Skipped {
            path: path.to_path_buf(),
            reason: SkipReason::Unsupported,
        };
    }
    match fingerprint_file(path, policy.max_file_bytes) {
        Ok(Some(fingerprint)) => ScanEntry::File {
            path: path.to_path_buf(),
            fingerprint,
        },
        Ok(None) => ScanEntry::Skipped {
            path: path.to_path_buf(),
            reason: SkipReason::TooLarge,
        },
        Err(e) => ScanEntry::Error {
            path: path.to_path_buf(),
            message: e.to_string(),
        },
    }
}

/// Hash, size, and mtime of a file. `None` if it exceeds `max_bytes`.
pub fn fingerprint_file(path: &Path, max_bytes: u64) -> std::io::Result<Option<Fingerprint>> {
    let meta = std::fs::metadata(path)?;
    if meta.len() > max_bytes {
        return Ok(None);
    }
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    let size = std::io::copy(&mut file, &mut hasher)?;

    Ok(Some(Fingerprint {
        content_hash: format!("{:x}", hasher.finalize()),
        size,
        mtime_ns,
    }))
}
