//! Delta computation between a live scan and stored state.
//!
//! The reconciler never drops a container to rebuild it. Both incremental
//! passes and rebuilds reduce to a [`Delta`] of adds, updates, and deletes
//! that is applied one document at a time, so an interrupted pass leaves a
//! consistent index and rerunning it derives only the remaining work.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::Fingerprint;

/// How stored fingerprints are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaMode {
    /// Skip files whose fingerprint is unchanged.
    Incremental,
    /// Treat every tracked file as an update candidate.
    Rebuild,
}

/// Minimal set of changes that brings the store in line with disk.
///
/// All three lists are sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub added: Vec<(PathBuf, Fingerprint)>,
    pub updated: Vec<(PathBuf, Fingerprint)>,
    pub deleted: Vec<PathBuf>,
    /// Live files that need no work.
    pub unchanged: usize,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of documents to write or remove.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }

    /// Adds and updates merged into one path-ordered work list.
    pub fn writes(&self) -> Vec<(PathBuf, Fingerprint)> {
        let mut all: Vec<(PathBuf, Fingerprint)> =
            self.added.iter().chain(self.updated.iter()).cloned().collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

/// Diff `live` against `stored`.
///
/// - live only → add
/// - both, fingerprints differ (or stored is `None`) → update
/// - stored only → delete, unless the path lies under one of `preserved`
///
/// `preserved` holds roots that could not be scanned and files that could
/// not be fingerprinted; their stored documents are left alone rather than
/// treated as gone.
pub fn compute_delta(
    live: &BTreeMap<PathBuf, Fingerprint>,
    stored: &BTreeMap<PathBuf, Option<Fingerprint>>,
    mode: DeltaMode,
    preserved: &[PathBuf],
) -> Delta {
    let mut delta = Delta::default();

    for (path, fingerprint) in live {
        match stored.get(path) {
            None => delta.added.push((path.clone(), fingerprint.clone())),
            Some(Some(old)) if mode == DeltaMode::Incremental && old == fingerprint => {
                delta.unchanged += 1;
            }
            Some(_) => delta.updated.push((path.clone(), fingerprint.clone())),
        }
    }

    for path in stored.keys() {
        if !live.contains_key(path) && !is_preserved(path, preserved) {
            delta.deleted.push(path.clone());
        }
    }

    delta
}

fn is_preserved(path: &Path, preserved: &[PathBuf]) -> bool {
    preserved.iter().any(|p| path.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(hash: &str) -> Fingerprint {
        Fingerprint {
            content_hash: hash.to_string(),
            size: 10,
            mtime_ns: 100,
        }
    }

    fn live(entries: &[(&str, &str)]) -> BTreeMap<PathBuf, Fingerprint> {
        entries
            .iter()
            .map(|(p, h)| (PathBuf::from(p), fp(h)))
            .collect()
    }

    fn stored(entries: &[(&str, Option<&str>)]) -> BTreeMap<PathBuf, Option<Fingerprint>> {
        entries
            .iter()
            .map(|(p, h)| (PathBuf::from(p), h.map(fp)))
            .collect()
    }

    #[test]
    fn test_add_update_delete() {
        let stored = stored(&[("/r/A", Some("hA")), ("/r/B", Some("hB"))]);
        let live = live(&[("/r/A", "hA"), ("/r/C", "hC")]);
        let delta = compute_delta(&live, &stored, DeltaMode::Incremental, &[]);

        assert_eq!(delta.added, vec![(PathBuf::from("/r/C"), fp("hC"))]);
        assert!(delta.updated.is_empty());
        assert_eq!(delta.deleted, vec![PathBuf::from("/r/B")]);
        assert_eq!(delta.unchanged, 1);
    }

    #[test]
    fn test_changed_fingerprint_is_update() {
        let stored = stored(&[("/r/A", Some("old"))]);
        let live = live(&[("/r/A", "new")]);
        let delta = compute_delta(&live, &stored, DeltaMode::Incremental, &[]);
        assert_eq!(delta.updated.len(), 1);
        assert_eq!(delta.unchanged, 0);
    }

    #[test]
    fn test_unchanged_is_empty() {
        let stored = stored(&[("/r/A", Some("hA"))]);
        let live = live(&[("/r/A", "hA")]);
        let delta = compute_delta(&live, &stored, DeltaMode::Incremental, &[]);
        assert!(delta.is_empty());
        assert_eq!(delta.len(), 0);
    }

    #[test]
    fn test_pending_document_is_retried() {
        let stored = stored(&[("/r/A", None)]);
        let live = live(&[("/r/A", "hA")]);
        let delta = compute_delta(&live, &stored, DeltaMode::Incremental, &[]);
        assert_eq!(delta.updated.len(), 1);
    }

    #[test]
    fn test_rebuild_updates_everything_tracked() {
        let stored = stored(&[("/r/A", Some("hA")), ("/r/B", Some("hB"))]);
        let live = live(&[("/r/A", "hA"), ("/r/B", "hB"), ("/r/C", "hC")]);
        let delta = compute_delta(&live, &stored, DeltaMode::Rebuild, &[]);
        assert_eq!(delta.updated.len(), 2);
        assert_eq!(delta.added.len(), 1);
        assert!(delta.deleted.is_empty());
        assert_eq!(delta.unchanged, 0);
    }

    #[test]
    fn test_preserved_root_not_deleted() {
        let stored = stored(&[("/mnt/usb/a", Some("h")), ("/home/b", Some("h"))]);
        let live = BTreeMap::new();
        let delta = compute_delta(
            &live,
            &stored,
            DeltaMode::Incremental,
            &[PathBuf::from("/mnt/usb")],
        );
        assert_eq!(delta.deleted, vec![PathBuf::from("/home/b")]);
    }

    #[test]
    fn test_writes_sorted_by_path() {
        let stored = stored(&[("/r/b", Some("old"))]);
        let live = live(&[("/r/c", "h"), ("/r/b", "new"), ("/r/a", "h")]);
        let delta = compute_delta(&live, &stored, DeltaMode::Incremental, &[]);
        let order: Vec<PathBuf> = delta.writes().into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("/r/a"),
                PathBuf::from("/r/b"),
                PathBuf::from("/r/c")
            ]
        );
    }
}
