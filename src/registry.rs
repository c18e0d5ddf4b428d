//! Container registry.
//!
//! Container metadata (name, description, indexed paths, last scan time)
//! and the active container, persisted as `registry.json` in the data
//! directory. Vector data lives elsewhere, one SQLite file per container;
//! [`store_file_name`] maps a container name to that file.
//!
//! Saves are atomic: the JSON is written to a temp file, synced, and
//! renamed over the old registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use folio_core::error::{FolioError, Result};
use folio_core::models::now_millis;

/// The container that always exists and cannot be deleted.
pub const DEFAULT_CONTAINER: &str = "Default";

const MAX_NAME_LEN: usize = 128;

/// A folder registered to a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexedPath {
    pub root: PathBuf,
    /// Unix millis of the last pass over this root that ran to completion.
    #[serde(default)]
    pub last_scan_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub paths: Vec<IndexedPath>,
    #[serde(default)]
    pub created_at: i64,
}

impl ContainerRecord {
    fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            paths: Vec::new(),
            created_at: now_millis(),
        }
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.paths.iter().map(|p| p.root.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registry {
    pub active: String,
    pub containers: BTreeMap<String, ContainerRecord>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut containers = BTreeMap::new();
        containers.insert(
            DEFAULT_CONTAINER.to_string(),
            ContainerRecord::new(DEFAULT_CONTAINER, ""),
        );
        Self {
            active: DEFAULT_CONTAINER.to_string(),
            containers,
        }
    }
}

impl Registry {
    /// Read the registry at `path`, or start a fresh one if it is missing.
    pub fn load(path: &Path) -> Result<Self> {
        let mut registry = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<Registry>(&content)?
        } else {
            Registry::default()
        };

        registry
            .containers
            .entry(DEFAULT_CONTAINER.to_string())
            .or_insert_with(|| ContainerRecord::new(DEFAULT_CONTAINER, ""));
        if !registry.containers.contains_key(&registry.active) {
            registry.active = DEFAULT_CONTAINER.to_string();
        }
        Ok(registry)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");

        let written = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()
        })();
        if let Err(e) = written {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }

        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ContainerRecord> {
        self.containers
            .get(name)
            .ok_or_else(|| FolioError::ContainerNotFound(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut ContainerRecord> {
        self.containers
            .get_mut(name)
            .ok_or_else(|| FolioError::ContainerNotFound(name.to_string()))
    }

    pub fn list(&self) -> impl Iterator<Item = &ContainerRecord> {
        self.containers.values()
    }

    pub fn create(&mut self, name: &str, description: &str) -> Result<&ContainerRecord> {
        validate_name(name)?;
        if self.containers.contains_key(name) {
            return Err(FolioError::ContainerExists(name.to_string()));
        }
        // Two names may map to the same database file, e.g. "a b" and
        // "a0020b", or "Work" and "work" on a case-insensitive filesystem.
        let file = store_file_name(name);
        if let Some(other) = self
            .containers
            .keys()
            .find(|n| store_file_name(n).eq_ignore_ascii_case(&file))
        {
            return Err(FolioError::InvalidContainerName(format!(
                "{name} (collides with existing container '{other}')"
            )));
        }

        Ok(self
            .containers
            .entry(name.to_string())
            .or_insert_with(|| ContainerRecord::new(name, description)))
    }

    /// Remove a container. The active container falls back to the default.
    pub fn remove(&mut self, name: &str) -> Result<ContainerRecord> {
        if name == DEFAULT_CONTAINER {
            return Err(FolioError::DefaultContainer);
        }
        let record = self
            .containers
            .remove(name)
            .ok_or_else(|| FolioError::ContainerNotFound(name.to_string()))?;
        if self.active == name {
            self.active = DEFAULT_CONTAINER.to_string();
        }
        Ok(record)
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        self.get(name)?;
        self.active = name.to_string();
        Ok(())
    }

    /// The container that has `root` registered, if any.
    pub fn owner_of(&self, root: &Path) -> Option<&str> {
        self.containers
            .values()
            .find(|c| c.paths.iter().any(|p| p.root == root))
            .map(|c| c.name.as_str())
    }

    /// Register a canonical folder. Re-adding a folder the container
    /// already owns is a no-op.
    pub fn add_path(&mut self, name: &str, root: PathBuf) -> Result<()> {
        self.get(name)?;
        match self.owner_of(&root) {
            Some(owner) if owner == name => return Ok(()),
            Some(owner) => {
                return Err(FolioError::PathConflict {
                    path: root,
                    owner: owner.to_string(),
                })
            }
            None => {}
        }
        self.get_mut(name)?.paths.push(IndexedPath {
            root,
            last_scan_at: None,
        });
        Ok(())
    }

    pub fn remove_path(&mut self, name: &str, root: &Path) -> Result<IndexedPath> {
        let record = self.get_mut(name)?;
        let pos = record
            .paths
            .iter()
            .position(|p| p.root == root)
            .ok_or_else(|| FolioError::PathNotRegistered {
                path: root.to_path_buf(),
                container: name.to_string(),
            })?;
        Ok(record.paths.remove(pos))
    }

    /// Stamp `last_scan_at` on the given roots of a container.
    pub fn mark_scanned(&mut self, name: &str, roots: &[PathBuf], at: i64) -> Result<()> {
        let record = self.get_mut(name)?;
        for path in record.paths.iter_mut().filter(|p| roots.contains(&p.root)) {
            path.last_scan_at = Some(at);
        }
        Ok(())
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(FolioError::InvalidContainerName(name.to_string()));
    }
    if name.len() > MAX_NAME_LEN || name.chars().any(char::is_control) {
        return Err(FolioError::InvalidContainerName(name.to_string()));
    }
    Ok(())
}

/// Filesystem-safe form of a container name.
///
/// ASCII alphanumerics, `_`, `-` and `.` are kept; any other character is
/// written as its code point in (at least) four hex digits. Always
/// prefixed with `c_`, so no name can produce `.` or `..`.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push_str("c_");
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
            out.push(c);
        } else {
            out.push_str(&format!("{:04x}", c as u32));
        }
    }
    out
}

pub fn store_file_name(name: &str) -> String {
    format!("{}.sqlite", sanitize_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Default"), "c_Default");
        assert_eq!(sanitize_name("my docs"), "c_my0020docs");
        assert_eq!(sanitize_name("a/b"), "c_a002fb");
        assert_eq!(sanitize_name("v1.2_x-y"), "c_v1.2_x-y");
        assert_eq!(sanitize_name("é"), "c_00e9");
        assert_eq!(store_file_name(".."), "c_...sqlite");
    }

    #[test]
    fn test_default_container_always_present() {
        let registry = Registry::default();
        assert_eq!(registry.active, DEFAULT_CONTAINER);
        assert!(registry.get(DEFAULT_CONTAINER).is_ok());
    }

    #[test]
    fn test_create_rejects_duplicates_and_bad_names() {
        let mut registry = Registry::default();
        registry.create("work", "job stuff").unwrap();
        assert!(matches!(
            registry.create("work", ""),
            Err(FolioError::ContainerExists(_))
        ));
        assert!(matches!(
            registry.create("   ", ""),
            Err(FolioError::InvalidContainerName(_))
        ));
        assert!(matches!(
            registry.create("Work", ""),
            Err(FolioError::InvalidContainerName(_))
        ));
        registry.create("a b", "").unwrap();
        assert!(matches!(
            registry.create("a0020b", ""),
            Err(FolioError::InvalidContainerName(_))
        ));
    }

    #[test]
    fn test_default_cannot_be_removed() {
        let mut registry = Registry::default();
        assert!(matches!(
            registry.remove(DEFAULT_CONTAINER),
            Err(FolioError::DefaultContainer)
        ));
    }

    #[test]
    fn test_remove_active_falls_back_to_default() {
        let mut registry = Registry::default();
        registry.create("notes", "").unwrap();
        registry.set_active("notes").unwrap();
        registry.remove("notes").unwrap();
        assert_eq!(registry.active, DEFAULT_CONTAINER);
    }

    #[test]
    fn test_path_conflict() {
        let mut registry = Registry::default();
        registry.create("a", "").unwrap();
        registry.create("b", "").unwrap();
        registry.add_path("a", PathBuf::from("/data/p1")).unwrap();
        registry.add_path("a", PathBuf::from("/data/p1")).unwrap();
        assert_eq!(registry.get("a").unwrap().paths.len(), 1);

        match registry.add_path("b", PathBuf::from("/data/p1")) {
            Err(FolioError::PathConflict { owner, .. }) => assert_eq!(owner, "a"),
            other => panic!("expected PathConflict, got {other:?}"),
        }
        registry.add_path("b", PathBuf::from("/data/p10")).unwrap();
    }

    #[test]
    fn test_remove_unregistered_path() {
        let mut registry = Registry::default();
        assert!(matches!(
            registry.remove_path(DEFAULT_CONTAINER, Path::new("/nope")),
            Err(FolioError::PathNotRegistered { .. })
        ));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");

        let mut registry = Registry::load(&path).unwrap();
        registry.create("research", "papers").unwrap();
        registry.add_path("research", PathBuf::from("/papers")).unwrap();
        registry
            .mark_scanned("research", &[PathBuf::from("/papers")], 42)
            .unwrap();
        registry.set_active("research").unwrap();
        registry.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = Registry::load(&path).unwrap();
        assert_eq!(reopened, registry);
        assert_eq!(
            reopened.get("research").unwrap().paths[0].last_scan_at,
            Some(42)
        );
    }

    #[test]
    fn test_load_repairs_missing_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, r#"{"active": "gone", "containers": {}}"#).unwrap();
        let registry = Registry::load(&path).unwrap();
        assert_eq!(registry.active, DEFAULT_CONTAINER);
        assert!(registry.get(DEFAULT_CONTAINER).is_ok());
    }
}
