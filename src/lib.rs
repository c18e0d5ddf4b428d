//! # Folio
//!
//! A local, offline-first semantic search engine over folders of
//! documents.
//!
//! Folders are grouped into named containers. Each container has its own
//! SQLite index, kept in sync with disk by delta reconciliation: only new,
//! changed and deleted files are extracted, chunked and embedded again.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │ ContainerManager │  registry.json, job slots
//!                  └───┬──────────┬───┘
//!                      │          │
//!           index/watch│          │search
//!                      ▼          ▼
//!              ┌────────────┐  ┌──────────────┐
//!              │ Reconciler │  │ SearchEngine │
//!              └─────┬──────┘  └──────┬───────┘
//!     FileScanner ◀──┤                │
//!     Extractor   ◀──┤                │
//!     Embedder    ◀──┤                │
//!                    ▼                ▼
//!              ┌─────────────────────────────┐
//!              │ SqliteStore (per container) │
//!              └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration |
//! | [`container`] | Containers, jobs, corruption recovery |
//! | [`registry`] | Persisted container metadata |
//! | [`reconciler`] | Delta indexing passes |
//! | [`scanner`] | Folder walking and fingerprints |
//! | [`extract`] | Text, PDF, OOXML and OCR extraction |
//! | [`embedding`] | Embedding providers, timeouts and retries |
//! | [`sqlite_store`] | SQLite vector store |
//! | [`db`] / [`migrate`] | Connection and schema |
//! | [`watch`] | Filesystem change events |
//! | [`traits`] | Tool surface |
//! | [`server`] | HTTP tool server |
//!
//! Models, errors, chunking, the store and embedder traits, and the search
//! algorithm live in the `folio-core` crate.

pub mod config;
pub mod container;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod migrate;
pub mod progress;
pub mod reconciler;
pub mod registry;
pub mod scanner;
pub mod search;
pub mod server;
pub mod sqlite_store;
pub mod stats;
pub mod traits;
pub mod watch;
