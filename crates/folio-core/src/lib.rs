//! # Folio Core
//!
//! Shared logic for Folio: data models, the error taxonomy, the
//! overlap chunker, the [`Embedder`](embedding::Embedder),
//! [`ContentExtractor`](extract::ContentExtractor) and
//! [`VectorStore`](store::VectorStore) seams, delta computation for
//! incremental indexing, and the search algorithm.
//!
//! This crate contains no tokio, sqlx, or filesystem walking. The `folio`
//! application crate supplies the SQLite store, the scanner, the concrete
//! extractors and embedding providers, and the orchestration around them.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod models;
pub mod reconcile;
pub mod search;
pub mod store;
