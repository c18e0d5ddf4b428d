//! Error taxonomy for Folio.
//!
//! Per-file failures ([`ExtractionError`], [`EmbeddingError`]) are recorded
//! against the document and never abort a pass. Container-level failures
//! surface as [`FolioError`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for container, indexing, and search operations.
#[derive(Error, Debug)]
pub enum FolioError {
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container already exists: {0}")]
    ContainerExists(String),

    #[error("invalid container name: {0:?}")]
    InvalidContainerName(String),

    #[error("the default container cannot be deleted")]
    DefaultContainer,

    /// The folder is already registered to another container.
    #[error("path {} is already registered to container '{owner}'", path.display())]
    PathConflict { path: PathBuf, owner: String },

    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("path {} is not registered to container '{container}'", path.display())]
    PathNotRegistered { path: PathBuf, container: String },

    #[error("an indexing job is already running for container '{0}'")]
    IndexingInProgress(String),

    #[error("index for container '{container}' is corrupted: {detail}")]
    IndexCorruption { container: String, detail: String },

    #[error("container '{0}' has no indexed documents")]
    EmptyIndex(String),

    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl FolioError {
    /// Attribute a store failure to `container`, promoting corruption to
    /// [`FolioError::IndexCorruption`].
    pub fn from_store(container: &str, err: StoreError) -> Self {
        match err {
            StoreError::Corrupted(detail) => FolioError::IndexCorruption {
                container: container.to_string(),
                detail,
            },
            other => FolioError::Store(other),
        }
    }
}

/// Content extraction errors. Scoped to a single file.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),

    #[error("unreadable file: {0}")]
    Unreadable(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),

    #[error("OCR failed: {0}")]
    Ocr(String),

    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
}

/// Embedding errors. Scoped to a single file or query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embeddings are disabled")]
    Disabled,

    /// Transport failure, rate limit, or server error.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    /// The provider refused the input. Retrying will not help.
    #[error("embedding request rejected: {0}")]
    Rejected(String),

    #[error("embedding timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding has {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },
}

impl EmbeddingError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Unavailable(_) | EmbeddingError::Timeout(_)
        )
    }
}

/// Vector store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("vector dimension mismatch: store holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("store is corrupted: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Wrap any backend error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }
}

/// Result type alias for Folio operations.
pub type Result<T, E = FolioError> = std::result::Result<T, E>;
