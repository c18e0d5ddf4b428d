//! Content extraction seam.
//!
//! A [`ContentExtractor`] turns a file path into plain UTF-8 text. Failures
//! are per-file [`ExtractionError`]s: the reconciler records them against
//! the document and moves on.

use async_trait::async_trait;
use std::path::Path;

use crate::error::ExtractionError;

#[async_trait]
pub trait ContentExtractor: Send + Sync {
    /// Whether this extractor can handle `path`, judged by its name alone.
    ///
    /// The scanner reports unsupported files as skipped rather than
    /// handing them to the reconciler.
    fn supports(&self, path: &Path) -> bool;

    /// Extract plain text from the file at `path`.
    async fn extract(&self, path: &Path) -> Result<String, ExtractionError>;
}
