//! Data models shared by the store, the reconciler, and search.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Change fingerprint of a file on disk.
///
/// Two fingerprints are equal only if content hash, size, and mtime all
/// match. Equality is the sole condition under which a file is skipped
/// during incremental indexing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// SHA-256 of the file bytes, lowercase hex.
    pub content_hash: String,
    /// File size in bytes.
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime_ns: i64,
}

/// Indexing state of a [`DocumentRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// Chunks and vectors reflect the current fingerprint.
    Indexed,
    /// Embedding failed after retries. Retried on the next pass.
    Pending,
    /// Extraction failed. Retried on the next pass.
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Pending => "pending",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "indexed" => Some(DocumentStatus::Indexed),
            "pending" => Some(DocumentStatus::Pending),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One indexed file within a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Canonical absolute path. Unique within a container.
    pub path: PathBuf,
    /// Fingerprint of the content the chunks were built from.
    ///
    /// `None` while the document is `pending` or `failed`, so the next
    /// pass always treats it as an update.
    pub fingerprint: Option<Fingerprint>,
    pub status: DocumentStatus,
    /// Last extraction or embedding error, if any.
    pub error: Option<String>,
    /// Chunk ids in chunk-index order.
    pub chunk_ids: Vec<String>,
    /// Milliseconds since the epoch of the last fingerprint update.
    pub indexed_at: i64,
    /// Embedding model the vectors were produced with.
    pub model: String,
}

/// A contiguous span of a document's extracted text, with its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub path: PathBuf,
    /// Zero-based, contiguous within a document.
    pub chunk_index: i64,
    /// Byte offset range `[start, end)` into the extracted text.
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// SHA-256 of `text`, lowercase hex.
    pub hash: String,
    pub vector: Vec<f32>,
}

/// A chunk returned by a nearest-neighbor query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkHit {
    pub path: PathBuf,
    pub chunk_index: i64,
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// Cosine similarity, BM25 relevance, or a hybrid blend, per search mode.
    pub score: f32,
    /// `indexed_at` of the owning document, used for tie-breaking.
    pub indexed_at: i64,
}

/// A ranked search result. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub path: PathBuf,
    pub score: f32,
    pub chunk_index: i64,
    pub start: usize,
    pub end: usize,
    /// Text of the matching chunk.
    pub snippet: String,
}

impl From<ChunkHit> for SearchResult {
    fn from(hit: ChunkHit) -> Self {
        SearchResult {
            path: hit.path,
            score: hit.score,
            chunk_index: hit.chunk_index,
            start: hit.start,
            end: hit.end,
            snippet: hit.text,
        }
    }
}

/// Aggregate counts for one container's store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub indexed: usize,
    pub pending: usize,
    pub failed: usize,
    pub chunks: usize,
    /// Pinned vector dimensionality, once any vector has been written.
    pub dims: Option<usize>,
    /// Model of the most recently indexed document.
    pub model: Option<String>,
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Format a millisecond timestamp as ISO 8601.
pub fn format_ts_iso(ts_millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_millis)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts_millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_str() {
        for status in [
            DocumentStatus::Indexed,
            DocumentStatus::Pending,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DocumentStatus::parse("bogus"), None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DocumentStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
    }

    #[test]
    fn test_fingerprint_equality_needs_all_fields() {
        let a = Fingerprint {
            content_hash: "abc".into(),
            size: 10,
            mtime_ns: 1,
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.mtime_ns = 2;
        assert_ne!(a, b);
    }

    #[test]
    fn test_format_ts_iso() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_ts_iso(1_700_000_000_000), "2023-11-14T22:13:20Z");
    }
}
