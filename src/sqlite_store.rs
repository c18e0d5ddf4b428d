//! SQLite-backed [`VectorStore`].
//!
//! One database file per container. Every mutating call runs in a single
//! transaction, and WAL journaling lets searches read a consistent snapshot
//! while the reconciler writes. Vector search is brute-force cosine
//! similarity over the `chunks.embedding` blobs; keyword search is FTS5
//! BM25 over `chunks_fts`, which every write keeps in step with `chunks`.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use folio_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use folio_core::error::StoreError;
use folio_core::models::{
    now_millis, Chunk, ChunkHit, DocumentRecord, DocumentStatus, Fingerprint, StoreStats,
};
use folio_core::store::{chunk_dims, in_scope, keyword_terms, rank_hits, VectorStore};

use crate::db::{self, map_sqlx};
use crate::migrate;

const META_DIMS: &str = "dims";

/// SQLite implementation of [`VectorStore`].
pub struct SqliteStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteStore {
    /// Open the database at `path`, verify its integrity, and apply the
    /// schema. Fails with [`StoreError::Corrupted`] if the file is damaged.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let pool = db::connect(path).await?;
        if let Err(e) = db::quick_check(&pool).await {
            pool.close().await;
            return Err(e);
        }
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn pinned_dims<'e, E>(executor: E) -> Result<Option<usize>, StoreError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?")
                .bind(META_DIMS)
                .fetch_optional(executor)
                .await
                .map_err(map_sqlx)?;
        match value {
            None => Ok(None),
            Some(v) => v
                .parse::<usize>()
                .map(Some)
                .map_err(|_| StoreError::Corrupted(format!("invalid stored dims: {v}"))),
        }
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// FTS5 query matching any of `terms`. Terms are alphanumeric, so quoting
/// them is enough to keep FTS5 operators out.
fn fts_match(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn decode_document(row: &SqliteRow, chunk_ids: Vec<String>) -> Result<DocumentRecord, StoreError> {
    let path: String = row.try_get("path").map_err(map_sqlx)?;
    let hash: Option<String> = row.try_get("content_hash").map_err(map_sqlx)?;
    let size: Option<i64> = row.try_get("size").map_err(map_sqlx)?;
    let mtime_ns: Option<i64> = row.try_get("mtime_ns").map_err(map_sqlx)?;
    let status: String = row.try_get("status").map_err(map_sqlx)?;
    let status = DocumentStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupted(format!("unknown document status: {status}")))?;

    let fingerprint = match (hash, size, mtime_ns) {
        (Some(content_hash), Some(size), Some(mtime_ns)) => Some(Fingerprint {
            content_hash,
            size: size as u64,
            mtime_ns,
        }),
        _ => None,
    };

    Ok(DocumentRecord {
        path: PathBuf::from(path),
        fingerprint,
        status,
        error: row.try_get("error").map_err(map_sqlx)?,
        chunk_ids,
        indexed_at: row.try_get("indexed_at").map_err(map_sqlx)?,
        model: row.try_get("model").map_err(map_sqlx)?,
    })
}

fn decode_chunk(row: &SqliteRow) -> Result<Chunk, StoreError> {
    let path: String = row.try_get("path").map_err(map_sqlx)?;
    let start: i64 = row.try_get("start_byte").map_err(map_sqlx)?;
    let end: i64 = row.try_get("end_byte").map_err(map_sqlx)?;
    let blob: Vec<u8> = row.try_get("embedding").map_err(map_sqlx)?;
    Ok(Chunk {
        id: row.try_get("id").map_err(map_sqlx)?,
        path: PathBuf::from(path),
        chunk_index: row.try_get("chunk_index").map_err(map_sqlx)?,
        start: start as usize,
        end: end as usize,
        text: row.try_get("text").map_err(map_sqlx)?,
        hash: row.try_get("hash").map_err(map_sqlx)?,
        vector: blob_to_vec(&blob),
    })
}

const DOCUMENT_COLUMNS: &str =
    "path, content_hash, size, mtime_ns, status, error, indexed_at, model";

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert(&self, doc: &DocumentRecord, chunks: &[Chunk]) -> Result<(), StoreError> {
        let dims = chunk_dims(chunks)?;
        let key = path_key(&doc.path);
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        if let Some(new) = dims {
            if let Some(pinned) = Self::pinned_dims(&mut *tx).await? {
                if pinned != new {
                    let others: i64 =
                        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE path != ?")
                            .bind(&key)
                            .fetch_one(&mut *tx)
                            .await
                            .map_err(map_sqlx)?;
                    if others > 0 {
                        return Err(StoreError::DimensionMismatch {
                            expected: pinned,
                            actual: new,
                        });
                    }
                }
            }
            sqlx::query(
                "INSERT INTO store_meta (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(META_DIMS)
            .bind(new.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        let (hash, size, mtime_ns) = match &doc.fingerprint {
            Some(fp) => (
                Some(fp.content_hash.as_str()),
                Some(fp.size as i64),
                Some(fp.mtime_ns),
            ),
            None => (None, None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO documents
                (path, content_hash, size, mtime_ns, status, error, indexed_at, model)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                size = excluded.size,
                mtime_ns = excluded.mtime_ns,
                status = excluded.status,
                error = excluded.error,
                indexed_at = excluded.indexed_at,
                model = excluded.model
            "#,
        )
        .bind(&key)
        .bind(hash)
        .bind(size)
        .bind(mtime_ns)
        .bind(doc.status.as_str())
        .bind(&doc.error)
        .bind(doc.indexed_at)
        .bind(&doc.model)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query("DELETE FROM chunks WHERE path = ?")
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        sqlx::query("DELETE FROM chunks_fts WHERE path = ?")
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (id, path, chunk_index, start_byte, end_byte, text, hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&key)
            .bind(chunk.chunk_index)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(vec_to_blob(&chunk.vector))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, path, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&key)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn mark_status(
        &self,
        path: &Path,
        status: DocumentStatus,
        error: &str,
        model: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (path, content_hash, size, mtime_ns, status, error, indexed_at, model)
            VALUES (?, NULL, NULL, NULL, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                content_hash = NULL,
                size = NULL,
                mtime_ns = NULL,
                status = excluded.status,
                error = excluded.error
            "#,
        )
        .bind(path_key(path))
        .bind(status.as_str())
        .bind(error)
        .bind(now_millis())
        .bind(model)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_by_path(&self, path: &Path) -> Result<bool, StoreError> {
        let key = path_key(path);
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query("DELETE FROM chunks_fts WHERE path = ?")
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        sqlx::query("DELETE FROM chunks WHERE path = ?")
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let removed = sqlx::query("DELETE FROM documents WHERE path = ?")
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?
            .rows_affected();
        tx.commit().await.map_err(map_sqlx)?;
        Ok(removed > 0)
    }

    async fn nearest_k(
        &self,
        query: &[f32],
        k: usize,
        prefix: Option<&Path>,
    ) -> Result<Vec<ChunkHit>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        // LIKE narrows the scan; in_scope enforces component boundaries.
        let like = prefix.map(|p| format!("{}%", escape_like(&path_key(p))));

        let rows = sqlx::query(
            r#"
            SELECT c.path, c.chunk_index, c.start_byte, c.end_byte, c.text, c.embedding,
                   d.indexed_at
            FROM chunks c
            JOIN documents d ON d.path = c.path
            WHERE (? IS NULL OR c.path LIKE ? ESCAPE '\')
            "#,
        )
        .bind(like.as_deref())
        .bind(like.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let path: String = row.try_get("path").map_err(map_sqlx)?;
            let path = PathBuf::from(path);
            if !in_scope(&path, prefix) {
                continue;
            }
            let blob: Vec<u8> = row.try_get("embedding").map_err(map_sqlx)?;
            let start: i64 = row.try_get("start_byte").map_err(map_sqlx)?;
            let end: i64 = row.try_get("end_byte").map_err(map_sqlx)?;
            hits.push(ChunkHit {
                path,
                chunk_index: row.try_get("chunk_index").map_err(map_sqlx)?,
                start: start as usize,
                end: end as usize,
                text: row.try_get("text").map_err(map_sqlx)?,
                score: cosine_similarity(query, &blob_to_vec(&blob)),
                indexed_at: row.try_get("indexed_at").map_err(map_sqlx)?,
            });
        }

        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn keyword_k(
        &self,
        query: &str,
        k: usize,
        prefix: Option<&Path>,
    ) -> Result<Vec<ChunkHit>, StoreError> {
        let terms = keyword_terms(query);
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        // the folder itself or anything below it
        let scope = prefix.map(|p| {
            let key = path_key(p);
            let below = if key.ends_with('/') {
                format!("{}%", escape_like(&key))
            } else {
                format!("{}/%", escape_like(&key))
            };
            (key, below)
        });
        let (exact, below) = match &scope {
            Some((exact, below)) => (Some(exact.as_str()), Some(below.as_str())),
            None => (None, None),
        };

        let rows = sqlx::query(
            r#"
            SELECT c.path, c.chunk_index, c.start_byte, c.end_byte, c.text,
                   d.indexed_at, chunks_fts.rank AS rank
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            JOIN documents d ON d.path = c.path
            WHERE chunks_fts MATCH ?
              AND (? IS NULL OR c.path = ? OR c.path LIKE ? ESCAPE '\')
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(fts_match(&terms))
        .bind(exact)
        .bind(exact)
        .bind(below)
        .bind(i64::try_from(k).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let path: String = row.try_get("path").map_err(map_sqlx)?;
            let path = PathBuf::from(path);
            if !in_scope(&path, prefix) {
                continue;
            }
            let rank: f64 = row.try_get("rank").map_err(map_sqlx)?;
            let start: i64 = row.try_get("start_byte").map_err(map_sqlx)?;
            let end: i64 = row.try_get("end_byte").map_err(map_sqlx)?;
            hits.push(ChunkHit {
                path,
                chunk_index: row.try_get("chunk_index").map_err(map_sqlx)?,
                start: start as usize,
                end: end as usize,
                text: row.try_get("text").map_err(map_sqlx)?,
                // bm25 ranks are negative, lower is better
                score: -rank as f32,
                indexed_at: row.try_get("indexed_at").map_err(map_sqlx)?,
            });
        }
        rank_hits(&mut hits);
        Ok(hits)
    }

    async fn stored_fingerprints(
        &self,
    ) -> Result<BTreeMap<PathBuf, Option<Fingerprint>>, StoreError> {
        let rows = sqlx::query("SELECT path, content_hash, size, mtime_ns FROM documents")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let mut out = BTreeMap::new();
        for row in &rows {
            let path: String = row.try_get("path").map_err(map_sqlx)?;
            let hash: Option<String> = row.try_get("content_hash").map_err(map_sqlx)?;
            let size: Option<i64> = row.try_get("size").map_err(map_sqlx)?;
            let mtime_ns: Option<i64> = row.try_get("mtime_ns").map_err(map_sqlx)?;
            let fingerprint = match (hash, size, mtime_ns) {
                (Some(content_hash), Some(size), Some(mtime_ns)) => Some(Fingerprint {
                    content_hash,
                    size: size as u64,
                    mtime_ns,
                }),
                _ => None,
            };
            out.insert(PathBuf::from(path), fingerprint);
        }
        Ok(out)
    }

    async fn get_document(&self, path: &Path) -> Result<Option<DocumentRecord>, StoreError> {
        let key = path_key(path);
        // one read transaction, so the row and its chunk ids agree
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE path = ?"
        ))
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(None);
        };

        let chunk_ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM chunks WHERE path = ? ORDER BY chunk_index ASC")
                .bind(&key)
                .fetch_all(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;

        decode_document(&row, chunk_ids).map(Some)
    }

    async fn get_chunks(&self, path: &Path) -> Result<Vec<Chunk>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, path, chunk_index, start_byte, end_byte, text, hash, embedding
            FROM chunks WHERE path = ? ORDER BY chunk_index ASC
            "#,
        )
        .bind(path_key(path))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(decode_chunk).collect()
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        let id_rows = sqlx::query("SELECT path, id FROM chunks ORDER BY path, chunk_index")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let mut ids: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in &id_rows {
            let path: String = row.try_get("path").map_err(map_sqlx)?;
            let id: String = row.try_get("id").map_err(map_sqlx)?;
            ids.entry(path).or_default().push(id);
        }

        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY path ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in &rows {
            let path: String = row.try_get("path").map_err(map_sqlx)?;
            let chunk_ids = ids.remove(&path).unwrap_or_default();
            docs.push(decode_document(row, chunk_ids)?);
        }
        Ok(docs)
    }

    async fn document_count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(count as usize)
    }

    async fn dims(&self) -> Result<Option<usize>, StoreError> {
        Self::pinned_dims(&self.pool).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for sql in [
            "DELETE FROM chunks_fts",
            "DELETE FROM chunks",
            "DELETE FROM documents",
        ] {
            sqlx::query(sql)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        sqlx::query("DELETE FROM store_meta WHERE key = ?")
            .bind(META_DIMS)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn models(&self) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar(
            "SELECT DISTINCT d.model FROM documents d
             WHERE EXISTS (SELECT 1 FROM chunks c WHERE c.path = d.path)
             ORDER BY d.model",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM documents GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let mut stats = StoreStats::default();
        for row in &rows {
            let status: String = row.try_get("status").map_err(map_sqlx)?;
            let n: i64 = row.try_get("n").map_err(map_sqlx)?;
            let n = n as usize;
            stats.documents += n;
            match DocumentStatus::parse(&status) {
                Some(DocumentStatus::Indexed) => stats.indexed += n,
                Some(DocumentStatus::Pending) => stats.pending += n,
                Some(DocumentStatus::Failed) => stats.failed += n,
                None => {}
            }
        }

        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        stats.chunks = chunks as usize;
        stats.dims = Self::pinned_dims(&self.pool).await?;
        stats.model = sqlx::query_scalar(
            "SELECT model FROM documents WHERE status = 'indexed'
             ORDER BY indexed_at DESC, path ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(stats)
    }
}
