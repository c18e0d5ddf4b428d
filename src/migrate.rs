//! Schema for a container database.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `documents` | One row per indexed file, keyed by absolute path. A NULL `content_hash` marks a pending or failed document. |
//! | `chunks` | Text spans with their embedding as a little-endian `f32` blob |
//! | `chunks_fts` | FTS5 index over chunk text for keyword search |
//! | `store_meta` | Key/value pairs such as the pinned vector dimensionality |

use sqlx::SqlitePool;

use folio_core::error::StoreError;

use crate::db::map_sqlx;

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            path TEXT PRIMARY KEY,
            content_hash TEXT,
            size INTEGER,
            mtime_ns INTEGER,
            status TEXT NOT NULL DEFAULT 'indexed',
            error TEXT,
            indexed_at INTEGER NOT NULL,
            model TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            start_byte INTEGER NOT NULL,
            end_byte INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            UNIQUE(path, chunk_index),
            FOREIGN KEY (path) REFERENCES documents(path) ON DELETE CASCADE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path)",
        "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)",
    ];

    for sql in statements {
        sqlx::query(sql).execute(pool).await.map_err(map_sqlx)?;
    }

    // FTS5 CREATE is not idempotent natively, so check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await
    .map_err(map_sqlx)?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                path UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(map_sqlx)?;
        // stores created before keyword search
        sqlx::query(
            "INSERT INTO chunks_fts (chunk_id, path, text) SELECT id, path, text FROM chunks",
        )
        .execute(pool)
        .await
        .map_err(map_sqlx)?;
    }
    Ok(())
}
