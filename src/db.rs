//! SQLite connections for per-container stores.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;

use folio_core::error::StoreError;

/// SQLite primary result codes that mean the file cannot be trusted.
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;

/// Open (creating if needed) the database at `path` in WAL mode.
pub async fn connect(path: &Path) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(StoreError::backend)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(map_sqlx)
}

/// Run `PRAGMA quick_check` and fail with [`StoreError::Corrupted`] on
/// anything but `ok`.
pub async fn quick_check(pool: &SqlitePool) -> Result<(), StoreError> {
    let rows: Vec<String> = sqlx::query_scalar("PRAGMA quick_check")
        .fetch_all(pool)
        .await
        .map_err(map_sqlx)?;
    match rows.as_slice() {
        [only] if only == "ok" => Ok(()),
        _ => Err(StoreError::Corrupted(rows.join("; "))),
    }
}

/// Translate a sqlx error, recognising corruption codes.
pub fn map_sqlx(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let primary = db_err
            .code()
            .and_then(|c| c.parse::<i32>().ok())
            .map(|c| c & 0xff);
        if matches!(primary, Some(SQLITE_CORRUPT) | Some(SQLITE_NOTADB)) {
            return StoreError::Corrupted(db_err.message().to_string());
        }
    }
    StoreError::backend(err)
}
