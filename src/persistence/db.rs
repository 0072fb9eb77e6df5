//! `SQLite` connection pool setup and schema bootstrap.

use std::fs;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::{AppError, GlobalConfig, Result};

use super::schema;

/// Alias for the shared `SQLite` pool.
pub type Database = SqlitePool;

/// Open the database described by `config`.
///
/// # Errors
///
/// Returns `AppError::Config` if no `db_path` is configured for a file-backed
/// database, or a persistence error if the connection or schema fails.
pub async fn open(config: &GlobalConfig) -> Result<Database> {
    if config.in_memory {
        return connect_memory().await;
    }
    let path = config
        .db_path
        .as_deref()
        .ok_or_else(|| AppError::Config("db_path is not configured".into()))?;
    connect(path).await
}

/// Connect to a file-backed database in WAL mode, creating it if missing.
///
/// # Errors
///
/// Returns `AppError::Io` if the parent directory cannot be created, or a
/// persistence error if the connection or schema bootstrap fails.
pub async fn connect(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// Connect to a private in-memory database.
///
/// The pool holds exactly one connection for its whole lifetime so every
/// query sees the same database.
///
/// # Errors
///
/// Returns a persistence error if the connection or schema bootstrap fails.
pub async fn connect_memory() -> Result<Database> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}
