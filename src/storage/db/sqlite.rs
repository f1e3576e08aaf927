//! SQLite backend implementation using sqlx.
//!
//! Provides connection pooling and journal-mode management for SQLite.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqlitePool as SqlxPool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::storage::StorageError;

/// Default maximum connections in the pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Journal mode reported by SQLite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalMode {
    /// Write-ahead log: readers never block on writers.
    Wal,
    /// Any rollback-journal mode (`delete`, `truncate`, `memory`, ...).
    Other(String),
}

impl JournalMode {
    fn from_pragma(value: &str) -> Self {
        if value.eq_ignore_ascii_case("wal") {
            Self::Wal
        } else {
            Self::Other(value.to_ascii_lowercase())
        }
    }

    pub fn is_wal(&self) -> bool {
        matches!(self, Self::Wal)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Wal => "wal",
            Self::Other(mode) => mode,
        }
    }
}

impl std::fmt::Display for JournalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection settings for [`SqlitePool::connect`].
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub max_connections: u32,
    pub busy_timeout: Duration,
    /// WAL auto-checkpoint threshold in pages, applied on every connection.
    pub wal_autocheckpoint: u32,
    pub create_if_missing: bool,
}

/// SQLite connection pool wrapper.
#[derive(Clone)]
pub struct SqlitePool {
    inner: SqlxPool,
}

impl std::fmt::Debug for SqlitePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePool").finish_non_exhaustive()
    }
}

impl SqlitePool {
    /// Open a pool on a database file.
    ///
    /// # Configuration
    ///
    /// - Normal synchronous mode for performance with durability
    /// - `busy_timeout` before SQLite reports a lock error
    /// - `wal_autocheckpoint` bounding WAL growth
    ///
    /// Journal mode is left untouched; see [`SqlitePool::enable_wal`].
    pub async fn connect(path: &Path, settings: &ConnectSettings) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(settings.create_if_missing)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(settings.busy_timeout)
            .pragma("wal_autocheckpoint", settings.wal_autocheckpoint.to_string());

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(DEFAULT_CONNECT_TIMEOUT)
            .connect_with(options)
            .await?;

        Ok(Self { inner: pool })
    }

    /// Switch the database to WAL and report the mode that actually took effect.
    ///
    /// WAL is persistent in the database file, so one successful switch covers
    /// every pooled connection.
    pub async fn enable_wal(&self) -> Result<JournalMode, StorageError> {
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL")
            .fetch_one(&self.inner)
            .await?;
        self.journal_mode().await
    }

    /// Read back the current journal mode.
    pub async fn journal_mode(&self) -> Result<JournalMode, StorageError> {
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&self.inner)
            .await?;
        Ok(JournalMode::from_pragma(&mode))
    }

    /// Current auto-checkpoint threshold in pages.
    pub async fn wal_autocheckpoint(&self) -> Result<i64, StorageError> {
        let pages: i64 = sqlx::query_scalar("PRAGMA wal_autocheckpoint")
            .fetch_one(&self.inner)
            .await?;
        Ok(pages)
    }

    /// Get the underlying sqlx pool for direct query execution.
    #[inline]
    pub fn inner(&self) -> &SqlxPool {
        &self.inner
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Check if the pool is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings() -> ConnectSettings {
        ConnectSettings {
            max_connections: 2,
            busy_timeout: Duration::from_millis(500),
            wal_autocheckpoint: 500,
            create_if_missing: true,
        }
    }

    #[tokio::test]
    async fn test_sqlite_pool_connect() {
        let dir = tempdir().unwrap();
        let pool = SqlitePool::connect(&dir.path().join("t.db"), &settings())
            .await
            .unwrap();
        assert!(!pool.is_closed());

        let row: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(row.0, 1);

        pool.close().await;
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_enable_wal_on_file_database() {
        let dir = tempdir().unwrap();
        let pool = SqlitePool::connect(&dir.path().join("t.db"), &settings())
            .await
            .unwrap();

        let mode = pool.enable_wal().await.unwrap();
        assert!(mode.is_wal());
        assert_eq!(pool.wal_autocheckpoint().await.unwrap(), 500);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_connect_without_create_fails_for_missing_file() {
        let dir = tempdir().unwrap();
        let mut settings = settings();
        settings.create_if_missing = false;

        let result = SqlitePool::connect(&dir.path().join("missing.db"), &settings).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_journal_mode_parsing() {
        assert_eq!(JournalMode::from_pragma("WAL"), JournalMode::Wal);
        assert_eq!(
            JournalMode::from_pragma("delete"),
            JournalMode::Other("delete".to_string())
        );
        assert_eq!(JournalMode::Other("memory".into()).to_string(), "memory");
    }
}
