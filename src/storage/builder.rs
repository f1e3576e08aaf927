//! Storage builder.
//!
//! Opens the database, enables and verifies WAL journaling, creates the schema
//! and wires the lock-contention retry policy into the write path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::retry::{Retrier, RetryObserver, RetryPolicy};
use crate::storage::StorageError;
use crate::storage::db::{ConnectSettings, DEFAULT_MAX_CONNECTIONS, JournalMode, SqlitePool};
use crate::storage::schema::init_schema;
use crate::storage::store::ReadingStore;

/// Default time SQLite waits on a lock before reporting "database is locked".
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(1);

/// Default WAL auto-checkpoint threshold (pages).
pub const DEFAULT_WAL_AUTOCHECKPOINT: u32 = 1000;

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    db_path: PathBuf,
    max_connections: u32,
    busy_timeout: Duration,
    wal_autocheckpoint: u32,
    write_policy: RetryPolicy,
    create_if_missing: bool,
    observer: Option<Arc<dyn RetryObserver>>,
}

impl StorageBuilder {
    /// Create a new storage builder.
    ///
    /// Writes are retried 3 times starting at 1s, for lock contention only.
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            wal_autocheckpoint: DEFAULT_WAL_AUTOCHECKPOINT,
            write_policy: RetryPolicy::default(),
            create_if_missing: true,
            observer: None,
        }
    }

    /// Builder pre-populated from the `database` config section.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let policy = config
            .write_retry
            .policy()
            .map_err(|e| StorageError::Internal(format!("database write_retry: {e}")))?;

        Ok(Self::new(&config.path)
            .busy_timeout(config.busy_timeout)
            .wal_autocheckpoint(config.wal_autocheckpoint)
            .write_policy(policy))
    }

    /// Set the pool size.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Set how long SQLite itself waits on a lock before failing.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Set the WAL auto-checkpoint threshold in pages.
    pub fn wal_autocheckpoint(mut self, pages: u32) -> Self {
        self.wal_autocheckpoint = pages;
        self
    }

    /// Set the retry policy wrapped around each reading insert.
    pub fn write_policy(mut self, policy: RetryPolicy) -> Self {
        self.write_policy = policy;
        self
    }

    /// Whether a missing database file may be created (default: true).
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Route write retry events to a custom observer.
    pub fn retry_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the storage layer.
    pub async fn build(self) -> Result<ReadingStore, StorageError> {
        // Create parent directory if it doesn't exist
        if self.create_if_missing
            && let Some(parent) = self.db_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Internal(format!(
                    "Failed to create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let settings = ConnectSettings {
            max_connections: self.max_connections,
            busy_timeout: self.busy_timeout,
            wal_autocheckpoint: self.wal_autocheckpoint,
            create_if_missing: self.create_if_missing,
        };
        let pool = SqlitePool::connect(&self.db_path, &settings).await?;

        let journal_mode = match pool.enable_wal().await {
            Ok(JournalMode::Wal) => {
                tracing::info!(
                    path = %self.db_path.display(),
                    journal_mode = "wal",
                    wal_autocheckpoint = self.wal_autocheckpoint,
                    busy_timeout_ms = self.busy_timeout.as_millis() as u64,
                    "WAL journaling verified"
                );
                JournalMode::Wal
            }
            Ok(other) => {
                tracing::warn!(
                    path = %self.db_path.display(),
                    journal_mode = %other,
                    "WAL could not be enabled; falling back to default locking"
                );
                other
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.db_path.display(),
                    error = %e,
                    "Failed to enable WAL; falling back to default locking"
                );
                pool.journal_mode()
                    .await
                    .unwrap_or_else(|_| JournalMode::Other("unknown".to_string()))
            }
        };

        init_schema(&pool).await?;

        let mut retrier = Retrier::new(self.write_policy);
        if let Some(observer) = self.observer {
            retrier = retrier.with_observer(observer);
        }

        Ok(ReadingStore::new(pool, retrier, journal_mode, self.db_path))
    }

    /// Open an existing database exactly as it is on disk.
    ///
    /// Neither the file nor its directory is created, the journal mode is read
    /// but never switched, and no schema is applied. Used by the health check.
    pub async fn inspect(self) -> Result<ReadingStore, StorageError> {
        let settings = ConnectSettings {
            max_connections: self.max_connections,
            busy_timeout: self.busy_timeout,
            wal_autocheckpoint: self.wal_autocheckpoint,
            create_if_missing: false,
        };
        let pool = SqlitePool::connect(&self.db_path, &settings).await?;
        let journal_mode = pool.journal_mode().await?;

        Ok(ReadingStore::new(
            pool,
            Retrier::new(self.write_policy),
            journal_mode,
            self.db_path,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_build_enables_wal_and_creates_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("readings.db");

        let store = StorageBuilder::new(&path)
            .max_connections(2)
            .wal_autocheckpoint(250)
            .build()
            .await
            .unwrap();

        assert!(path.exists());
        assert!(store.startup_journal_mode().is_wal());
        assert!(store.journal_mode().await.unwrap().is_wal());
        store.close().await;
    }

    #[tokio::test]
    async fn test_inspect_leaves_rollback_journal_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let pool = SqlitePool::connect(
                &path,
                &ConnectSettings {
                    max_connections: 1,
                    busy_timeout: DEFAULT_BUSY_TIMEOUT,
                    wal_autocheckpoint: DEFAULT_WAL_AUTOCHECKPOINT,
                    create_if_missing: true,
                },
            )
            .await
            .unwrap();
            sqlx::query("PRAGMA journal_mode = DELETE")
                .execute(pool.inner())
                .await
                .unwrap();
            sqlx::query("CREATE TABLE legacy (x INTEGER)")
                .execute(pool.inner())
                .await
                .unwrap();
            pool.close().await;
        }

        let store = StorageBuilder::new(&path).inspect().await.unwrap();
        assert_eq!(store.startup_journal_mode().as_str(), "delete");
        store.probe_write().await.unwrap();
        assert_eq!(store.journal_mode().await.unwrap().as_str(), "delete");
        store.close().await;

        let reopened = StorageBuilder::new(&path).inspect().await.unwrap();
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(reopened.pool().inner())
                .await
                .unwrap();
        assert_eq!(tables, vec!["legacy".to_string()]);
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_inspect_never_creates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("absent.db");
        assert!(StorageBuilder::new(&path).inspect().await.is_err());
        assert!(!path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_build_without_create_rejects_missing_file() {
        let dir = tempdir().unwrap();
        let result = StorageBuilder::new(dir.path().join("absent.db"))
            .create_if_missing(false)
            .build()
            .await;
        assert!(result.is_err());
    }
}
