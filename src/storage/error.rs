//! Storage-specific error types.
//!
//! All storage operations return [`StorageError`] on failure. Lock and busy
//! errors from SQLite are the only failures the write path retries.

use std::time::Duration;

use thiserror::Error;

use crate::retry::{Classify, ErrorKind};

/// SQLite primary result code for `SQLITE_BUSY`.
const SQLITE_BUSY: i32 = 5;

/// SQLite primary result code for `SQLITE_LOCKED`.
const SQLITE_LOCKED: i32 = 6;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed (sqlx error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid data in database or in a value handed to the store.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Internal error (e.g., directory creation failure).
    #[error("internal error: {0}")]
    Internal(String),

    /// A reading write gave up (retries exhausted or non-retryable failure).
    #[error("write of {device_id} failed ({kind}) after {attempts} attempt(s) in {elapsed:?}: {source}")]
    WriteFailed {
        device_id: String,
        attempts: u32,
        elapsed: Duration,
        kind: ErrorKind,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// `true` for SQLite "database is locked" / "database is busy" failures.
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => {
                let by_code = db
                    .code()
                    .and_then(|c| c.parse::<i32>().ok())
                    .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED));
                let message = db.message().to_ascii_lowercase();
                by_code || message.contains("database is locked") || message.contains("is busy")
            }
            Self::WriteFailed { source, .. } => source.is_lock_contention(),
            _ => false,
        }
    }
}

impl Classify for StorageError {
    /// Lock contention is transient; every other storage failure is permanent,
    /// since retrying e.g. a constraint or I/O failure could duplicate work.
    fn classify(&self) -> ErrorKind {
        if self.is_lock_contention() {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_database_errors_are_permanent() {
        let err = StorageError::InvalidData("bad".to_string());
        assert!(!err.is_lock_contention());
        assert_eq!(err.classify(), ErrorKind::Permanent);

        let err = StorageError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.classify(), ErrorKind::Permanent);
    }

    #[test]
    fn test_write_failed_wraps_source() {
        let err = StorageError::WriteFailed {
            device_id: "hue:sensor1".to_string(),
            attempts: 3,
            elapsed: Duration::from_secs(3),
            kind: ErrorKind::Transient,
            source: Box::new(StorageError::Internal("boom".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.contains("hue:sensor1"));
        assert!(msg.contains("3 attempt(s)"));
        assert!(!err.is_lock_contention());
    }
}
