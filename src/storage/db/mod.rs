//! Database backend.
//!
//! A thin wrapper over sqlx's SQLite pool that owns connection options and
//! journal-mode management. All reading writes go through
//! [`ReadingStore`](crate::storage::ReadingStore), never through this pool directly.

mod sqlite;

pub use sqlite::{ConnectSettings, DEFAULT_MAX_CONNECTIONS, JournalMode, SqlitePool};
