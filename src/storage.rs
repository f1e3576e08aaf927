//! Storage Layer
//!
//! Embedded SQLite storage for sensor readings, opened in WAL mode so
//! collectors can write concurrently while reads never block.
//!
//! # Components
//!
//! - [`StorageBuilder`]: Opens the database, verifies WAL and creates the schema
//! - [`ReadingStore`]: Insert path with duplicate rejection and lock-contention retry
//! - [`Reading`] / [`DeviceId`] / [`SensorType`]: The stored data model

mod builder;
pub mod db;
mod error;
mod schema;
mod store;
mod types;

pub use builder::{DEFAULT_BUSY_TIMEOUT, DEFAULT_WAL_AUTOCHECKPOINT, StorageBuilder};
pub use db::JournalMode;
pub use error::StorageError;
pub use store::{InsertOutcome, ReadingStore};
pub use types::{DeviceId, Measurement, Reading, SensorType};
