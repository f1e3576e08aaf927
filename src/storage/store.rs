//! Reading store: the single write path into the database.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use strum::IntoEnumIterator;

use crate::retry::{Classify, Retrier, RetryError};
use crate::storage::StorageError;
use crate::storage::db::{JournalMode, SqlitePool};
use crate::storage::schema::WRITE_PROBE_TABLE_DDL;
use crate::storage::types::{DeviceId, Measurement, Reading, SensorType};

const INSERT_READING_SQL: &str = r#"
INSERT INTO readings (
    device_id, ts_second, timestamp, location,
    temperature_c, humidity_pct, pm25_ugm3, voc_ppb, co_ppm, co2_ppm, iaq,
    collected_at
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (device_id, ts_second) DO NOTHING
"#;

const SELECT_COLUMNS: &str = "device_id, timestamp, location, \
     temperature_c, humidity_pct, pm25_ugm3, voc_ppb, co_ppm, co2_ppm, iaq";

/// Result of a successful insert call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written.
    Inserted,
    /// A row with the same device id and second already existed; nothing written.
    Duplicate,
}

/// Storage manager for readings.
///
/// Cheap to clone; clones share the connection pool. Every insert runs inside
/// the write [`Retrier`], which retries SQLite lock/busy errors only.
#[derive(Clone)]
pub struct ReadingStore {
    pool: SqlitePool,
    retrier: Retrier,
    journal_mode: JournalMode,
    path: PathBuf,
}

impl std::fmt::Debug for ReadingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadingStore")
            .field("path", &self.path)
            .field("journal_mode", &self.journal_mode)
            .finish_non_exhaustive()
    }
}

impl ReadingStore {
    pub(crate) fn new(
        pool: SqlitePool,
        retrier: Retrier,
        journal_mode: JournalMode,
        path: PathBuf,
    ) -> Self {
        Self {
            pool,
            retrier,
            journal_mode,
            path,
        }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Journal mode verified when the store was opened.
    pub fn startup_journal_mode(&self) -> &JournalMode {
        &self.journal_mode
    }

    /// `false` when WAL could not be enabled and the store runs with default locking.
    pub fn is_degraded(&self) -> bool {
        !self.journal_mode.is_wal()
    }

    /// Insert a reading, silently rejecting exact duplicates.
    ///
    /// Lock contention is retried per the write policy. When the write finally
    /// fails the error is logged as critical and returned; callers are expected
    /// to log it and carry on with their next cycle.
    pub async fn insert_reading(&self, reading: &Reading) -> Result<InsertOutcome, StorageError> {
        let operation = format!("insert_reading[{}]", reading.device_id);
        let result = self
            .retrier
            .run_with(&operation, StorageError::classify, || self.insert_once(reading))
            .await;

        match result {
            Ok(outcome) => {
                if outcome == InsertOutcome::Duplicate {
                    tracing::debug!(
                        device_id = %reading.device_id,
                        timestamp = %reading.timestamp,
                        "Duplicate reading ignored"
                    );
                }
                Ok(outcome)
            }
            Err(err) => Err(self.write_failed(reading, err)),
        }
    }

    fn write_failed(&self, reading: &Reading, err: RetryError<StorageError>) -> StorageError {
        tracing::error!(
            severity = "critical",
            operation = err.operation(),
            device_id = %reading.device_id,
            timestamp = %reading.timestamp,
            attempts = err.attempts(),
            elapsed_ms = err.elapsed().as_millis() as u64,
            error_kind = err.kind().as_ref(),
            exhausted = err.is_exhausted(),
            error = %err.last_error(),
            "Reading write failed; continuing with next cycle"
        );

        let attempts = err.attempts();
        let elapsed = err.elapsed();
        let kind = err.kind();
        StorageError::WriteFailed {
            device_id: reading.device_id.to_string(),
            attempts,
            elapsed,
            kind,
            source: Box::new(err.into_inner()),
        }
    }

    async fn insert_once(&self, reading: &Reading) -> Result<InsertOutcome, StorageError> {
        let mut query = sqlx::query(INSERT_READING_SQL)
            .bind(reading.device_id.to_string())
            .bind(reading.timestamp_second())
            .bind(reading.timestamp.to_rfc3339())
            .bind(reading.location.as_deref());

        for sensor_type in SensorType::iter() {
            query = query.bind(reading.value(sensor_type));
        }

        let result = query
            .bind(Utc::now().timestamp_millis())
            .execute(self.pool.inner())
            .await?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    /// `true` if a throwaway write succeeds. Nothing is left behind.
    pub async fn write_access_probe(&self) -> bool {
        match self.probe_write().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Write probe failed");
                false
            }
        }
    }

    /// Write a row inside a transaction and roll it back.
    ///
    /// The scratch table is created inside the same transaction, so a database
    /// without it is probed without gaining it.
    pub async fn probe_write(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.inner().begin().await?;
        sqlx::query(WRITE_PROBE_TABLE_DDL).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO write_probe (probed_at) VALUES (?)")
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
        tx.rollback().await?;
        Ok(())
    }

    /// Current journal mode, read from the database.
    pub async fn journal_mode(&self) -> Result<JournalMode, StorageError> {
        self.pool.journal_mode().await
    }

    /// Fetch the reading stored for `device_id` in the same second as `timestamp`.
    pub async fn get_reading(
        &self,
        device_id: &DeviceId,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Reading>, StorageError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM readings WHERE device_id = ? AND ts_second = ?"
        );
        let row = sqlx::query(&sql)
            .bind(device_id.to_string())
            .bind(timestamp.timestamp())
            .fetch_optional(self.pool.inner())
            .await?;

        row.map(|r| row_to_reading(&r)).transpose()
    }

    /// Most recent readings, newest first.
    pub async fn latest_readings(&self, limit: u32) -> Result<Vec<Reading>, StorageError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM readings ORDER BY ts_second DESC, id DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(self.pool.inner())
            .await?;

        rows.iter().map(row_to_reading).collect()
    }

    /// Total stored readings.
    pub async fn count_readings(&self) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM readings")
            .fetch_one(self.pool.inner())
            .await?;
        Ok(count)
    }

    /// Force a WAL checkpoint, truncating the log.
    pub async fn checkpoint(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(self.pool.inner())
            .await?;
        Ok(())
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_reading(row: &SqliteRow) -> Result<Reading, StorageError> {
    let device_id: String = row.try_get("device_id")?;
    let timestamp: String = row.try_get("timestamp")?;
    let location: Option<String> = row.try_get("location")?;

    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| StorageError::InvalidData(format!("stored timestamp '{timestamp}': {e}")))?;

    let mut reading = Reading::new(device_id.parse()?, timestamp);
    reading.location = location;

    for sensor_type in SensorType::iter() {
        let value: Option<f64> = row.try_get(sensor_type.column())?;
        if let Some(value) = value {
            reading.push(Measurement::new(sensor_type, value));
        }
    }

    Ok(reading)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageBuilder;
    use chrono::DateTime;
    use tempfile::{TempDir, tempdir};

    async fn open_store() -> (TempDir, ReadingStore) {
        let dir = tempdir().unwrap();
        let store = StorageBuilder::new(dir.path().join("readings.db"))
            .build()
            .await
            .unwrap();
        (dir, store)
    }

    fn reading(device: &str, ts: &str, temperature: f64) -> Reading {
        Reading::new(
            device.parse().unwrap(),
            DateTime::parse_from_rfc3339(ts).unwrap(),
        )
        .with_measurement(SensorType::Temperature, temperature)
    }

    #[tokio::test]
    async fn test_duplicate_rejection_keeps_first_value() {
        let (_dir, store) = open_store().await;
        let first = reading("hue:sensor1", "2025-01-01T00:00:00Z", 20.5);
        let second = reading("hue:sensor1", "2025-01-01T00:00:00Z", 25.0);

        assert_eq!(store.insert_reading(&first).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_reading(&second).await.unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.count_readings().await.unwrap(), 1);

        let stored = store
            .get_reading(&first.device_id, first.timestamp.with_timezone(&Utc))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.value(SensorType::Temperature), Some(20.5));
    }

    #[tokio::test]
    async fn test_same_second_is_duplicate() {
        let (_dir, store) = open_store().await;
        let a = reading("hue:sensor1", "2025-01-01T00:00:00.100Z", 20.5);
        let b = reading("hue:sensor1", "2025-01-01T00:00:00.900Z", 20.6);

        assert_eq!(store.insert_reading(&a).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_reading(&b).await.unwrap(), InsertOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_fields() {
        let (_dir, store) = open_store().await;
        let original = Reading::new(
            "alexa:aqm-1".parse().unwrap(),
            DateTime::parse_from_rfc3339("2025-03-04T05:06:07+01:00").unwrap(),
        )
        .with_location("Living Room")
        .with_measurement(SensorType::Temperature, 21.37)
        .with_measurement(SensorType::Humidity, 44.12)
        .with_measurement(SensorType::Pm25, 3.0)
        .with_measurement(SensorType::Iaq, 97.0);

        store.insert_reading(&original).await.unwrap();
        let stored = store
            .get_reading(&original.device_id, original.timestamp.with_timezone(&Utc))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored, original);
        assert_eq!(stored.timestamp.offset(), original.timestamp.offset());
    }

    #[tokio::test]
    async fn test_partial_reading_stored_with_nulls() {
        let (_dir, store) = open_store().await;
        let partial = Reading::new(
            "hue:00:17:88:01".parse().unwrap(),
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z").unwrap(),
        )
        .with_measurement(SensorType::Humidity, 40.0);

        store.insert_reading(&partial).await.unwrap();
        let latest = store.latest_readings(10).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].value(SensorType::Humidity), Some(40.0));
        assert_eq!(latest[0].value(SensorType::Temperature), None);
    }

    #[tokio::test]
    async fn test_write_probe_leaves_no_rows() {
        let (_dir, store) = open_store().await;
        assert!(store.write_access_probe().await);
        assert!(store.write_access_probe().await);

        let probes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM write_probe")
            .fetch_one(store.pool.inner())
            .await
            .unwrap();
        assert_eq!(probes, 0);
        assert_eq!(store.count_readings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_latest_readings_order() {
        let (_dir, store) = open_store().await;
        store
            .insert_reading(&reading("hue:a", "2025-01-01T00:00:00Z", 20.0))
            .await
            .unwrap();
        store
            .insert_reading(&reading("hue:b", "2025-01-01T00:05:00Z", 21.0))
            .await
            .unwrap();

        let latest = store.latest_readings(1).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].device_id.to_string(), "hue:b");
        store.checkpoint().await.unwrap();
    }
}
