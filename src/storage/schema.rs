//! Database schema definitions.

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;

/// SQL statement for creating the readings table.
///
/// One row per device observation. Sensor columns are nullable so partial
/// readings keep whatever the device reported. The unique key on
/// `(device_id, ts_second)` is the only deduplication mechanism.
pub const READINGS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS readings (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id     TEXT    NOT NULL,
    ts_second     INTEGER NOT NULL,
    timestamp     TEXT    NOT NULL,
    location      TEXT,
    temperature_c REAL,
    humidity_pct  REAL,
    pm25_ugm3     REAL,
    voc_ppb       REAL,
    co_ppm        REAL,
    co2_ppm       REAL,
    iaq           REAL,
    collected_at  INTEGER NOT NULL,
    UNIQUE (device_id, ts_second)
);
"#;

/// Index for "latest readings" queries.
pub const READINGS_TS_INDEX_DDL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_readings_ts ON readings (ts_second DESC);
"#;

/// Scratch table for write probes; rows are always rolled back.
pub const WRITE_PROBE_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS write_probe (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    probed_at INTEGER NOT NULL
);
"#;

/// Initialize the database schema.
///
/// Creates all necessary tables and indexes if they don't exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    for ddl in [
        READINGS_TABLE_DDL,
        READINGS_TS_INDEX_DDL,
        WRITE_PROBE_TABLE_DDL,
    ] {
        sqlx::query(ddl).execute(pool.inner()).await?;
    }
    Ok(())
}
