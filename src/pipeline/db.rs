//! Durable store for raw readings and hourly bars
//!
//! Tables written (see `/sql/` directory):
//! - `weather_readings` - UPSERT on (city, timestamp), append-only in practice
//! - `weather_hourly_bars` - UPSERT on (city, hour_start), overwritten by every
//!   aggregation pass
//!
//! Every write call is one transaction: a failure rejects the whole batch and
//! the caller decides what to do with it (the pipeline never retries a
//! partial batch).

use super::aggregation::compute_hourly_bars;
use super::types::{from_millis, HourlyBar, Reading, TimeRange};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema directory not found: {0}")]
    SchemaDirMissing(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Storage contract consumed by the ingestion buffer and the aggregation engine
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Bulk insert of raw readings; the batch may span several cities.
    ///
    /// A duplicate `(city, timestamp)` overwrites the stored temperature.
    async fn append_readings(&self, batch: Vec<Reading>) -> Result<(), StoreError>;

    /// Bulk insert-or-replace of bars keyed by `(city, hour_start)`
    async fn upsert_bars(&self, bars: Vec<HourlyBar>) -> Result<(), StoreError>;

    /// Run the hourly OHLC rollup over stored readings without persisting it
    async fn aggregate_readings(
        &self,
        city: &str,
        range: &TimeRange,
    ) -> Result<Vec<HourlyBar>, StoreError>;

    /// Read already-persisted bars, ascending by `hour_start`
    async fn get_bars(&self, city: &str, range: &TimeRange) -> Result<Vec<HourlyBar>, StoreError>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir` in file-name order and executes
/// them. Files must use `IF NOT EXISTS` so reruns are harmless.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StoreError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(StoreError::SchemaDirMissing(schema_dir.to_string()));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

/// SQLite implementation of [`ReadingStore`]
///
/// One connection behind a mutex. The lock is only held inside a single
/// synchronous statement batch, never across an await.
pub struct SqliteReadingStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReadingStore {
    /// Open the database at `db_path`
    ///
    /// Does NOT create the schema; run [`run_schema_migrations`] first.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied
        // transaction behind (rusqlite rolls back on drop)
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_readings(
        &self,
        city: &str,
        range: &TimeRange,
    ) -> Result<Vec<Reading>, StoreError> {
        let (start, end) = range.as_millis();
        let conn = self.lock_conn();

        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, temperature
             FROM weather_readings
             WHERE city = ?1
               AND (?2 IS NULL OR timestamp >= ?2)
               AND (?3 IS NULL OR timestamp < ?3)
             ORDER BY timestamp ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![city, start, end], |row| {
            Ok(Reading {
                city: city.to_string(),
                timestamp: from_millis(row.get(0)?),
                temperature: row.get(1)?,
            })
        })?;

        let mut readings = Vec::new();
        for row in rows {
            readings.push(row?);
        }

        Ok(readings)
    }
}

#[async_trait]
impl ReadingStore for SqliteReadingStore {
    async fn append_readings(&self, batch: Vec<Reading>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO weather_readings (city, timestamp, temperature, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(city, timestamp) DO UPDATE SET
                     temperature = excluded.temperature",
            )?;

            for reading in &batch {
                stmt.execute(params![
                    reading.city,
                    reading.timestamp.timestamp_millis(),
                    reading.temperature,
                    now,
                ])?;
            }
        }

        tx.commit()?;

        log::debug!("✅ Appended {} readings to SQLite", batch.len());
        Ok(())
    }

    async fn upsert_bars(&self, bars: Vec<HourlyBar>) -> Result<(), StoreError> {
        if bars.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO weather_hourly_bars (city, hour_start, open, high, low, close, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(city, hour_start) DO UPDATE SET
                     open = excluded.open,
                     high = excluded.high,
                     low = excluded.low,
                     close = excluded.close,
                     updated_at = excluded.updated_at",
            )?;

            for bar in &bars {
                stmt.execute(params![
                    bar.city,
                    bar.hour_start.timestamp_millis(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    now,
                ])?;
            }
        }

        tx.commit()?;

        log::debug!("✅ Upserted {} hourly bars", bars.len());
        Ok(())
    }

    async fn aggregate_readings(
        &self,
        city: &str,
        range: &TimeRange,
    ) -> Result<Vec<HourlyBar>, StoreError> {
        let readings = self.load_readings(city, range)?;
        // Rows are already filtered by city and range
        Ok(compute_hourly_bars(city, &readings, &TimeRange::all()))
    }

    async fn get_bars(&self, city: &str, range: &TimeRange) -> Result<Vec<HourlyBar>, StoreError> {
        let (start, end) = range.as_millis();
        let conn = self.lock_conn();

        let mut stmt = conn.prepare_cached(
            "SELECT hour_start, open, high, low, close
             FROM weather_hourly_bars
             WHERE city = ?1
               AND (?2 IS NULL OR hour_start >= ?2)
               AND (?3 IS NULL OR hour_start < ?3)
             ORDER BY hour_start ASC",
        )?;

        let rows = stmt.query_map(params![city, start, end], |row| {
            Ok(HourlyBar {
                city: city.to_string(),
                hour_start: from_millis(row.get(0)?),
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
            })
        })?;

        let mut bars = Vec::new();
        for row in rows {
            bars.push(row?);
        }

        Ok(bars)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tempfile::NamedTempFile;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    /// Helper to create test database with schema applied
    fn create_test_db() -> (NamedTempFile, SqliteReadingStore) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        let mut conn = Connection::open(db_path).unwrap();
        run_schema_migrations(&mut conn, "sql").unwrap();
        drop(conn);

        let store = SqliteReadingStore::new(db_path).unwrap();
        (temp_file, store)
    }

    fn count_rows(path: &Path, table: &str) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();

        run_schema_migrations(&mut conn, "sql").unwrap();
        run_schema_migrations(&mut conn, "sql").unwrap();

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_missing_schema_dir() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();

        let err = run_schema_migrations(&mut conn, "does_not_exist").unwrap_err();
        assert!(matches!(err, StoreError::SchemaDirMissing(_)));
    }

    #[tokio::test]
    async fn test_append_multi_city_batch() {
        let (temp, store) = create_test_db();

        let batch = vec![
            Reading::new("Berlin", ts("2025-06-29T09:05:00Z"), 10.0),
            Reading::new("Tokyo", ts("2025-06-29T09:05:00Z"), 25.0),
            Reading::new("Berlin", ts("2025-06-29T09:06:00Z"), 11.0),
        ];
        store.append_readings(batch).await.unwrap();

        assert_eq!(count_rows(temp.path(), "weather_readings"), 3);
    }

    #[tokio::test]
    async fn test_duplicate_reading_absorbed() {
        let (temp, store) = create_test_db();

        let at = ts("2025-06-29T09:05:00Z");
        store
            .append_readings(vec![Reading::new("Berlin", at, 10.0)])
            .await
            .unwrap();
        store
            .append_readings(vec![Reading::new("Berlin", at, 12.5)])
            .await
            .unwrap();

        assert_eq!(count_rows(temp.path(), "weather_readings"), 1);

        // Last write for the key wins
        let bars = store.aggregate_readings("Berlin", &TimeRange::all()).await.unwrap();
        assert_eq!(bars[0].open, 12.5);
    }

    #[tokio::test]
    async fn test_aggregate_readings_from_sqlite() {
        let (_temp, store) = create_test_db();

        store
            .append_readings(vec![
                Reading::new("Berlin", ts("2025-06-29T09:40:00Z"), 14.0),
                Reading::new("Berlin", ts("2025-06-29T09:05:00Z"), 10.0),
                Reading::new("Berlin", ts("2025-06-29T09:58:00Z"), 8.0),
                Reading::new("Berlin", ts("2025-06-29T10:01:00Z"), 7.0),
                Reading::new("Tokyo", ts("2025-06-29T09:30:00Z"), 30.0),
            ])
            .await
            .unwrap();

        let bars = store.aggregate_readings("Berlin", &TimeRange::all()).await.unwrap();

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].hour_start, ts("2025-06-29T09:00:00Z"));
        assert_eq!(
            (bars[0].open, bars[0].high, bars[0].low, bars[0].close),
            (10.0, 14.0, 8.0, 8.0)
        );
        assert_eq!(bars[1].hour_start, ts("2025-06-29T10:00:00Z"));
        assert_eq!(bars[1].open, 7.0);

        // Range end is exclusive
        let range = TimeRange::new(None, Some(ts("2025-06-29T10:01:00Z")));
        let bars = store.aggregate_readings("Berlin", &range).await.unwrap();
        assert_eq!(bars.len(), 1);
    }

    #[tokio::test]
    async fn test_aggregate_empty_range() {
        let (_temp, store) = create_test_db();

        let bars = store.aggregate_readings("Nowhere", &TimeRange::all()).await.unwrap();
        assert!(bars.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_bars_overwrites() {
        let (temp, store) = create_test_db();
        let hour = ts("2025-06-29T09:00:00Z");

        let mut bar = HourlyBar {
            city: "Berlin".to_string(),
            hour_start: hour,
            open: 10.0,
            high: 14.0,
            low: 8.0,
            close: 8.0,
        };
        store.upsert_bars(vec![bar.clone()]).await.unwrap();

        bar.close = 9.0;
        store.upsert_bars(vec![bar.clone()]).await.unwrap();

        assert_eq!(count_rows(temp.path(), "weather_hourly_bars"), 1);

        let stored = store.get_bars("Berlin", &TimeRange::all()).await.unwrap();
        assert_eq!(stored, vec![bar]);
    }

    #[tokio::test]
    async fn test_get_bars_range_and_order() {
        let (_temp, store) = create_test_db();

        let bars: Vec<HourlyBar> = ["2025-06-29T11:00:00Z", "2025-06-29T09:00:00Z", "2025-06-29T10:00:00Z"]
            .iter()
            .map(|h| HourlyBar {
                city: "Tokyo".to_string(),
                hour_start: ts(h),
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
            })
            .collect();
        store.upsert_bars(bars).await.unwrap();

        let all = store.get_bars("Tokyo", &TimeRange::all()).await.unwrap();
        let hours: Vec<_> = all.iter().map(|b| b.hour_start).collect();
        assert_eq!(
            hours,
            vec![
                ts("2025-06-29T09:00:00Z"),
                ts("2025-06-29T10:00:00Z"),
                ts("2025-06-29T11:00:00Z")
            ]
        );

        let range = TimeRange::new(Some(ts("2025-06-29T10:00:00Z")), Some(ts("2025-06-29T11:00:00Z")));
        let some = store.get_bars("Tokyo", &range).await.unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].hour_start, ts("2025-06-29T10:00:00Z"));
    }
}
