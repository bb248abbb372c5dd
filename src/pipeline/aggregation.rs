//! Hourly OHLC rollup of raw readings
//!
//! ```text
//! weather_readings ──aggregate_readings──▶ Vec<HourlyBar> ──upsert_bars──▶ weather_hourly_bars
//! ```
//!
//! `compute_hourly_bars` is the algorithm itself (pure, no I/O). The
//! `AggregationService` wraps it with persistence for the scheduler and the
//! query-time fallback.

use super::db::{ReadingStore, StoreError};
use super::types::{from_millis, hour_bucket_millis, HourlyBar, Reading, TimeRange};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Failed to read readings for {city}: {source}")]
    Read {
        city: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to read hourly bars for {city}: {source}")]
    ReadBars {
        city: String,
        #[source]
        source: StoreError,
    },
}

/// Running OHLC state for one hour bucket
struct BarAccumulator {
    open_ts: i64,
    open: f64,
    close_ts: i64,
    close: f64,
    high: f64,
    low: f64,
}

impl BarAccumulator {
    fn new(ts: i64, temperature: f64) -> Self {
        Self {
            open_ts: ts,
            open: temperature,
            close_ts: ts,
            close: temperature,
            high: temperature,
            low: temperature,
        }
    }

    fn add(&mut self, ts: i64, temperature: f64) {
        // Equal timestamps: first seen stays open, last seen becomes close
        if ts < self.open_ts {
            self.open_ts = ts;
            self.open = temperature;
        }
        if ts >= self.close_ts {
            self.close_ts = ts;
            self.close = temperature;
        }
        self.high = self.high.max(temperature);
        self.low = self.low.min(temperature);
    }
}

/// Roll readings up into hourly bars for one city
///
/// Readings for other cities or outside `range` are ignored. Input order does
/// not matter except to break timestamp ties. Output is ascending by
/// `hour_start`, one bar per non-empty hour.
pub fn compute_hourly_bars(city: &str, readings: &[Reading], range: &TimeRange) -> Vec<HourlyBar> {
    let mut buckets: BTreeMap<i64, BarAccumulator> = BTreeMap::new();

    for reading in readings
        .iter()
        .filter(|r| r.city == city && range.contains(r.timestamp))
    {
        let ts = reading.timestamp.timestamp_millis();
        buckets
            .entry(hour_bucket_millis(ts))
            .and_modify(|acc| acc.add(ts, reading.temperature))
            .or_insert_with(|| BarAccumulator::new(ts, reading.temperature));
    }

    buckets
        .into_iter()
        .map(|(hour, acc)| HourlyBar {
            city: city.to_string(),
            hour_start: from_millis(hour),
            open: acc.open,
            high: acc.high,
            low: acc.low,
            close: acc.close,
        })
        .collect()
}

/// Aggregation + persistence over a [`ReadingStore`]
pub struct AggregationService {
    store: Arc<dyn ReadingStore>,
}

impl AggregationService {
    pub fn new(store: Arc<dyn ReadingStore>) -> Self {
        Self { store }
    }

    /// Roll up `range` for `city` and persist the bars
    ///
    /// Returns:
    /// - `Ok(true)` when there was nothing to aggregate (no write issued) or
    ///   the upsert succeeded
    /// - `Ok(false)` when the upsert failed
    /// - `Err(..)` when the readings could not be read
    ///
    /// Reruns over overlapping ranges overwrite earlier bars with whatever raw
    /// data exists now.
    pub async fn pre_aggregate(&self, city: &str, range: &TimeRange) -> Result<bool, AggregationError> {
        log::info!("🔄 Pre-aggregating readings for city: {}", city);

        let bars = self
            .store
            .aggregate_readings(city, range)
            .await
            .map_err(|source| AggregationError::Read {
                city: city.to_string(),
                source,
            })?;

        if bars.is_empty() {
            log::info!("   └─ No data to aggregate for city: {}", city);
            return Ok(true);
        }

        let count = bars.len();
        match self.store.upsert_bars(bars).await {
            Ok(()) => {
                log::info!("✅ Pre-aggregated {} hourly bars for city: {}", count, city);
                Ok(true)
            }
            Err(e) => {
                log::error!("❌ Failed to save {} hourly bars for city {}: {}", count, city, e);
                Ok(false)
            }
        }
    }

    /// On-demand rollup, nothing persisted
    pub async fn aggregated_bars(&self, city: &str, range: &TimeRange) -> Result<Vec<HourlyBar>, AggregationError> {
        let bars = self
            .store
            .aggregate_readings(city, range)
            .await
            .map_err(|source| AggregationError::Read {
                city: city.to_string(),
                source,
            })?;

        log::debug!("Computed {} hourly bars on demand for city: {}", bars.len(), city);
        Ok(bars)
    }

    /// Query path: persisted bars when any exist for the range, otherwise
    /// an on-demand rollup
    pub async fn candle_bars(
        &self,
        city: &str,
        range: &TimeRange,
        use_pre_aggregated: bool,
    ) -> Result<Vec<HourlyBar>, AggregationError> {
        if use_pre_aggregated {
            let stored = self
                .store
                .get_bars(city, range)
                .await
                .map_err(|source| AggregationError::ReadBars {
                    city: city.to_string(),
                    source,
                })?;

            if !stored.is_empty() {
                log::debug!("Using pre-aggregated bars for city: {}", city);
                return Ok(stored);
            }
        }

        log::debug!("Using real-time aggregation for city: {}", city);
        self.aggregated_bars(city, range).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::mock::MemoryStore;
    use chrono::{DateTime, Utc};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn reading(city: &str, at: &str, temperature: f64) -> Reading {
        Reading::new(city, ts(at), temperature)
    }

    fn berlin_morning() -> Vec<Reading> {
        vec![
            reading("Berlin", "2025-06-29T09:05:00Z", 10.0),
            reading("Berlin", "2025-06-29T09:40:00Z", 14.0),
            reading("Berlin", "2025-06-29T09:58:00Z", 8.0),
        ]
    }

    #[test]
    fn test_berlin_scenario() {
        let bars = compute_hourly_bars("Berlin", &berlin_morning(), &TimeRange::all());

        assert_eq!(
            bars,
            vec![HourlyBar {
                city: "Berlin".to_string(),
                hour_start: ts("2025-06-29T09:00:00Z"),
                open: 10.0,
                high: 14.0,
                low: 8.0,
                close: 8.0,
            }]
        );
    }

    #[test]
    fn test_open_close_follow_timestamps_not_input_order() {
        let readings = vec![
            reading("Berlin", "2025-06-29T09:58:00Z", 8.0),
            reading("Berlin", "2025-06-29T09:05:00Z", 10.0),
            reading("Berlin", "2025-06-29T09:40:00Z", 14.0),
        ];

        let bar = &compute_hourly_bars("Berlin", &readings, &TimeRange::all())[0];
        assert_eq!(bar.open, 10.0);
        assert_eq!(bar.close, 8.0);
        assert!(bar.low <= bar.open.min(bar.close));
        assert!(bar.high >= bar.open.max(bar.close));
    }

    #[test]
    fn test_multiple_hours_ascending_and_sparse() {
        let readings = vec![
            reading("Tokyo", "2025-06-29T13:10:00Z", 30.0),
            reading("Tokyo", "2025-06-29T09:10:00Z", 20.0),
            reading("Tokyo", "2025-06-29T09:20:00Z", 22.0),
            reading("Berlin", "2025-06-29T11:00:00Z", 5.0),
        ];

        let bars = compute_hourly_bars("Tokyo", &readings, &TimeRange::all());

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].hour_start, ts("2025-06-29T09:00:00Z"));
        assert_eq!(bars[1].hour_start, ts("2025-06-29T13:00:00Z"));
        assert_eq!(bars[1].open, 30.0);
        assert_eq!(bars[1].close, 30.0);
    }

    #[test]
    fn test_timestamp_tie_is_deterministic() {
        let readings = vec![
            reading("Berlin", "2025-06-29T09:30:00Z", 1.0),
            reading("Berlin", "2025-06-29T09:30:00Z", 2.0),
        ];

        let bar = &compute_hourly_bars("Berlin", &readings, &TimeRange::all())[0];
        assert_eq!(bar.open, 1.0);
        assert_eq!(bar.close, 2.0);
    }

    #[test]
    fn test_range_filter() {
        let range = TimeRange::new(Some(ts("2025-06-29T09:10:00Z")), Some(ts("2025-06-29T09:58:00Z")));
        let bars = compute_hourly_bars("Berlin", &berlin_morning(), &range);

        // Only the 09:40 reading is inside [09:10, 09:58)
        assert_eq!(bars.len(), 1);
        assert_eq!((bars[0].open, bars[0].close), (14.0, 14.0));
    }

    #[test]
    fn test_empty_input() {
        assert!(compute_hourly_bars("Berlin", &[], &TimeRange::all()).is_empty());
    }

    #[test]
    fn test_rerun_is_bitwise_identical() {
        let readings = vec![
            reading("Berlin", "2025-06-29T09:05:00Z", 10.123456789),
            reading("Berlin", "2025-06-29T09:40:00Z", -3.3),
            reading("Berlin", "2025-06-29T09:58:00Z", 0.1 + 0.2),
        ];

        let first = compute_hourly_bars("Berlin", &readings, &TimeRange::all());
        let second = compute_hourly_bars("Berlin", &readings, &TimeRange::all());

        let bits = |b: &HourlyBar| {
            [b.open.to_bits(), b.high.to_bits(), b.low.to_bits(), b.close.to_bits()]
        };
        assert_eq!(bits(&first[0]), bits(&second[0]));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_pre_aggregate_nothing_to_do() {
        let store = MemoryStore::new();
        let service = AggregationService::new(store.clone());

        assert!(service.pre_aggregate("Berlin", &TimeRange::all()).await.unwrap());
        assert_eq!(store.upsert_call_count(), 0);
    }

    #[tokio::test]
    async fn test_pre_aggregate_persists_bars() {
        let store = MemoryStore::new();
        store.append_readings(berlin_morning()).await.unwrap();
        let service = AggregationService::new(store.clone());

        assert!(service.pre_aggregate("Berlin", &TimeRange::all()).await.unwrap());
        assert_eq!(store.upsert_call_count(), 1);

        let stored = store.get_bars("Berlin", &TimeRange::all()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].close, 8.0);
    }

    #[tokio::test]
    async fn test_pre_aggregate_picks_up_late_readings() {
        let store = MemoryStore::new();
        store.append_readings(berlin_morning()).await.unwrap();
        let service = AggregationService::new(store.clone());

        service.pre_aggregate("Berlin", &TimeRange::all()).await.unwrap();
        store
            .append_readings(vec![reading("Berlin", "2025-06-29T09:59:00Z", 20.0)])
            .await
            .unwrap();
        service.pre_aggregate("Berlin", &TimeRange::all()).await.unwrap();

        let stored = store.get_bars("Berlin", &TimeRange::all()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!((stored[0].high, stored[0].close), (20.0, 20.0));
    }

    #[tokio::test]
    async fn test_pre_aggregate_persist_failure_returns_false() {
        let store = MemoryStore::new();
        store.append_readings(berlin_morning()).await.unwrap();
        store.fail_upserts_for("Berlin");
        let service = AggregationService::new(store.clone());

        assert!(!service.pre_aggregate("Berlin", &TimeRange::all()).await.unwrap());
    }

    #[tokio::test]
    async fn test_pre_aggregate_read_failure_is_error() {
        let store = MemoryStore::new();
        store.fail_reads_for("Berlin");
        let service = AggregationService::new(store.clone());

        let err = service.pre_aggregate("Berlin", &TimeRange::all()).await.unwrap_err();
        assert!(matches!(err, AggregationError::Read { .. }));
    }

    #[tokio::test]
    async fn test_candle_bars_fallback() {
        let store = MemoryStore::new();
        store.append_readings(berlin_morning()).await.unwrap();
        let service = AggregationService::new(store.clone());

        // Nothing persisted yet: computed on demand
        let bars = service.candle_bars("Berlin", &TimeRange::all(), true).await.unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(store.upsert_call_count(), 0);

        // Persisted bars win once they exist, even if stale
        service.pre_aggregate("Berlin", &TimeRange::all()).await.unwrap();
        store
            .append_readings(vec![reading("Berlin", "2025-06-29T09:59:00Z", 20.0)])
            .await
            .unwrap();

        let stored = service.candle_bars("Berlin", &TimeRange::all(), true).await.unwrap();
        assert_eq!(stored[0].close, 8.0);

        let live = service.candle_bars("Berlin", &TimeRange::all(), false).await.unwrap();
        assert_eq!(live[0].close, 20.0);
    }
}
