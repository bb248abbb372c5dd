//! Core data types for the ingestion and rollup pipeline

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds in one clock hour
pub const HOUR_MS: i64 = 60 * 60 * 1000;

/// One temperature observation for a city
///
/// Unique by `(city, timestamp)` once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub city: String,
    pub timestamp: DateTime<Utc>,
    /// Degrees Celsius
    pub temperature: f64,
}

impl Reading {
    pub fn new(city: impl Into<String>, timestamp: DateTime<Utc>, temperature: f64) -> Self {
        Self {
            city: city.into(),
            timestamp,
            temperature,
        }
    }

    /// Start of the clock hour this reading belongs to
    pub fn hour_start(&self) -> DateTime<Utc> {
        truncate_to_hour(self.timestamp)
    }
}

/// Hourly open/high/low/close rollup for one city
///
/// Unique by `(city, hour_start)`. `open` is the earliest reading in the hour,
/// `close` the latest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyBar {
    pub city: String,
    pub hour_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Half-open time range `[start, end)`; either bound may be open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    /// Unbounded on both sides
    pub fn all() -> Self {
        Self::default()
    }

    /// `[end - hours, end)`
    ///
    /// A window reaching past the earliest representable instant leaves the
    /// start open.
    pub fn lookback(end: DateTime<Utc>, hours: u32) -> Self {
        Self {
            start: end.checked_sub_signed(chrono::Duration::hours(i64::from(hours))),
            end: Some(end),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts < e)
    }

    /// Bounds as epoch milliseconds, as stored in SQLite
    pub fn as_millis(&self) -> (Option<i64>, Option<i64>) {
        (
            self.start.map(|s| s.timestamp_millis()),
            self.end.map(|e| e.timestamp_millis()),
        )
    }
}

/// Truncate a timestamp to the start of its clock hour (UTC)
pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(hour_bucket_millis(ts.timestamp_millis()))
}

/// Hour bucket key for an epoch-millisecond timestamp
pub fn hour_bucket_millis(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(HOUR_MS)
}

/// Epoch milliseconds back to a UTC timestamp
///
/// Out-of-range values clamp to the Unix epoch; SQLite rows are always written
/// from valid `DateTime<Utc>` values so this never triggers in practice.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}
