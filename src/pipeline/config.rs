//! Pipeline configuration from environment variables

use super::ingestion::DEFAULT_FLUSH_THRESHOLD;
use serde::Serialize;
use std::env;

const DEFAULT_CITIES: [&str; 5] = ["Berlin", "NewYork", "Tokyo", "SaoPaulo", "CapeTown"];

/// Longest accepted aggregation interval: one year
pub const MAX_INTERVAL_MINUTES: u64 = 60 * 24 * 365;

/// Longest accepted lookback window: one hundred years
pub const MAX_WINDOW_HOURS: u32 = 24 * 365 * 100;

/// Configuration for the storage side of the pipeline
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `.sql` schema files
    pub schema_dir: String,

    /// Pending readings per city that trigger a flush
    pub flush_threshold: usize,

    pub scheduler: SchedulerConfig,
}

/// Periodic aggregation settings, reported back by the scheduler status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub interval_minutes: u64,
    pub cities: Vec<String>,
    pub enabled: bool,
    /// How far back each pass re-aggregates
    pub window_hours: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            cities: DEFAULT_CITIES.iter().map(|c| c.to_string()).collect(),
            enabled: true,
            window_hours: 24,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `WEATHERFLOW_DB_PATH` (default: data/weather.db)
    /// - `WEATHERFLOW_SCHEMA_DIR` (default: sql)
    /// - `INGESTION_FLUSH_THRESHOLD` (default: 50)
    /// - scheduler variables, see [`SchedulerConfig::from_env`]
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("WEATHERFLOW_DB_PATH")
                .unwrap_or_else(|_| "data/weather.db".to_string()),

            schema_dir: env::var("WEATHERFLOW_SCHEMA_DIR").unwrap_or_else(|_| "sql".to_string()),

            flush_threshold: env::var("INGESTION_FLUSH_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_FLUSH_THRESHOLD),

            scheduler: SchedulerConfig::from_env(),
        }
    }
}

impl SchedulerConfig {
    /// Environment variables:
    /// - `SCHEDULER_INTERVAL_MINUTES` (default: 15, at most [`MAX_INTERVAL_MINUTES`])
    /// - `SCHEDULER_CITIES` comma separated (default: Berlin,NewYork,Tokyo,SaoPaulo,CapeTown)
    /// - `SCHEDULER_ENABLED` anything but `false` enables (default: true)
    /// - `SCHEDULER_TIME_WINDOW_HOURS` (default: 24, at most [`MAX_WINDOW_HOURS`])
    ///
    /// Out-of-range values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cities = env::var("SCHEDULER_CITIES")
            .ok()
            .map(|s| parse_cities(&s))
            .filter(|cities| !cities.is_empty())
            .unwrap_or(defaults.cities);

        Self {
            interval_minutes: env::var("SCHEDULER_INTERVAL_MINUTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &u64| (1..=MAX_INTERVAL_MINUTES).contains(n))
                .unwrap_or(defaults.interval_minutes),

            cities,

            enabled: env::var("SCHEDULER_ENABLED")
                .map(|s| s.trim().to_lowercase() != "false")
                .unwrap_or(true),

            window_hours: env::var("SCHEDULER_TIME_WINDOW_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &u32| *n <= MAX_WINDOW_HOURS)
                .unwrap_or(defaults.window_hours),
        }
    }
}

fn parse_cities(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}
