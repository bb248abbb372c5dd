//! # Weather Pipeline
//!
//! Turns the raw reading stream into hourly OHLC temperature bars:
//! 1. `ingestion` buffers readings per city and writes them in batches
//! 2. `db` persists raw readings and bars (SQLite, see `/sql/`)
//! 3. `aggregation` rolls readings up into one bar per (city, hour)
//! 4. `scheduler` re-runs the rollup over a lookback window on a timer
//!
//! Bars are derived data: they can always be rebuilt from stored readings,
//! and re-aggregating the same readings yields identical bars.
//!
//! ## Module Organization
//!
//! - `types` - Reading, HourlyBar, TimeRange and hour truncation
//! - `config` - Environment configuration
//! - `db` - Store trait, SQLite implementation and schema migrations
//! - `ingestion` - Per-city buffer with coalesced flushes
//! - `aggregation` - OHLC computation and the aggregation service
//! - `scheduler` - Periodic and manual aggregation passes

pub mod aggregation;
pub mod config;
pub mod db;
pub mod ingestion;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use aggregation::{compute_hourly_bars, AggregationError, AggregationService};
pub use config::{PipelineConfig, SchedulerConfig};
pub use db::{ReadingStore, SqliteReadingStore, StoreError};
pub use ingestion::IngestionBuffer;
pub use scheduler::{AggregationScheduler, LocationOutcome, PassReport, SchedulerStatus};
pub use types::{HourlyBar, Reading, TimeRange};
