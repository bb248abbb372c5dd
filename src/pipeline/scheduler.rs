//! Aggregation scheduler - periodic and manual hourly rollups
//!
//! While running, a pass executes immediately and then every
//! `interval_minutes`. Each pass re-aggregates the last `window_hours` for
//! every configured city concurrently; one city failing never stops the
//! others.
//!
//! Passes are spawned independently of the timer, so a pass still running
//! when the next tick fires overlaps with the new one. Bar upserts are keyed
//! and idempotent, which keeps overlapping passes harmless.

use super::aggregation::{AggregationError, AggregationService};
use super::config::{SchedulerConfig, MAX_INTERVAL_MINUTES};
use super::types::TimeRange;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Result of one city's aggregation inside a pass
#[derive(Debug, Clone, PartialEq)]
pub enum LocationOutcome {
    /// Bars persisted, or nothing to aggregate
    Aggregated,
    /// The bar upsert was rejected by the store
    Rejected,
    /// Reading the raw data failed
    Failed(String),
}

impl LocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, LocationOutcome::Aggregated)
    }
}

/// Per-city outcomes of one pass, in configured city order
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub outcomes: Vec<(String, LocationOutcome)>,
}

impl PassReport {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }
}

/// Snapshot returned to the API layer; recomputed on every call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub config: SchedulerConfig,
    /// `now + interval`, an approximation of the next timer fire
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_time: Option<DateTime<Utc>>,
}

/// Run one aggregation pass over every configured city
///
/// All cities are issued at once and every outcome is collected; there is
/// no early abort and no retry within the pass.
pub async fn run_pass(service: &AggregationService, config: &SchedulerConfig) -> PassReport {
    log::info!("🔄 Starting periodic aggregation for {} cities", config.cities.len());

    let range = TimeRange::lookback(Utc::now(), config.window_hours);
    let range = &range;

    let jobs = config.cities.iter().map(|city| async move {
        let outcome = match service.pre_aggregate(city, range).await {
            Ok(true) => {
                log::debug!("✅ Aggregated data for {}", city);
                LocationOutcome::Aggregated
            }
            Ok(false) => {
                log::warn!("⚠️  Aggregation returned false for {}", city);
                LocationOutcome::Rejected
            }
            Err(e) => {
                log::error!("❌ Aggregation failed for {}: {}", city, e);
                LocationOutcome::Failed(e.to_string())
            }
        };
        (city.clone(), outcome)
    });

    let report = PassReport {
        outcomes: join_all(jobs).await,
    };

    log::info!(
        "📊 Aggregation completed - Success: {}, Failures: {}",
        report.success_count(),
        report.failure_count()
    );

    report
}

/// Timer period in minutes, clamped the same way `SchedulerConfig::from_env` bounds it
fn clamped_interval_minutes(config: &SchedulerConfig) -> u64 {
    config.interval_minutes.clamp(1, MAX_INTERVAL_MINUTES)
}

/// Owns the periodic aggregation timer
pub struct AggregationScheduler {
    service: Arc<AggregationService>,
    config: SchedulerConfig,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl AggregationScheduler {
    pub fn new(service: Arc<AggregationService>, config: SchedulerConfig) -> Self {
        Self {
            service,
            config,
            timer: Mutex::new(None),
        }
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.lock_timer().is_some()
    }

    /// Start the periodic timer; the first pass runs immediately
    ///
    /// No-op when already running or disabled by configuration.
    pub fn start(&self) {
        let mut timer = self.lock_timer();

        if timer.is_some() {
            log::warn!("⚠️  Scheduler is already running");
            return;
        }

        if !self.config.enabled {
            log::info!("Scheduler is disabled");
            return;
        }

        log::info!(
            "🚀 Starting scheduler - every {} minutes for cities: {}",
            self.config.interval_minutes,
            self.config.cities.join(", ")
        );

        let service = self.service.clone();
        let config = self.config.clone();
        let period = Duration::from_secs(clamped_interval_minutes(&config) * 60);

        *timer = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // First tick completes immediately
                ticker.tick().await;

                let service = service.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    run_pass(&service, &config).await;
                });
            }
        }));

        log::info!("✅ Scheduler started");
    }

    /// Cancel the periodic timer; passes already running are not interrupted
    pub fn stop(&self) {
        match self.lock_timer().take() {
            Some(handle) => {
                handle.abort();
                log::info!("Scheduler stopped");
            }
            None => {
                log::warn!("⚠️  Scheduler is not running");
            }
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let is_running = self.is_running();
        let interval = chrono::Duration::minutes(clamped_interval_minutes(&self.config) as i64);
        let next_run_time = if is_running {
            Utc::now().checked_add_signed(interval)
        } else {
            None
        };

        SchedulerStatus {
            is_running,
            config: self.config.clone(),
            next_run_time,
        }
    }

    /// Caller-triggered aggregation for one city; errors reach the caller
    pub async fn aggregate_city(
        &self,
        city: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<bool, AggregationError> {
        log::info!("Manual aggregation for city: {}", city);

        match self.service.pre_aggregate(city, &TimeRange::new(start, end)).await {
            Ok(true) => {
                log::info!("✅ Manual aggregation successful for {}", city);
                Ok(true)
            }
            Ok(false) => {
                log::warn!("⚠️  Manual aggregation returned false for {}", city);
                Ok(false)
            }
            Err(e) => {
                log::error!("❌ Manual aggregation failed for {}: {}", city, e);
                Err(e)
            }
        }
    }
}

impl Drop for AggregationScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_timer().take() {
            handle.abort();
        }
    }
}
