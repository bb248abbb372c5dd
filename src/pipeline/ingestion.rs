//! Ingestion buffer - per-city pending readings and batched flushes
//!
//! Readings are appended per city in receipt order. A city whose pending list
//! reaches the flush threshold is marked for flushing; the actual write happens
//! in a deferred task so that every city crossing the threshold in the same
//! tick lands in one coalesced `append_readings` call.
//!
//! Flush pass, per marked city:
//! 1. Skip if a write for the city is already in flight
//! 2. Take the whole pending list (new readings go to a fresh list)
//! 3. Mark in flight, write, clear the mark whatever the outcome
//!
//! A failed write is logged and its batch dropped. Readings are delivered at
//! most once under persistence failure.

use super::db::ReadingStore;
use super::types::Reading;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Default pending count per city that triggers a flush
pub const DEFAULT_FLUSH_THRESHOLD: usize = 50;

#[derive(Default)]
struct BufferState {
    pending: HashMap<String, Vec<Reading>>,
    /// Cities marked for the next flush pass
    to_flush: HashSet<String>,
    /// Cities with a write currently submitted to the store
    in_flight: HashSet<String>,
    /// Deferred flush task that has not yet drained `to_flush`
    scheduled: Option<JoinHandle<()>>,
}

struct BufferInner {
    state: Mutex<BufferState>,
    store: Arc<dyn ReadingStore>,
    threshold: usize,
}

/// Shared handle to the ingestion buffer; clones point at the same buffer
#[derive(Clone)]
pub struct IngestionBuffer {
    inner: Arc<BufferInner>,
}

impl IngestionBuffer {
    pub fn new(store: Arc<dyn ReadingStore>, threshold: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                state: Mutex::new(BufferState::default()),
                store,
                threshold: threshold.max(1),
            }),
        }
    }

    pub fn threshold(&self) -> usize {
        self.inner.threshold
    }

    fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a reading to its city's pending list
    ///
    /// Must be called from within a tokio runtime: crossing the threshold
    /// spawns the deferred flush task.
    pub fn record(&self, reading: Reading) {
        let city = reading.city.clone();
        let mut state = self.lock_state();

        let pending = state.pending.entry(city.clone()).or_default();
        pending.push(reading);
        let pending_len = pending.len();

        if pending_len >= self.inner.threshold {
            state.to_flush.insert(city);

            if state.scheduled.is_none() {
                let buffer = self.clone();
                state.scheduled = Some(tokio::spawn(async move {
                    // Let every record() of this tick land before draining
                    tokio::task::yield_now().await;
                    buffer.run_scheduled_flush().await;
                }));
            }
        }
    }

    /// Number of readings waiting for `city`
    pub fn pending_len(&self, city: &str) -> usize {
        self.lock_state().pending.get(city).map_or(0, Vec::len)
    }

    /// Total readings waiting across all cities
    pub fn total_pending(&self) -> usize {
        self.lock_state().pending.values().map(Vec::len).sum()
    }

    pub fn is_in_flight(&self, city: &str) -> bool {
        self.lock_state().in_flight.contains(city)
    }

    async fn run_scheduled_flush(&self) {
        let cities: Vec<String> = {
            let mut state = self.lock_state();
            state.scheduled = None;
            let cities = state.to_flush.drain().collect();
            cities
        };

        self.flush_cities(cities).await;
    }

    /// Flush everything still buffered, bypassing the threshold
    ///
    /// Used on shutdown. Cancels a deferred flush that has not started yet;
    /// a write already submitted is left alone and its city skipped.
    pub async fn flush_all(&self) {
        let cities: Vec<String> = {
            let mut state = self.lock_state();

            if let Some(handle) = state.scheduled.take() {
                // Still holding the lock: the task has not drained `to_flush`
                handle.abort();
            }
            state.to_flush.clear();

            let cities = state
                .pending
                .iter()
                .filter(|(_, readings)| !readings.is_empty())
                .map(|(city, _)| city.clone())
                .collect();
            cities
        };

        if cities.is_empty() {
            log::debug!("Nothing buffered, skipping final flush");
            return;
        }

        log::info!("🔄 Final flush for {} cities", cities.len());
        self.flush_cities(cities).await;

        let left_behind = self.total_pending();
        if left_behind > 0 {
            log::warn!(
                "⚠️  {} readings left unflushed (cities had writes in flight)",
                left_behind
            );
        }
    }

    /// One flush pass over `cities`: a single multi-city store write
    async fn flush_cities(&self, cities: Vec<String>) {
        let (batch, taken) = {
            let mut state = self.lock_state();
            let mut batch = Vec::new();
            let mut taken = Vec::new();

            for city in cities {
                if state.in_flight.contains(&city) {
                    log::debug!("Write already in flight for {}, skipping", city);
                    continue;
                }

                let readings = state
                    .pending
                    .get_mut(&city)
                    .map(std::mem::take)
                    .unwrap_or_default();

                if readings.is_empty() {
                    continue;
                }

                batch.extend(readings);
                state.in_flight.insert(city.clone());
                taken.push(city);
            }

            // Drop emptied lists so the map does not grow with idle cities
            state.pending.retain(|_, readings| !readings.is_empty());

            (batch, taken)
        };

        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        let result = self.inner.store.append_readings(batch).await;

        {
            let mut state = self.lock_state();
            for city in &taken {
                state.in_flight.remove(city);
            }
        }

        match result {
            Ok(()) => {
                log::debug!("✅ Flushed {} readings for {:?}", count, taken);
            }
            Err(e) => {
                log::error!(
                    "❌ Failed to persist {} readings for {:?}, batch dropped: {}",
                    count,
                    taken,
                    e
                );
            }
        }
    }
}
