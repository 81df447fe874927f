//! Periodic eviction of expired records.
//!
//! Two triggers: a dedicated background loop ([`spawn_cleanup`]) and an
//! opportunistic pass fired from the request path after a response has been
//! sent ([`Maintenance::run_if_due`]). Both stay off the request's critical
//! path; `cleanup` is safe to run concurrently with it.

use crate::storage::Storage;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};
use tokio_util::task::AbortOnDropHandle;

/// Tracks when the last opportunistic cleanup ran and fires a new one when
/// the configured interval has elapsed.
pub struct Maintenance {
    interval: Duration,
    batch: usize,
    last_run: Mutex<Instant>,
    running: Arc<AtomicBool>,
}

impl Maintenance {
    /// A zero interval disables opportunistic cleanup entirely.
    pub fn new(interval: Duration, batch: usize) -> Self {
        Self {
            interval,
            batch,
            last_run: Mutex::new(Instant::now()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns a cleanup pass iff the interval has elapsed and no pass is
    /// already in flight. Called after responding, never before.
    pub fn run_if_due(&self, storage: Arc<dyn Storage>) {
        if self.interval.is_zero() {
            return;
        }
        {
            let Ok(mut last_run) = self.last_run.lock() else {
                return;
            };
            if last_run.elapsed() < self.interval {
                return;
            }
            *last_run = Instant::now();
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let running = self.running.clone();
        let batch = self.batch;
        tokio::spawn(async move {
            match storage.cleanup(batch).await {
                Ok(removed) => {
                    tracing::debug!(removed, "housekeeping cleanup pass finished")
                }
                Err(err) => tracing::warn!(error = %err, "housekeeping cleanup pass failed"),
            }
            running.store(false, Ordering::Release);
        });
    }
}

/// Background loop that evicts expired records every `interval`.
pub async fn cleanup_task(storage: Arc<dyn Storage>, interval: Duration, batch: usize) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match storage.cleanup(batch).await {
            Ok(removed) if removed > 0 => {
                tracing::info!(removed, "evicted expired idempotency records")
            }
            Ok(_) => tracing::debug!("no expired idempotency records to evict"),
            Err(err) => tracing::warn!(error = %err, "cleanup pass failed"),
        }
    }
}

/// Spawns [`cleanup_task`] on the current runtime. Dropping the handle stops
/// the loop, so hold it for the lifetime of the service.
pub fn spawn_cleanup(
    storage: Arc<dyn Storage>,
    interval: Duration,
    batch: usize,
) -> AbortOnDropHandle<()> {
    AbortOnDropHandle::new(tokio::spawn(cleanup_task(storage, interval, batch)))
}
