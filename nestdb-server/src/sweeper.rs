//! Periodic removal of expired keys.

use crate::metrics::Metrics;
use nestdb_core::Database;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

/// Sweeps the expiry index on a fixed interval.
pub struct ExpirySweeper {
    db: Arc<Mutex<Database>>,
    interval: Duration,
    shutdown: AtomicBool,
    notify: Notify,
    keys_expired: AtomicU64,
    sweeps: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl ExpirySweeper {
    /// Creates a sweeper ticking every `interval` (at least 1ms).
    pub fn new(db: Arc<Mutex<Database>>, interval: Duration) -> Self {
        Self {
            db,
            interval: interval.max(Duration::from_millis(1)),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
            keys_expired: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Removes every key whose deadline has passed. Returns how many were
    /// removed.
    pub fn sweep_once(&self) -> usize {
        let expired = self.db.lock().sweep_expired();
        let count = expired.len();

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        if count > 0 {
            self.keys_expired.fetch_add(count as u64, Ordering::Relaxed);
            if let Some(ref metrics) = self.metrics {
                metrics.keys_expired_total.inc_by(count as f64);
            }
            tracing::debug!("Expiry sweep removed {} key(s)", count);
        }
        count
    }

    /// Runs the sweep loop until shutdown.
    pub async fn run(&self) {
        tracing::info!(
            "Expiry sweeper started (interval={}ms)",
            self.interval.as_millis()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = ticker.tick() => {}
            }

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            self.sweep_once();
        }

        tracing::info!("Expiry sweeper stopped");
    }

    /// Signals the sweep loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn stats(&self) -> SweeperStats {
        SweeperStats {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            keys_expired: self.keys_expired.load(Ordering::Relaxed),
        }
    }
}

/// Sweeper counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub keys_expired: u64,
}
