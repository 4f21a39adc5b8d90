use crate::scalable::ScalablePool;
use chrono::Utc;
use driftwatch_types::AutoscaleConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Aggregate health-checker counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckerStatsSnapshot {
    pub checks: u64,
    pub replacements: u64,
}

/// Watches pool workers and replaces the ones that went silent.
///
/// A worker whose `last_activity` is older than the health interval while
/// its pool still has queued work is presumed stuck and replaced with a
/// fresh one.
pub struct HealthChecker {
    config: AutoscaleConfig,
    pools: Vec<Arc<ScalablePool>>,
    checks: AtomicU64,
    replacements: AtomicU64,
    running: AtomicBool,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    self_ref: parking_lot::RwLock<Weak<Self>>,
}

impl HealthChecker {
    pub fn new(config: AutoscaleConfig, pools: Vec<Arc<ScalablePool>>) -> Arc<Self> {
        let checker = Arc::new(Self {
            config,
            pools,
            checks: AtomicU64::new(0),
            replacements: AtomicU64::new(0),
            running: AtomicBool::new(false),
            task: parking_lot::Mutex::new(None),
            self_ref: parking_lot::RwLock::new(Weak::new()),
        });
        *checker.self_ref.write() = Arc::downgrade(&checker);
        checker
    }

    fn handle(&self) -> Arc<Self> {
        self.self_ref
            .read()
            .upgrade()
            .expect("self reference is set at construction")
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("health checker already running");
            return;
        }
        info!(
            pools = self.pools.len(),
            interval_ms = self.config.health_interval.as_millis() as u64,
            "starting worker health checker"
        );
        let checker = self.handle();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(checker.config.health_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            while checker.running.load(Ordering::Acquire) {
                interval.tick().await;
                checker.check_all();
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        info!("worker health checker stopped");
    }

    /// Run one pass over every pool.
    pub fn check_all(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let silence_limit =
            chrono::Duration::from_std(self.config.health_interval).unwrap_or_else(|_| {
                chrono::Duration::seconds(10)
            });

        for pool in &self.pools {
            let stats = pool.stats();
            if stats.queue_depth == 0 {
                // nothing queued: silence is idleness, not sickness
                continue;
            }
            let now = Utc::now();
            for worker in &stats.workers {
                if now - worker.last_activity > silence_limit {
                    warn!(
                        pool_id = %stats.pool_id,
                        worker_id = %worker.worker_id,
                        last_activity = %worker.last_activity,
                        "worker silent with queued work; replacing"
                    );
                    if pool.replace_worker(&worker.worker_id) {
                        self.replacements.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> HealthCheckerStatsSnapshot {
        HealthCheckerStatsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
        }
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
