use crate::scalable::ScalablePool;
use dashmap::DashMap;
use driftwatch_types::AutoscaleConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one autoscaling evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleDecision {
    ScaleUp,
    ScaleDown,
    Stable,
}

/// Signals gathered for one pool before deciding.
#[derive(Debug, Clone)]
pub struct PoolSignals {
    pub utilization: f64,
    pub queue_depth: usize,
    pub avg_response_time_ms: u64,
    pub cpu_fraction: f64,
    pub memory_fraction: f64,
}

struct ScaleState {
    last_up: Option<Instant>,
    last_down: Option<Instant>,
    /// Exponentially smoothed utilization; advisory only
    ema_utilization: f64,
}

/// Aggregate autoscaler counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerStatsSnapshot {
    pub evaluations: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
}

/// Periodically inspects each registered pool and resizes it within
/// `[min_workers, max_workers]`.
///
/// Scale-up triggers on high utilization, a deep queue, or system CPU /
/// memory over their limits; scale-down requires low utilization, a short
/// queue, and an elapsed cooldown. Cooldowns default to 30 s up / 60 s
/// down.
pub struct Autoscaler {
    config: AutoscaleConfig,
    pools: Vec<Arc<ScalablePool>>,
    states: DashMap<String, ScaleState>,
    evaluations: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
    running: AtomicBool,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    self_ref: parking_lot::RwLock<Weak<Self>>,
}

impl Autoscaler {
    pub fn new(config: AutoscaleConfig, pools: Vec<Arc<ScalablePool>>) -> Arc<Self> {
        let scaler = Arc::new(Self {
            config,
            pools,
            states: DashMap::new(),
            evaluations: AtomicU64::new(0),
            scale_ups: AtomicU64::new(0),
            scale_downs: AtomicU64::new(0),
            running: AtomicBool::new(false),
            task: parking_lot::Mutex::new(None),
            self_ref: parking_lot::RwLock::new(Weak::new()),
        });
        *scaler.self_ref.write() = Arc::downgrade(&scaler);
        scaler
    }

    fn handle(&self) -> Arc<Self> {
        self.self_ref
            .read()
            .upgrade()
            .expect("self reference is set at construction")
    }

    /// Start the evaluation loop.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("autoscaler already running");
            return;
        }
        info!(
            pools = self.pools.len(),
            interval_ms = self.config.check_interval.as_millis() as u64,
            "starting autoscaler"
        );
        let scaler = self.handle();
        let handle = tokio::spawn(async move {
            let mut system = System::new();
            let mut interval = tokio::time::interval(scaler.config.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            while scaler.running.load(Ordering::Acquire) {
                interval.tick().await;
                system.refresh_cpu_usage();
                system.refresh_memory();
                let cpu_fraction = system.global_cpu_usage() as f64 / 100.0;
                let memory_fraction =
                    system.used_memory() as f64 / system.total_memory().max(1) as f64;
                scaler.evaluate_all(cpu_fraction, memory_fraction);
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
        info!("autoscaler stopped");
    }

    /// Evaluate and resize every pool with the given system fractions.
    pub fn evaluate_all(&self, cpu_fraction: f64, memory_fraction: f64) {
        for pool in &self.pools {
            let stats = pool.stats();
            let signals = PoolSignals {
                utilization: stats.utilization(),
                queue_depth: stats.queue_depth,
                avg_response_time_ms: stats.avg_response_time_ms,
                cpu_fraction,
                memory_fraction,
            };
            self.evaluate_pool(pool, &signals);
        }
    }

    fn evaluate_pool(&self, pool: &Arc<ScalablePool>, signals: &PoolSignals) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let mut state = self
            .states
            .entry(pool.id().to_string())
            .or_insert_with(|| ScaleState {
                last_up: None,
                last_down: None,
                ema_utilization: signals.utilization,
            });
        state.ema_utilization =
            0.7 * state.ema_utilization + 0.3 * signals.utilization;

        let decision = self.decide(signals);
        debug!(
            pool_id = %pool.id(),
            utilization = signals.utilization,
            smoothed = state.ema_utilization,
            queue_depth = signals.queue_depth,
            decision = ?decision,
            "autoscale evaluation"
        );

        match decision {
            ScaleDecision::ScaleUp => {
                let cooled = state
                    .last_up
                    .map(|at| at.elapsed() >= self.config.scale_up_cooldown)
                    .unwrap_or(true);
                if cooled && pool.scale_up(1) > 0 {
                    state.last_up = Some(Instant::now());
                    self.scale_ups.fetch_add(1, Ordering::Relaxed);
                }
            }
            ScaleDecision::ScaleDown => {
                let cooled = state
                    .last_down
                    .map(|at| at.elapsed() >= self.config.scale_down_cooldown)
                    .unwrap_or(true);
                if cooled && pool.scale_down(1) > 0 {
                    state.last_down = Some(Instant::now());
                    self.scale_downs.fetch_add(1, Ordering::Relaxed);
                }
            }
            ScaleDecision::Stable => {}
        }
    }

    /// Pure decision function over the gathered signals.
    pub fn decide(&self, signals: &PoolSignals) -> ScaleDecision {
        let scale_up = signals.utilization > self.config.scale_up_threshold
            || signals.queue_depth > self.config.queue_depth_threshold
            || signals.memory_fraction > self.config.memory_threshold
            || signals.cpu_fraction > self.config.cpu_threshold;
        if scale_up {
            return ScaleDecision::ScaleUp;
        }

        let queue_short = signals.queue_depth <= self.config.queue_depth_threshold / 4;
        if signals.utilization < self.config.scale_down_threshold && queue_short {
            return ScaleDecision::ScaleDown;
        }

        ScaleDecision::Stable
    }

    pub fn stats(&self) -> AutoscalerStatsSnapshot {
        AutoscalerStatsSnapshot {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            scale_ups: self.scale_ups.load(Ordering::Relaxed),
            scale_downs: self.scale_downs.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Autoscaler {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalable::Processor;
    use async_trait::async_trait;
    use driftwatch_types::{WorkItem, WorkResult};
    use std::time::Duration;

    struct NoopProcessor;

    #[async_trait]
    impl Processor for NoopProcessor {
        async fn process(&self, item: &WorkItem) -> WorkResult {
            WorkResult::success(item.id.clone(), "noop", None, Duration::ZERO)
        }

        fn name(&self) -> &str {
            "noop"
        }
    }

    fn quiet_signals() -> PoolSignals {
        PoolSignals {
            utilization: 0.1,
            queue_depth: 0,
            avg_response_time_ms: 5,
            cpu_fraction: 0.2,
            memory_fraction: 0.3,
        }
    }

    fn scaler_with_pool(
        config: AutoscaleConfig,
    ) -> (Arc<Autoscaler>, Arc<ScalablePool>) {
        let (pool, _results) = ScalablePool::new(
            "scaled",
            config.clone(),
            8,
            Arc::new(NoopProcessor),
            None,
        );
        pool.start();
        let scaler = Autoscaler::new(config, vec![pool.clone()]);
        (scaler, pool)
    }

    #[test]
    fn test_decision_thresholds() {
        let scaler = Autoscaler::new(AutoscaleConfig::default(), Vec::new());

        let mut busy = quiet_signals();
        busy.utilization = 0.95;
        assert_eq!(scaler.decide(&busy), ScaleDecision::ScaleUp);

        let mut deep_queue = quiet_signals();
        deep_queue.queue_depth = 1000;
        assert_eq!(scaler.decide(&deep_queue), ScaleDecision::ScaleUp);

        let mut memory_pressed = quiet_signals();
        memory_pressed.memory_fraction = 0.95;
        assert_eq!(scaler.decide(&memory_pressed), ScaleDecision::ScaleUp);

        assert_eq!(scaler.decide(&quiet_signals()), ScaleDecision::ScaleDown);

        let mut steady = quiet_signals();
        steady.utilization = 0.5;
        assert_eq!(scaler.decide(&steady), ScaleDecision::Stable);
    }

    #[tokio::test]
    async fn test_bounds_hold_under_scaling() {
        let config = AutoscaleConfig {
            min_workers: 1,
            max_workers: 3,
            initial_workers: 2,
            scale_up_cooldown: Duration::ZERO,
            scale_down_cooldown: Duration::ZERO,
            ..Default::default()
        };
        let (scaler, pool) = scaler_with_pool(config);

        let mut busy = quiet_signals();
        busy.utilization = 1.0;
        for _ in 0..10 {
            scaler.evaluate_pool(&pool, &busy);
        }
        assert_eq!(pool.current_workers(), 3);

        for _ in 0..10 {
            scaler.evaluate_pool(&pool, &quiet_signals());
        }
        assert_eq!(pool.current_workers(), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_cooldown_gates_scaling() {
        let config = AutoscaleConfig {
            min_workers: 1,
            max_workers: 8,
            initial_workers: 1,
            scale_up_cooldown: Duration::from_secs(3600),
            ..Default::default()
        };
        let (scaler, pool) = scaler_with_pool(config);

        let mut busy = quiet_signals();
        busy.utilization = 1.0;
        scaler.evaluate_pool(&pool, &busy);
        scaler.evaluate_pool(&pool, &busy);
        scaler.evaluate_pool(&pool, &busy);

        // one scale event; the rest are inside the cooldown window
        assert_eq!(pool.current_workers(), 2);
        assert_eq!(scaler.stats().scale_ups, 1);
        pool.stop().await;
    }
}
