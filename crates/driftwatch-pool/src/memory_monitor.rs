use crate::backpressure::BackpressureGate;
use driftwatch_types::MemoryConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked during a collection pass; returns how many objects it
/// released.
///
/// There is no garbage collector to force in Rust; a "collection" here is a
/// cooperative reclaim pass over registered hooks (object-pool shrink, cache
/// sweep). The thresholds and cadence behave exactly as a GC governor's.
pub type ReclaimHook = Arc<dyn Fn() -> usize + Send + Sync>;

/// Events published by the monitor for observability.
#[derive(Debug, Clone)]
pub enum MemoryEvent {
    GcThresholdExceeded {
        usage: u64,
        threshold: u64,
    },
    BackpressureRaised {
        usage: u64,
        threshold: u64,
    },
    BackpressureCleared {
        usage: u64,
    },
    CollectionCompleted {
        hooks_run: usize,
        reclaimed_objects: usize,
        forced: bool,
    },
}

/// Point-in-time monitor statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStatsSnapshot {
    pub current_usage: u64,
    pub peak_usage: u64,
    pub samples: u64,
    pub gc_runs: u64,
    pub backpressure_engaged: bool,
    pub gc_threshold: u64,
    pub backpressure_threshold: u64,
}

/// Samples process residency on a fixed cadence and governs the
/// backpressure gate.
///
/// Three absolute thresholds apply: `gc_threshold` triggers a reclaim pass,
/// `backpressure_threshold` raises the process-wide gate, and `max_memory`
/// derives defaults for the other two. A second timer forces a reclaim pass
/// every `force_gc_interval` regardless of residency.
pub struct MemoryMonitor {
    config: MemoryConfig,
    gate: Arc<BackpressureGate>,
    hooks: parking_lot::RwLock<Vec<ReclaimHook>>,
    current: AtomicU64,
    peak: AtomicU64,
    samples: AtomicU64,
    gc_runs: AtomicU64,
    running: AtomicBool,
    events: mpsc::Sender<MemoryEvent>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    self_ref: parking_lot::RwLock<Weak<Self>>,
}

impl MemoryMonitor {
    /// Create the monitor and the receiving end of its event stream.
    pub fn new(
        config: MemoryConfig,
        gate: Arc<BackpressureGate>,
    ) -> (Arc<Self>, mpsc::Receiver<MemoryEvent>) {
        let (events, event_rx) = mpsc::channel(64);
        let monitor = Arc::new(Self {
            config,
            gate,
            hooks: parking_lot::RwLock::new(Vec::new()),
            current: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            gc_runs: AtomicU64::new(0),
            running: AtomicBool::new(false),
            events,
            tasks: parking_lot::Mutex::new(Vec::new()),
            self_ref: parking_lot::RwLock::new(Weak::new()),
        });
        *monitor.self_ref.write() = Arc::downgrade(&monitor);
        (monitor, event_rx)
    }

    fn handle(&self) -> Arc<Self> {
        self.self_ref
            .read()
            .upgrade()
            .expect("self reference is set at construction")
    }

    /// Register a reclaim hook run on every collection pass.
    pub fn register_reclaim_hook(&self, hook: ReclaimHook) {
        self.hooks.write().push(hook);
    }

    /// Start the sampling and forced-collection loops.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("memory monitor already running");
            return;
        }

        info!(
            interval_ms = self.config.monitor_interval.as_millis() as u64,
            gc_threshold = self.config.effective_gc_threshold(),
            backpressure_threshold = self.config.effective_backpressure_threshold(),
            "starting memory monitor"
        );

        let sampler = {
            let monitor = self.handle();
            tokio::spawn(async move {
                let mut system = System::new();
                let pid = sysinfo::Pid::from_u32(std::process::id());
                let mut interval = tokio::time::interval(monitor.config.monitor_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                while monitor.running.load(Ordering::Acquire) {
                    interval.tick().await;
                    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                    if let Some(process) = system.process(pid) {
                        monitor.process_sample(process.memory());
                    }
                }
            })
        };

        let forcer = {
            let monitor = self.handle();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(monitor.config.force_gc_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // first tick fires immediately; skip it so the cadence is real
                interval.tick().await;
                while monitor.running.load(Ordering::Acquire) {
                    interval.tick().await;
                    monitor.run_collection(true);
                }
            })
        };

        self.tasks.lock().extend([sampler, forcer]);
    }

    /// Stop both loops. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("memory monitor stopped");
    }

    /// Apply one residency sample against the thresholds.
    fn process_sample(&self, usage: u64) {
        self.current.store(usage, Ordering::Release);
        self.peak.fetch_max(usage, Ordering::AcqRel);
        self.samples.fetch_add(1, Ordering::Relaxed);

        let bp_threshold = self.config.effective_backpressure_threshold();
        let gc_threshold = self.config.effective_gc_threshold();

        if usage > bp_threshold {
            if self.gate.engage() {
                warn!(usage, threshold = bp_threshold, "memory backpressure raised");
                self.emit(MemoryEvent::BackpressureRaised {
                    usage,
                    threshold: bp_threshold,
                });
            }
        } else if self.gate.is_engaged() {
            self.gate.release();
            self.emit(MemoryEvent::BackpressureCleared { usage });
        }

        if usage > gc_threshold {
            debug!(usage, threshold = gc_threshold, "gc threshold exceeded");
            self.emit(MemoryEvent::GcThresholdExceeded {
                usage,
                threshold: gc_threshold,
            });
            self.run_collection(false);
        }
    }

    /// Run every reclaim hook and record the pass.
    pub fn run_collection(&self, forced: bool) {
        let hooks = self.hooks.read();
        let mut reclaimed = 0usize;
        for hook in hooks.iter() {
            reclaimed += hook();
        }
        self.gc_runs.fetch_add(1, Ordering::Relaxed);
        debug!(
            hooks_run = hooks.len(),
            reclaimed, forced, "collection pass completed"
        );
        self.emit(MemoryEvent::CollectionCompleted {
            hooks_run: hooks.len(),
            reclaimed_objects: reclaimed,
            forced,
        });
    }

    pub fn stats(&self) -> MemoryStatsSnapshot {
        MemoryStatsSnapshot {
            current_usage: self.current.load(Ordering::Acquire),
            peak_usage: self.peak.load(Ordering::Acquire),
            samples: self.samples.load(Ordering::Relaxed),
            gc_runs: self.gc_runs.load(Ordering::Relaxed),
            backpressure_engaged: self.gate.is_engaged(),
            gc_threshold: self.config.effective_gc_threshold(),
            backpressure_threshold: self.config.effective_backpressure_threshold(),
        }
    }

    pub fn gate(&self) -> Arc<BackpressureGate> {
        Arc::clone(&self.gate)
    }

    fn emit(&self, event: MemoryEvent) {
        // observability only; a full channel must never stall sampling
        let _ = self.events.try_send(event);
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
