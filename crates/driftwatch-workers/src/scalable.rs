use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use driftwatch_pool::BackpressureGate;
use driftwatch_types::{AutoscaleConfig, DriftError, DriftResult, WorkItem, WorkResult};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace window for workers to notice cancellation before being abandoned.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Narrow processing capability supplied by the caller.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process one work item and produce its result.
    async fn process(&self, item: &WorkItem) -> WorkResult;

    /// Processor name for identification
    fn name(&self) -> &str;
}

struct QueuedItem {
    item: WorkItem,
    /// Per-item cancel signal; a child of the pool token unless the caller
    /// supplied one
    cancel: CancellationToken,
}

struct WorkerState {
    is_healthy: AtomicBool,
    active: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    last_activity: RwLock<DateTime<Utc>>,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            is_healthy: AtomicBool::new(true),
            active: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_activity: RwLock::new(Utc::now()),
        }
    }

    fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }
}

struct PoolWorker {
    state: Arc<WorkerState>,
    handle: JoinHandle<()>,
}

/// Per-worker view used by the health checker and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub is_healthy: bool,
    pub active: bool,
    pub processed: u64,
    pub failed: u64,
    pub last_activity: DateTime<Utc>,
}

/// Point-in-time pool statistics, the autoscaler's input signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalablePoolStats {
    pub pool_id: String,
    pub current_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub active_workers: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub processed: u64,
    pub failed: u64,
    pub avg_response_time_ms: u64,
    pub workers: Vec<WorkerSnapshot>,
}

impl ScalablePoolStats {
    /// Active-worker utilization in `[0, 1]`
    pub fn utilization(&self) -> f64 {
        if self.current_workers == 0 {
            return 0.0;
        }
        self.active_workers as f64 / self.current_workers as f64
    }
}

/// Generic work-item pool with a dynamic worker set.
///
/// Workers drain a shared bounded queue and emit [`WorkResult`]s on the
/// result channel handed out at construction. The worker count stays inside
/// `[min_workers, max_workers]`; `scale_up` / `scale_down` mutate it and
/// stamp `last_scaled_at` for the autoscaler's cooldown windows.
pub struct ScalablePool {
    id: String,
    config: AutoscaleConfig,
    processor: Arc<dyn Processor>,
    job_tx: mpsc::Sender<QueuedItem>,
    job_rx: Arc<Mutex<mpsc::Receiver<QueuedItem>>>,
    result_tx: mpsc::Sender<WorkResult>,
    workers: DashMap<String, PoolWorker>,
    worker_seq: AtomicUsize,
    queue_capacity: usize,
    gate: Option<Arc<BackpressureGate>>,
    last_scaled_at: RwLock<Option<Instant>>,
    response_times: RwLock<VecDeque<u64>>,
    processed: AtomicU64,
    failed: AtomicU64,
    running: AtomicBool,
    cancel: CancellationToken,
    /// Weak self-reference so worker spawns can hold the pool; set at
    /// construction
    self_ref: RwLock<Weak<Self>>,
}

impl ScalablePool {
    /// Create the pool and hand back the result stream.
    pub fn new(
        id: impl Into<String>,
        config: AutoscaleConfig,
        queue_size: usize,
        processor: Arc<dyn Processor>,
        gate: Option<Arc<BackpressureGate>>,
    ) -> (Arc<Self>, mpsc::Receiver<WorkResult>) {
        let (job_tx, job_rx) = mpsc::channel(queue_size);
        let (result_tx, result_rx) = mpsc::channel(queue_size);
        let pool = Arc::new(Self {
            id: id.into(),
            config,
            processor,
            job_tx,
            job_rx: Arc::new(Mutex::new(job_rx)),
            result_tx,
            workers: DashMap::new(),
            worker_seq: AtomicUsize::new(0),
            queue_capacity: queue_size,
            gate,
            last_scaled_at: RwLock::new(None),
            response_times: RwLock::new(VecDeque::with_capacity(100)),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            self_ref: RwLock::new(Weak::new()),
        });
        *pool.self_ref.write() = Arc::downgrade(&pool);
        (pool, result_rx)
    }

    fn handle(&self) -> Arc<Self> {
        self.self_ref
            .read()
            .upgrade()
            .expect("self reference is set at construction")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn the initial worker set.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!(pool_id = %self.id, "scalable pool already running");
            return;
        }
        let initial = self
            .config
            .initial_workers
            .clamp(self.config.min_workers, self.config.max_workers);
        info!(pool_id = %self.id, workers = initial, "starting scalable pool");
        for _ in 0..initial {
            self.spawn_worker();
        }
    }

    /// Stop all workers; queued items are discarded. Workers get the hard
    /// 10 s window to exit cooperatively before they are abandoned.
    pub async fn stop(&self) {
        self.stop_by(tokio::time::Instant::now() + SHUTDOWN_DEADLINE)
            .await;
    }

    /// Stop against a caller-supplied deadline, so an orchestrator can
    /// impose one window across several pools.
    pub async fn stop_by(&self, deadline: tokio::time::Instant) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let keys: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, worker)) = self.workers.remove(&key) {
                handles.push(worker.handle);
            }
        }
        let aborters: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout_at(deadline, join_all(handles))
            .await
            .is_err()
        {
            warn!(pool_id = %self.id, "shutdown deadline exceeded; abandoning workers");
            for aborter in aborters {
                aborter.abort();
            }
        }
        info!(pool_id = %self.id, "scalable pool stopped");
    }

    /// Submit a work item, honoring backpressure on the way in.
    pub async fn submit(&self, item: WorkItem) -> DriftResult<()> {
        self.submit_with_cancel(item, self.cancel.child_token())
            .await
    }

    /// Submit a work item carrying its own cancel signal. A cancelled item
    /// surfaces as a failed result rather than disappearing.
    pub async fn submit_with_cancel(
        &self,
        item: WorkItem,
        cancel: CancellationToken,
    ) -> DriftResult<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(DriftError::capacity("pool not running"));
        }
        if let Some(gate) = &self.gate {
            gate.wait_until_clear(Duration::from_secs(10)).await?;
        }
        self.job_tx
            .send(QueuedItem { item, cancel })
            .await
            .map_err(|_| DriftError::capacity("pool queue closed"))
    }

    /// Add up to `n` workers, bounded by `max_workers`. Returns how many
    /// were actually added.
    pub fn scale_up(&self, n: usize) -> usize {
        let mut added = 0;
        for _ in 0..n {
            if self.workers.len() >= self.config.max_workers {
                break;
            }
            self.spawn_worker();
            added += 1;
        }
        if added > 0 {
            *self.last_scaled_at.write() = Some(Instant::now());
            info!(pool_id = %self.id, added, total = self.workers.len(), "scaled up");
        }
        added
    }

    /// Remove up to `n` workers, bounded by `min_workers`. Returns how many
    /// were actually removed.
    pub fn scale_down(&self, n: usize) -> usize {
        let mut removed = 0;
        for _ in 0..n {
            if self.workers.len() <= self.config.min_workers {
                break;
            }
            // prefer idle workers; fall back to any
            let victim = self
                .workers
                .iter()
                .find(|w| !w.value().state.active.load(Ordering::Acquire))
                .map(|w| w.key().clone())
                .or_else(|| self.workers.iter().next().map(|w| w.key().clone()));
            let Some(victim) = victim else { break };
            if let Some((_, worker)) = self.workers.remove(&victim) {
                worker.handle.abort();
                removed += 1;
            }
        }
        if removed > 0 {
            *self.last_scaled_at.write() = Some(Instant::now());
            info!(pool_id = %self.id, removed, total = self.workers.len(), "scaled down");
        }
        removed
    }

    /// Replace an unhealthy worker with a fresh one.
    pub fn replace_worker(&self, worker_id: &str) -> bool {
        let Some((_, worker)) = self.workers.remove(worker_id) else {
            return false;
        };
        worker.handle.abort();
        warn!(pool_id = %self.id, worker_id = %worker_id, "replaced unhealthy worker");
        self.spawn_worker();
        true
    }

    pub fn current_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_capacity - self.job_tx.capacity()
    }

    pub fn last_scaled_at(&self) -> Option<Instant> {
        *self.last_scaled_at.read()
    }

    pub fn stats(&self) -> ScalablePoolStats {
        let mut workers = Vec::with_capacity(self.workers.len());
        let mut active = 0;
        for entry in self.workers.iter() {
            let state = &entry.value().state;
            let is_active = state.active.load(Ordering::Acquire);
            if is_active {
                active += 1;
            }
            workers.push(WorkerSnapshot {
                worker_id: entry.key().clone(),
                is_healthy: state.is_healthy.load(Ordering::Acquire),
                active: is_active,
                processed: state.processed.load(Ordering::Relaxed),
                failed: state.failed.load(Ordering::Relaxed),
                last_activity: *state.last_activity.read(),
            });
        }

        let times = self.response_times.read();
        let avg = if times.is_empty() {
            0
        } else {
            times.iter().sum::<u64>() / times.len() as u64
        };

        ScalablePoolStats {
            pool_id: self.id.clone(),
            current_workers: self.workers.len(),
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            active_workers: active,
            queue_depth: self.queue_depth(),
            queue_capacity: self.queue_capacity,
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_response_time_ms: avg,
            workers,
        }
    }

    fn spawn_worker(&self) {
        let seq = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let worker_id = format!("{}-worker-{}", self.id, seq);
        let state = Arc::new(WorkerState::new());
        let handle = {
            let pool = self.handle();
            let state = Arc::clone(&state);
            let worker_id = worker_id.clone();
            tokio::spawn(async move {
                pool.worker_loop(worker_id, state).await;
            })
        };
        self.workers.insert(worker_id, PoolWorker { state, handle });
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String, state: Arc<WorkerState>) {
        debug!(pool_id = %self.id, worker_id = %worker_id, "worker started");
        loop {
            let item = {
                let mut rx = self.job_rx.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    item = rx.recv() => item,
                }
            };
            let Some(mut queued) = item else { break };

            state.active.store(true, Ordering::Release);
            state.touch();

            let started = Instant::now();
            let mut cancelled = queued.cancel.is_cancelled();
            let result = if cancelled {
                WorkResult::failure(
                    queued.item.id.clone(),
                    worker_id.clone(),
                    "work item cancelled",
                    Duration::ZERO,
                )
            } else {
                tokio::select! {
                    _ = queued.cancel.cancelled() => {
                        cancelled = true;
                        WorkResult::failure(
                            queued.item.id.clone(),
                            worker_id.clone(),
                            "work item cancelled",
                            started.elapsed(),
                        )
                    }
                    outcome = tokio::time::timeout(
                        queued.item.timeout,
                        self.processor.process(&queued.item),
                    ) => match outcome {
                        Ok(result) => result,
                        Err(_) => WorkResult::failure(
                            queued.item.id.clone(),
                            worker_id.clone(),
                            format!(
                                "work item timed out after {}ms",
                                queued.item.timeout.as_millis()
                            ),
                            started.elapsed(),
                        ),
                    }
                }
            };

            self.record_response_time(started.elapsed());

            if result.success {
                state.processed.fetch_add(1, Ordering::Relaxed);
                self.processed.fetch_add(1, Ordering::Relaxed);
                let _ = self.result_tx.send(result).await;
            } else if !cancelled && !queued.item.is_exhausted() {
                // retry budget left: requeue rather than emit
                queued.item.retries += 1;
                debug!(
                    pool_id = %self.id,
                    work_id = %queued.item.id,
                    retries = queued.item.retries,
                    "requeueing failed work item"
                );
                if self.job_tx.try_send(queued).is_err() {
                    // queue full; surface the failure instead of blocking
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    state.failed.fetch_add(1, Ordering::Relaxed);
                    let _ = self.result_tx.send(result).await;
                }
            } else {
                state.failed.fetch_add(1, Ordering::Relaxed);
                self.failed.fetch_add(1, Ordering::Relaxed);
                let _ = self.result_tx.send(result).await;
            }

            state.active.store(false, Ordering::Release);
            state.touch();
        }
        debug!(pool_id = %self.id, worker_id = %worker_id, "worker stopped");
    }

    fn record_response_time(&self, elapsed: Duration) {
        let mut times = self.response_times.write();
        times.push_back(elapsed.as_millis() as u64);
        if times.len() > 100 {
            times.pop_front();
        }
    }
}
