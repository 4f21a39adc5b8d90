use driftwatch_pool::{BackpressureGate, TokenBucket};
use driftwatch_types::{DriftError, DriftResult, ProcessorConfig, RawResource, Resource};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Caller-supplied pure normalization function.
pub type Normalizer = Arc<dyn Fn(&RawResource) -> Result<Resource, String> + Send + Sync>;

/// Pause between admission retries when the rate limiter denies a job.
const ADMISSION_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Grace window for workers to notice cancellation before being abandoned.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

struct ProcessJob {
    raw: RawResource,
    respond_to: oneshot::Sender<DriftResult<Resource>>,
}

/// One failed raw resource out of a batch.
#[derive(Debug)]
pub struct ProcessError {
    pub resource_id: String,
    pub error: DriftError,
}

#[derive(Default)]
struct ProcessorCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    rate_limited: AtomicU64,
    panics_isolated: AtomicU64,
}

/// Point-in-time processor pool statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorStatsSnapshot {
    pub workers: usize,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub rate_limited: u64,
    pub panics_isolated: u64,
    pub avg_processing_time_ms: u64,
}

/// Worker pool that normalizes [`RawResource`] values into [`Resource`]s.
///
/// Each job passes through, in order: rate-limit admission, backpressure
/// wait, and a retry loop with linearly increasing delay. Every attempt is
/// bounded by a hard timeout and a panicking normalizer is isolated into a
/// failed result tagged with the worker id.
pub struct ResourceProcessorPool {
    config: ProcessorConfig,
    normalizer: Normalizer,
    limiter: Arc<TokenBucket>,
    gate: Arc<BackpressureGate>,
    job_tx: mpsc::Sender<ProcessJob>,
    job_rx: Arc<Mutex<mpsc::Receiver<ProcessJob>>>,
    counters: Arc<ProcessorCounters>,
    processing_times: Arc<RwLock<VecDeque<u64>>>,
    running: AtomicBool,
    cancel: CancellationToken,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    self_ref: RwLock<Weak<Self>>,
}

impl ResourceProcessorPool {
    pub fn new(
        config: ProcessorConfig,
        normalizer: Normalizer,
        limiter: Arc<TokenBucket>,
        gate: Arc<BackpressureGate>,
    ) -> Arc<Self> {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size);
        let pool = Arc::new(Self {
            config,
            normalizer,
            limiter,
            gate,
            job_tx,
            job_rx: Arc::new(Mutex::new(job_rx)),
            counters: Arc::new(ProcessorCounters::default()),
            processing_times: Arc::new(RwLock::new(VecDeque::with_capacity(100))),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            workers: parking_lot::Mutex::new(Vec::new()),
            self_ref: RwLock::new(Weak::new()),
        });
        *pool.self_ref.write() = Arc::downgrade(&pool);
        pool
    }

    fn handle(&self) -> Arc<Self> {
        self.self_ref
            .read()
            .upgrade()
            .expect("self reference is set at construction")
    }

    /// Spawn the worker loops under `parent` cancellation.
    pub fn start(&self, parent: &CancellationToken) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("resource processor pool already running");
            return;
        }

        info!(workers = self.config.workers, "starting resource processor pool");
        let mut workers = self.workers.lock();
        for i in 0..self.config.workers {
            let worker_id = format!("processor-{i}");
            let pool = self.handle();
            let cancel = parent.child_token();
            workers.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, cancel).await;
            }));
        }
    }

    /// Stop the pool; queued jobs are discarded. Workers get the hard 10 s
    /// window to exit cooperatively before they are abandoned.
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

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let aborters: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout_at(deadline, join_all(handles))
            .await
            .is_err()
        {
            warn!("shutdown deadline exceeded; abandoning processor workers");
            for aborter in aborters {
                aborter.abort();
            }
        }
        info!("resource processor pool stopped");
    }

    /// Queue one raw resource; the receipt resolves to the outcome.
    ///
    /// Submission respects backpressure: it waits up to 10 s for the gate
    /// to clear and fails with a capacity error afterwards.
    pub async fn submit(
        &self,
        raw: RawResource,
    ) -> DriftResult<oneshot::Receiver<DriftResult<Resource>>> {
        if !self.running.load(Ordering::Acquire) {
            return Err(DriftError::capacity("processor pool not running"));
        }
        self.gate
            .wait_until_clear(Duration::from_secs(10))
            .await?;

        let (respond_to, receipt) = oneshot::channel();
        self.job_tx
            .send(ProcessJob { raw, respond_to })
            .await
            .map_err(|_| DriftError::capacity("processor queue closed"))?;
        Ok(receipt)
    }

    /// Normalize a batch, returning the successes and the per-resource
    /// failures. The call fails outright only when every unit failed.
    pub async fn process_batch(
        &self,
        raws: Vec<RawResource>,
    ) -> DriftResult<(Vec<Resource>, Vec<ProcessError>)> {
        if raws.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut receipts = Vec::with_capacity(raws.len());
        for raw in raws {
            let id = raw.id.clone();
            receipts.push((id, self.submit(raw).await?));
        }

        let mut resources = Vec::new();
        let mut errors = Vec::new();
        for (resource_id, receipt) in receipts {
            match receipt.await {
                Ok(Ok(resource)) => resources.push(resource),
                Ok(Err(error)) => errors.push(ProcessError { resource_id, error }),
                Err(_) => errors.push(ProcessError {
                    resource_id,
                    error: DriftError::Cancelled,
                }),
            }
        }

        if resources.is_empty() && !errors.is_empty() {
            return Err(DriftError::internal(format!(
                "all {} resources failed normalization",
                errors.len()
            )));
        }
        Ok((resources, errors))
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        let times = self.processing_times.read();
        let avg = if times.is_empty() {
            0
        } else {
            times.iter().sum::<u64>() / times.len() as u64
        };
        ProcessorStatsSnapshot {
            workers: self.config.workers,
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            panics_isolated: self.counters.panics_isolated.load(Ordering::Relaxed),
            avg_processing_time_ms: avg,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String, cancel: CancellationToken) {
        debug!(worker_id = %worker_id, "processor worker started");
        loop {
            let job = {
                let mut rx = self.job_rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.cancel.cancelled() => break,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = job else { break };

            let started = Instant::now();
            let outcome = self.handle_job(&job.raw, &worker_id, &cancel).await;
            self.record_timing(started.elapsed());

            match &outcome {
                Ok(_) => {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    debug!(worker_id = %worker_id, resource_id = %job.raw.id, error = %e, "normalization failed");
                }
            }
            // receiver may have given up; that is not a worker error
            let _ = job.respond_to.send(outcome);
        }
        debug!(worker_id = %worker_id, "processor worker stopped");
    }

    /// Run one job through admission, backpressure, and the retry loop.
    async fn handle_job(
        &self,
        raw: &RawResource,
        worker_id: &str,
        cancel: &CancellationToken,
    ) -> DriftResult<Resource> {
        // (1) rate-limit admission; a denied job stays with this worker and
        // is retried on the next loop turn, bounded by the attempt deadline
        let admission_deadline = Instant::now() + self.config.process_timeout;
        while !self.limiter.allow() {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            if self.limiter.is_shut_down() {
                return Err(DriftError::capacity("rate limiter shut down"));
            }
            if Instant::now() >= admission_deadline {
                return Err(DriftError::capacity("rate limiter denied after retry budget"));
            }
            if cancel.is_cancelled() {
                return Err(DriftError::Cancelled);
            }
            tokio::time::sleep(ADMISSION_RETRY_DELAY).await;
        }

        // (2) backpressure
        self.gate
            .wait_until_clear(Duration::from_secs(10))
            .await?;

        // (3) retry loop with linear delay
        let mut last_error = String::new();
        for attempt in 1..=self.config.max_retries {
            if attempt > 1 {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(self.config.retry_base_delay * attempt).await;
            }
            if cancel.is_cancelled() {
                return Err(DriftError::Cancelled);
            }

            match self.attempt(raw, worker_id).await {
                Ok(resource) => return Ok(resource),
                Err(message) => last_error = message,
            }
        }

        Err(DriftError::Normalize {
            message: last_error,
            attempts: self.config.max_retries,
        })
    }

    /// One normalization attempt: hard timeout plus panic isolation.
    async fn attempt(&self, raw: &RawResource, worker_id: &str) -> Result<Resource, String> {
        let normalizer = Arc::clone(&self.normalizer);
        let raw = raw.clone();
        let task = tokio::task::spawn_blocking(move || normalizer(&raw));

        match tokio::time::timeout(self.config.process_timeout, task).await {
            Ok(Ok(Ok(resource))) => Ok(resource),
            Ok(Ok(Err(message))) => Err(message),
            Ok(Err(join_err)) if join_err.is_panic() => {
                self.counters.panics_isolated.fetch_add(1, Ordering::Relaxed);
                error!(worker_id = %worker_id, "normalizer panicked; isolated");
                Err(format!("normalizer panicked in worker {worker_id}"))
            }
            Ok(Err(_)) => Err("normalizer task cancelled".to_string()),
            Err(_) => Err(format!(
                "attempt timed out after {}ms",
                self.config.process_timeout.as_millis()
            )),
        }
    }

    fn record_timing(&self, elapsed: Duration) {
        let mut times = self.processing_times.write();
        times.push_back(elapsed.as_millis() as u64);
        if times.len() > 100 {
            times.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity_normalizer() -> Normalizer {
        Arc::new(|raw: &RawResource| {
            Ok(Resource::new(
                raw.id.clone(),
                raw.resource_type.clone(),
                raw.id.clone(),
                raw.provider.clone(),
            ))
        })
    }

    fn pool_with(config: ProcessorConfig, normalizer: Normalizer) -> Arc<ResourceProcessorPool> {
        let limiter = Arc::new(TokenBucket::new(10_000.0, 10_000));
        let gate = Arc::new(BackpressureGate::new());
        ResourceProcessorPool::new(config, normalizer, limiter, gate)
    }

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig {
            workers: 2,
            queue_size: 16,
            process_timeout: Duration::from_secs(2),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_batch_normalizes_all_resources() {
        let pool = pool_with(fast_config(), identity_normalizer());
        let cancel = CancellationToken::new();
        pool.start(&cancel);

        let raws: Vec<_> = (0..10)
            .map(|i| RawResource::new(format!("res-{i}"), "aws_instance", "aws"))
            .collect();
        let (resources, errors) = pool.process_batch(raws).await.unwrap();

        assert_eq!(resources.len(), 10);
        assert!(errors.is_empty());
        assert_eq!(pool.stats().processed, 10);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_failures_are_partial_not_fatal() {
        let normalizer: Normalizer = Arc::new(|raw: &RawResource| {
            if raw.id == "bad" {
                Err("unparseable".to_string())
            } else {
                Ok(Resource::new(raw.id.clone(), "t", "n", "aws"))
            }
        });
        let pool = pool_with(fast_config(), normalizer);
        let cancel = CancellationToken::new();
        pool.start(&cancel);

        let raws = vec![
            RawResource::new("good", "t", "aws"),
            RawResource::new("bad", "t", "aws"),
        ];
        let (resources, errors) = pool.process_batch(raws).await.unwrap();

        assert_eq!(resources.len(), 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].resource_id, "bad");
        assert!(matches!(
            errors[0].error,
            DriftError::Normalize { attempts: 2, .. }
        ));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let normalizer: Normalizer = Arc::new(|raw: &RawResource| {
            if raw.id == "boom" {
                panic!("normalizer exploded");
            }
            Ok(Resource::new(raw.id.clone(), "t", "n", "aws"))
        });
        let pool = pool_with(fast_config(), normalizer);
        let cancel = CancellationToken::new();
        pool.start(&cancel);

        let raws = vec![
            RawResource::new("ok-1", "t", "aws"),
            RawResource::new("boom", "t", "aws"),
            RawResource::new("ok-2", "t", "aws"),
        ];
        let (resources, errors) = pool.process_batch(raws).await.unwrap();

        // the pool survives the panic and keeps processing
        assert_eq!(resources.len(), 2);
        assert_eq!(errors.len(), 1);
        assert!(pool.stats().panics_isolated >= 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_rate_limiter_shutdown_fails_with_capacity() {
        let limiter = Arc::new(TokenBucket::new(100.0, 10));
        limiter.shutdown();
        let gate = Arc::new(BackpressureGate::new());
        let pool = ResourceProcessorPool::new(fast_config(), identity_normalizer(), limiter, gate);
        let cancel = CancellationToken::new();
        pool.start(&cancel);

        let receipt = pool
            .submit(RawResource::new("r", "t", "aws"))
            .await
            .unwrap();
        let outcome = receipt.await.unwrap();
        assert!(matches!(outcome, Err(DriftError::Capacity(_))));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_raw_payload_flows_into_resource() {
        let normalizer: Normalizer = Arc::new(|raw: &RawResource| {
            let mut resource =
                Resource::new(raw.id.clone(), raw.resource_type.clone(), "web", "aws");
            for (key, value) in &raw.data {
                resource.configuration.insert(key.clone(), value.clone());
            }
            Ok(resource)
        });
        let pool = pool_with(fast_config(), normalizer);
        let cancel = CancellationToken::new();
        pool.start(&cancel);

        let raw = RawResource::new("i-1", "aws_instance", "aws")
            .with_data("instance_type", json!("t3.large"));
        let (resources, _) = pool.process_batch(vec![raw]).await.unwrap();
        assert_eq!(resources[0].configuration["instance_type"], json!("t3.large"));
        pool.stop().await;
    }
}
