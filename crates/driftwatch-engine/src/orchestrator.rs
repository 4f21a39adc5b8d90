use driftwatch_diff::{structural_comparator, CacheStatsSnapshot, Comparator, ComparisonCache, DiffPool, DiffStatsSnapshot};
use driftwatch_parser::{ParseError, ParserStatsSnapshot, StateParserPool};
use driftwatch_pool::{
    BackpressureGate, BufferPool, MemoryEvent, MemoryMonitor, MemoryStatsSnapshot,
    PoolStatsSnapshot, ResourcePool, SnapshotPool, TokenBucket,
};
use driftwatch_storage::{SaveReceipt, StorageManagerPool, StorageStatsSnapshot};
use driftwatch_types::{
    DriftError, DriftReport, DriftResult, EngineConfig, RawResource, Resource, Snapshot,
};
use driftwatch_workers::{
    Autoscaler, HealthChecker, Normalizer, ProcessError, ProcessorStatsSnapshot,
    ResourceProcessorPool, ScalablePool,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One shutdown window shared across every subcomponent; workers still
/// busy at the deadline are abandoned.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Memory events kept for the metrics view.
const MEMORY_EVENT_HISTORY: usize = 32;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    New,
    Running,
    Stopped,
}

/// Unified statistics over every subcomponent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatsSnapshot {
    pub state: EngineState,
    pub processor: ProcessorStatsSnapshot,
    pub parser: ParserStatsSnapshot,
    pub diff: DiffStatsSnapshot,
    pub storage: StorageStatsSnapshot,
    pub memory: MemoryStatsSnapshot,
    pub cache: CacheStatsSnapshot,
    pub resource_pool: PoolStatsSnapshot,
    pub snapshot_pool: PoolStatsSnapshot,
    pub buffer_pool: PoolStatsSnapshot,
    pub rate_tokens_available: u64,
    pub backpressure_engaged: bool,
    /// Most recent memory-monitor events, oldest first
    pub recent_memory_events: Vec<MemoryEventRecord>,
}

/// A memory-monitor event as retained for the metrics view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEventRecord {
    pub at: DateTime<Utc>,
    pub detail: String,
}

/// One component's health line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    pub detail: String,
}

/// Health-check view of the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    pub healthy: bool,
    pub state: EngineState,
    pub components: Vec<ComponentHealth>,
}

/// Orchestrator over the drift pools.
///
/// Owns every subcomponent one-way; the memory monitor talks back only
/// through the backpressure gate and its event channel. `start` brings the
/// components up in a fixed order and `stop` reverses it, abandoning
/// workers that outlive the shutdown deadline.
///
/// Requests over `batch_threshold` items are split into fixed-size batches
/// issued sequentially with a short pause; every dispatch first waits,
/// bounded, for backpressure to clear.
pub struct DriftEngine {
    config: EngineConfig,
    state: RwLock<EngineState>,
    gate: Arc<BackpressureGate>,
    limiter: Arc<TokenBucket>,
    monitor: Arc<MemoryMonitor>,
    memory_events: parking_lot::Mutex<Option<mpsc::Receiver<MemoryEvent>>>,
    recent_memory_events: Arc<parking_lot::Mutex<VecDeque<MemoryEventRecord>>>,
    event_drain: parking_lot::Mutex<Option<JoinHandle<()>>>,
    resource_pool: Arc<ResourcePool>,
    snapshot_pool: Arc<SnapshotPool>,
    buffer_pool: Arc<BufferPool>,
    processor: Arc<ResourceProcessorPool>,
    parser: Arc<StateParserPool>,
    differ: Arc<DiffPool>,
    cache: Arc<ComparisonCache>,
    storage: Arc<StorageManagerPool>,
    scalable_pools: Vec<Arc<ScalablePool>>,
    autoscaler: Option<Arc<Autoscaler>>,
    health_checker: Option<Arc<HealthChecker>>,
    cancel: CancellationToken,
}

impl DriftEngine {
    /// Build an engine with the default structural comparator. Must be
    /// called from within a tokio runtime.
    pub fn new(config: EngineConfig, normalizer: Normalizer) -> Arc<Self> {
        Self::with_comparator(config, normalizer, structural_comparator())
    }

    /// Build an engine around a caller-supplied domain comparator.
    pub fn with_comparator(
        config: EngineConfig,
        normalizer: Normalizer,
        comparator: Comparator,
    ) -> Arc<Self> {
        let gate = Arc::new(BackpressureGate::new());
        let limiter = Arc::new(TokenBucket::new(
            config.rate_limit.rate,
            config.rate_limit.burst,
        ));
        let (monitor, memory_events) = MemoryMonitor::new(config.memory.clone(), gate.clone());

        let resource_pool = Arc::new(ResourcePool::new(256));
        let snapshot_pool = Arc::new(SnapshotPool::new(16));
        let buffer_pool = Arc::new(BufferPool::with_default_size(64));

        let cache = Arc::new(ComparisonCache::new(config.cache.diff_ttl));
        let differ = DiffPool::new(config.diff.clone(), cache.clone(), comparator);
        let processor = ResourceProcessorPool::new(
            config.processor.clone(),
            normalizer,
            limiter.clone(),
            gate.clone(),
        );
        let parser = StateParserPool::new(config.parser.clone(), config.cache.clone());
        let storage = StorageManagerPool::new(config.storage.clone());

        // reclaim hooks: what a collection pass actually frees
        {
            let pool = resource_pool.clone();
            monitor.register_reclaim_hook(Arc::new(move || pool.shrink_to(32)));
        }
        {
            let pool = buffer_pool.clone();
            monitor.register_reclaim_hook(Arc::new(move || pool.shrink_to(8)));
        }
        {
            let cache = cache.clone();
            monitor.register_reclaim_hook(Arc::new(move || cache.sweep()));
        }

        Arc::new(Self {
            config,
            state: RwLock::new(EngineState::New),
            gate,
            limiter,
            monitor,
            memory_events: parking_lot::Mutex::new(Some(memory_events)),
            recent_memory_events: Arc::new(parking_lot::Mutex::new(VecDeque::with_capacity(
                MEMORY_EVENT_HISTORY,
            ))),
            event_drain: parking_lot::Mutex::new(None),
            resource_pool,
            snapshot_pool,
            buffer_pool,
            processor,
            parser,
            differ,
            cache,
            storage,
            scalable_pools: Vec::new(),
            autoscaler: None,
            health_checker: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Host generic scalable pools under this engine's autoscaler and
    /// health checker.
    pub fn with_scalable_pools(
        config: EngineConfig,
        normalizer: Normalizer,
        pools: Vec<Arc<ScalablePool>>,
    ) -> Arc<Self> {
        let autoscale = config.autoscale.clone();
        let engine = Self::new(config, normalizer);
        let mut inner = Arc::try_unwrap(engine)
            .ok()
            .expect("fresh engine is uniquely owned");
        inner.autoscaler = Some(Autoscaler::new(autoscale.clone(), pools.clone()));
        inner.health_checker = Some(HealthChecker::new(autoscale, pools.clone()));
        inner.scalable_pools = pools;
        Arc::new(inner)
    }

    /// Bring every subcomponent up, in order.
    pub fn start(&self) -> DriftResult<()> {
        {
            let mut state = self.state.write();
            if *state == EngineState::Running {
                warn!("drift engine already running");
                return Ok(());
            }
            *state = EngineState::Running;
        }

        info!("starting drift engine");
        self.processor.start(&self.cancel);
        debug!("state parser ready");
        debug!("diff pool ready");
        self.storage.start();
        for pool in &self.scalable_pools {
            pool.start();
        }
        if let Some(autoscaler) = &self.autoscaler {
            autoscaler.start();
        }
        if let Some(health) = &self.health_checker {
            health.start();
        }
        self.monitor.start();
        self.start_event_drain();
        info!("drift engine running");
        Ok(())
    }

    /// Stop everything in reverse order. Shutdown failures are logged, not
    /// surfaced. Every pool shares one 10 s deadline; workers that have not
    /// exited cooperatively by then are abandoned.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state != EngineState::Running {
                return;
            }
            *state = EngineState::Stopped;
        }

        info!("stopping drift engine");
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        self.monitor.stop();
        if let Some(handle) = self.event_drain.lock().take() {
            handle.abort();
        }
        if let Some(health) = &self.health_checker {
            health.stop();
        }
        if let Some(autoscaler) = &self.autoscaler {
            autoscaler.stop();
        }
        for pool in &self.scalable_pools {
            pool.stop_by(deadline).await;
        }
        self.storage.stop_by(deadline).await;
        self.processor.stop_by(deadline).await;
        self.limiter.shutdown();
        self.cancel.cancel();
        info!("drift engine stopped");
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Drain the monitor's event stream: log each event and keep a bounded
    /// history for the metrics view.
    fn start_event_drain(&self) {
        let Some(mut events) = self.memory_events.lock().take() else {
            return;
        };
        let recent = Arc::clone(&self.recent_memory_events);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match &event {
                    MemoryEvent::BackpressureRaised { usage, threshold } => {
                        warn!(usage, threshold, "memory backpressure raised");
                    }
                    MemoryEvent::BackpressureCleared { usage } => {
                        info!(usage, "memory backpressure cleared");
                    }
                    MemoryEvent::GcThresholdExceeded { usage, threshold } => {
                        warn!(usage, threshold, "gc threshold exceeded");
                    }
                    MemoryEvent::CollectionCompleted {
                        hooks_run,
                        reclaimed_objects,
                        forced,
                    } => {
                        debug!(hooks_run, reclaimed_objects, forced, "collection pass completed");
                    }
                }
                let mut recent = recent.lock();
                recent.push_back(MemoryEventRecord {
                    at: Utc::now(),
                    detail: describe_memory_event(&event),
                });
                if recent.len() > MEMORY_EVENT_HISTORY {
                    recent.pop_front();
                }
            }
        });
        *self.event_drain.lock() = Some(handle);
    }

    /// Normalize raw collector output, batching large workloads.
    pub async fn process_resources(
        &self,
        raws: Vec<RawResource>,
    ) -> DriftResult<(Vec<Resource>, Vec<ProcessError>)> {
        self.ensure_running()?;
        self.wait_for_headroom().await?;

        if raws.len() <= self.config.dispatch.batch_threshold {
            return self.processor.process_batch(raws).await;
        }

        info!(
            total = raws.len(),
            batch_size = self.config.dispatch.batch_size,
            "workload over threshold; issuing in batches"
        );
        let mut resources = Vec::with_capacity(raws.len());
        let mut errors = Vec::new();
        let batch_size = self.config.dispatch.batch_size.max(1);
        let mut batches = raws.into_iter().peekable();
        while batches.peek().is_some() {
            let chunk: Vec<RawResource> = batches.by_ref().take(batch_size).collect();
            self.wait_for_headroom().await?;
            let (mut ok, mut failed) = self.processor.process_batch(chunk).await?;
            resources.append(&mut ok);
            errors.append(&mut failed);
            if batches.peek().is_some() {
                tokio::time::sleep(self.config.dispatch.inter_batch_pause).await;
            }
        }
        Ok((resources, errors))
    }

    /// Parse on-disk state files into resources.
    pub async fn parse_state_files(
        &self,
        paths: &[PathBuf],
    ) -> DriftResult<(Vec<Resource>, Vec<ParseError>)> {
        self.ensure_running()?;
        self.wait_for_headroom().await?;
        self.parser.parse_all(paths).await
    }

    /// Compare two snapshots, batching the id space when the workload is
    /// over the threshold.
    pub async fn compare(
        &self,
        baseline: &Snapshot,
        current: &Snapshot,
    ) -> DriftResult<DriftReport> {
        self.ensure_running()?;
        self.wait_for_headroom().await?;

        let workload = baseline.len().max(current.len());
        if workload <= self.config.dispatch.batch_threshold {
            return self
                .differ
                .compute(baseline, current, &self.cancel.child_token())
                .await;
        }

        info!(
            workload,
            batch_size = self.config.dispatch.batch_size,
            "comparison over threshold; issuing in id-range batches"
        );
        self.compare_batched(baseline, current).await
    }

    /// Persist a snapshot through the storage pool.
    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> DriftResult<SaveReceipt> {
        self.ensure_running()?;
        self.wait_for_headroom().await?;
        self.storage.save(snapshot).await
    }

    pub async fn load_snapshot(&self, snapshot_id: &str) -> DriftResult<Snapshot> {
        self.ensure_running()?;
        self.storage.load(snapshot_id).await
    }

    /// Assemble a snapshot from normalized resources, recycling a pooled
    /// snapshot object.
    pub fn build_snapshot(
        &self,
        id: impl Into<String>,
        provider: impl Into<String>,
        resources: Vec<Resource>,
    ) -> Snapshot {
        let mut snapshot = self.snapshot_pool.checkout();
        snapshot.id = id.into();
        snapshot.provider = provider.into();
        snapshot.resources = resources;
        snapshot.finalize();
        snapshot
    }

    /// Return a snapshot object to the pool once its resources are done.
    pub fn recycle_snapshot(&self, snapshot: Snapshot) {
        self.snapshot_pool.checkin(snapshot);
    }

    /// Unified metrics over every subcomponent.
    pub fn metrics(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            state: self.state(),
            processor: self.processor.stats(),
            parser: self.parser.stats(),
            diff: self.differ.stats(),
            storage: self.storage.stats(),
            memory: self.monitor.stats(),
            cache: self.cache.stats(),
            resource_pool: self.resource_pool.stats(),
            snapshot_pool: self.snapshot_pool.stats(),
            buffer_pool: self.buffer_pool.stats(),
            rate_tokens_available: self.limiter.available(),
            backpressure_engaged: self.gate.is_engaged(),
            recent_memory_events: self
                .recent_memory_events
                .lock()
                .iter()
                .cloned()
                .collect(),
        }
    }

    /// Component-by-component health view.
    pub fn health(&self) -> EngineHealth {
        let state = self.state();
        let mut components = Vec::new();

        components.push(ComponentHealth {
            name: "processor".to_string(),
            healthy: self.processor.is_running(),
            detail: format!("{} workers", self.processor.stats().workers),
        });
        components.push(ComponentHealth {
            name: "rate_limiter".to_string(),
            healthy: !self.limiter.is_shut_down(),
            detail: format!("{} tokens available", self.limiter.available()),
        });
        let memory = self.monitor.stats();
        components.push(ComponentHealth {
            name: "memory".to_string(),
            healthy: !self.gate.is_engaged(),
            detail: format!(
                "{} bytes resident, backpressure {}",
                memory.current_usage,
                if self.gate.is_engaged() { "on" } else { "off" }
            ),
        });
        for pool in &self.scalable_pools {
            let stats = pool.stats();
            let healthy_workers = stats.workers.iter().filter(|w| w.is_healthy).count();
            components.push(ComponentHealth {
                name: format!("pool/{}", stats.pool_id),
                healthy: healthy_workers == stats.current_workers,
                detail: format!(
                    "{}/{} workers healthy, queue depth {}",
                    healthy_workers, stats.current_workers, stats.queue_depth
                ),
            });
        }

        EngineHealth {
            healthy: state == EngineState::Running
                && components.iter().all(|c| c.healthy),
            state,
            components,
        }
    }

    pub fn gate(&self) -> Arc<BackpressureGate> {
        self.gate.clone()
    }

    fn ensure_running(&self) -> DriftResult<()> {
        if self.state() != EngineState::Running {
            return Err(DriftError::input("engine is not running"));
        }
        Ok(())
    }

    /// Pre-dispatch backpressure wait, bounded by configuration.
    async fn wait_for_headroom(&self) -> DriftResult<()> {
        self.gate
            .wait_until_clear(self.config.dispatch.backpressure_wait)
            .await
    }

    /// Partition the union of ids into fixed batches and merge the
    /// sub-reports. The merged risk score stays the mean over all compared
    /// pairs by weighting each batch with its pair count.
    async fn compare_batched(
        &self,
        baseline: &Snapshot,
        current: &Snapshot,
    ) -> DriftResult<DriftReport> {
        let baseline_index = baseline.index_by_id();
        let current_index = current.index_by_id();
        let ids: Vec<&str> = {
            let set: BTreeSet<&str> = baseline_index
                .keys()
                .chain(current_index.keys())
                .copied()
                .collect();
            set.into_iter().collect()
        };

        let mut merged = DriftReport::new(&baseline.id, &current.id);
        let mut weighted_risk = 0.0;
        let mut total_pairs = 0usize;

        let batch_size = self.config.dispatch.batch_size.max(1);
        let batches = ids.chunks(batch_size).collect::<Vec<_>>();
        let last = batches.len().saturating_sub(1);
        for (index, chunk) in batches.into_iter().enumerate() {
            self.wait_for_headroom().await?;

            let sub_baseline = sub_snapshot(&baseline.id, &baseline.provider, chunk, &baseline_index);
            let sub_current = sub_snapshot(&current.id, &current.provider, chunk, &current_index);
            let report = self
                .differ
                .compute(&sub_baseline, &sub_current, &self.cancel.child_token())
                .await?;

            merged.summary.added += report.summary.added;
            merged.summary.deleted += report.summary.deleted;
            merged.summary.modified += report.summary.modified;
            merged.summary.high_risk_changes += report.summary.high_risk_changes;
            weighted_risk += report.summary.risk_score * chunk.len() as f64;
            total_pairs += chunk.len();
            merged.changes.extend(report.changes);

            if index != last {
                tokio::time::sleep(self.config.dispatch.inter_batch_pause).await;
            }
        }

        merged.summary.total_changes = merged.changes.len();
        merged.summary.risk_score = if total_pairs > 0 {
            weighted_risk / total_pairs as f64
        } else {
            0.0
        };
        Ok(merged)
    }
}

fn describe_memory_event(event: &MemoryEvent) -> String {
    match event {
        MemoryEvent::BackpressureRaised { usage, threshold } => {
            format!("backpressure raised: usage {usage} over threshold {threshold}")
        }
        MemoryEvent::BackpressureCleared { usage } => {
            format!("backpressure cleared: usage {usage}")
        }
        MemoryEvent::GcThresholdExceeded { usage, threshold } => {
            format!("gc threshold exceeded: usage {usage} over threshold {threshold}")
        }
        MemoryEvent::CollectionCompleted {
            hooks_run,
            reclaimed_objects,
            forced,
        } => format!(
            "collection pass: {hooks_run} hooks reclaimed {reclaimed_objects} objects (forced: {forced})"
        ),
    }
}

fn sub_snapshot(
    id: &str,
    provider: &str,
    ids: &[&str],
    index: &std::collections::HashMap<&str, &Resource>,
) -> Snapshot {
    let resources = ids
        .iter()
        .filter_map(|rid| index.get(rid).map(|r| (*r).clone()))
        .collect();
    Snapshot::new(id, provider).with_resources(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity_normalizer() -> Normalizer {
        Arc::new(|raw: &RawResource| {
            let mut resource = Resource::new(
                raw.id.clone(),
                raw.resource_type.clone(),
                raw.id.clone(),
                raw.provider.clone(),
            );
            for (key, value) in &raw.data {
                resource.configuration.insert(key.clone(), value.clone());
            }
            Ok(resource)
        })
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let engine = DriftEngine::new(EngineConfig::default(), identity_normalizer());
        assert_eq!(engine.state(), EngineState::New);

        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);

        // operations refuse to run once stopped
        let err = engine
            .compare(&Snapshot::new("a", "p"), &Snapshot::new("b", "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriftError::Input(_)));
    }

    #[tokio::test]
    async fn test_snapshot_pool_recycling() {
        let engine = DriftEngine::new(EngineConfig::default(), identity_normalizer());
        let snapshot = engine.build_snapshot(
            "snap-1",
            "aws",
            vec![Resource::new("a", "t", "a", "aws")],
        );
        assert_eq!(snapshot.metadata.resource_count, 1);
        engine.recycle_snapshot(snapshot);

        let recycled = engine.build_snapshot("snap-2", "aws", vec![]);
        assert_eq!(recycled.id, "snap-2");
        assert!(recycled.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_aggregate_all_components() {
        let engine = DriftEngine::new(EngineConfig::default(), identity_normalizer());
        engine.start().unwrap();

        let metrics = engine.metrics();
        assert_eq!(metrics.state, EngineState::Running);
        assert_eq!(metrics.processor.processed, 0);
        assert!(!metrics.backpressure_engaged);

        let health = engine.health();
        assert!(health.healthy);
        assert!(health.components.iter().any(|c| c.name == "processor"));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_batched_compare_merges_buckets() {
        let mut config = EngineConfig::default();
        config.dispatch.batch_threshold = 10;
        config.dispatch.batch_size = 4;
        config.dispatch.inter_batch_pause = std::time::Duration::from_millis(1);
        let engine = DriftEngine::new(config, identity_normalizer());
        engine.start().unwrap();

        let baseline_resources: Vec<Resource> = (0..20)
            .map(|i| {
                Resource::new(format!("r-{i}"), "t", format!("r-{i}"), "p")
                    .with_config("v", json!(1))
            })
            .collect();
        let current_resources: Vec<Resource> = (0..20)
            .map(|i| {
                Resource::new(format!("r-{i}"), "t", format!("r-{i}"), "p")
                    .with_config("v", json!(2))
            })
            .collect();

        let baseline = Snapshot::new("base", "p").with_resources(baseline_resources);
        let current = Snapshot::new("curr", "p").with_resources(current_resources);

        let report = engine.compare(&baseline, &current).await.unwrap();
        assert_eq!(report.summary.modified, 20);
        assert_eq!(report.summary.total_changes, 20);
        // every pair carries one medium change
        assert!((report.summary.risk_score - 0.4).abs() < 1e-9);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_memory_events_reach_the_metrics_view() {
        let engine = DriftEngine::new(EngineConfig::default(), identity_normalizer());
        engine.start().unwrap();

        engine.monitor.run_collection(true);
        // give the drain task a turn to pick the event up
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let metrics = engine.metrics();
        assert!(
            metrics
                .recent_memory_events
                .iter()
                .any(|record| record.detail.contains("collection pass")),
            "expected a collection event in {:?}",
            metrics.recent_memory_events
        );
        engine.stop().await;
    }
}
