use crate::cache::ComparisonCache;
use crate::comparator::Comparator;
use driftwatch_types::{
    Change, DiffConfig, DiffResult, DriftError, DriftReport, DriftType, Resource, Severity,
    Snapshot, WorkPriority,
};
use driftwatch_types::DriftResult as Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fixed job-channel capacity; the result channel is sized to the pair
/// count so workers can never deadlock on emit.
const JOB_CHANNEL_CAPACITY: usize = 100;

/// Error message reserved for the impossible both-sides-missing pair.
const INVALID_PAIR_ERROR: &str = "invalid resource pair";

/// The unit of diff work: one resource id with its optional two sides.
#[derive(Debug, Clone)]
pub struct ComparisonPair {
    pub id: String,
    pub baseline: Option<Resource>,
    pub current: Option<Resource>,
    pub priority: WorkPriority,
}

/// Point-in-time differ statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffStatsSnapshot {
    pub comparisons: u64,
    pub result_errors: u64,
    pub reports: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Worker pool that pairs baseline/current resources by id and computes
/// the drift report.
///
/// Pairs missing one side sort ahead of both-present pairs so creations
/// and deletions surface first under load. Each comparison is bounded by
/// `compare_timeout`; the whole run by twice that. The operation returns a
/// complete report or an error, never a partial report.
pub struct DiffPool {
    config: DiffConfig,
    cache: Arc<ComparisonCache>,
    comparator: Comparator,
    comparisons: AtomicU64,
    result_errors: AtomicU64,
    reports: AtomicU64,
    self_ref: parking_lot::RwLock<Weak<Self>>,
}

impl DiffPool {
    pub fn new(
        config: DiffConfig,
        cache: Arc<ComparisonCache>,
        comparator: Comparator,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            cache,
            comparator,
            comparisons: AtomicU64::new(0),
            result_errors: AtomicU64::new(0),
            reports: AtomicU64::new(0),
            self_ref: parking_lot::RwLock::new(Weak::new()),
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

    /// Compare two snapshots and assemble the drift report.
    pub async fn compute(
        &self,
        baseline: &Snapshot,
        current: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<DriftReport> {
        if cancel.is_cancelled() {
            return Err(DriftError::Cancelled);
        }

        let pairs = Self::build_pairs(baseline, current);
        let pair_count = pairs.len();
        info!(
            baseline = %baseline.id,
            current = %current.id,
            pairs = pair_count,
            workers = self.config.workers,
            "computing drift"
        );

        if pair_count == 0 {
            let report = DriftReport::new(&baseline.id, &current.id);
            self.reports.fetch_add(1, Ordering::Relaxed);
            return Ok(report);
        }

        let (job_tx, job_rx) = mpsc::channel::<ComparisonPair>(JOB_CHANNEL_CAPACITY);
        let job_rx = Arc::new(Mutex::new(job_rx));
        // sized to the pair count: emits never block on a slow aggregator
        let (result_tx, mut result_rx) = mpsc::channel::<DiffResult>(pair_count);

        let mut workers = Vec::with_capacity(self.config.workers.max(1));
        for i in 0..self.config.workers.max(1) {
            let pool = self.handle();
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let cancel = cancel.child_token();
            let worker_id = format!("differ-{i}");
            workers.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, job_rx, result_tx, cancel).await;
            }));
        }
        drop(result_tx);

        // dispatch, aborting promptly on cancellation
        let mut dispatch_err = None;
        for pair in pairs {
            tokio::select! {
                _ = cancel.cancelled() => {
                    dispatch_err = Some(DriftError::Cancelled);
                    break;
                }
                sent = job_tx.send(pair) => {
                    if sent.is_err() {
                        dispatch_err =
                            Some(DriftError::internal("diff workers exited during dispatch"));
                        break;
                    }
                }
            }
        }
        drop(job_tx);

        if let Some(err) = dispatch_err {
            abort_all(&workers);
            return Err(err);
        }

        let aggregate_timeout = self.config.compare_timeout * 2;
        let collect = async {
            let mut results = Vec::with_capacity(pair_count);
            while results.len() < pair_count {
                match result_rx.recv().await {
                    Some(result) => results.push(result),
                    None => break,
                }
            }
            results
        };

        let results = tokio::select! {
            _ = cancel.cancelled() => {
                abort_all(&workers);
                return Err(DriftError::Cancelled);
            }
            collected = tokio::time::timeout(aggregate_timeout, collect) => match collected {
                Ok(results) => results,
                Err(_) => {
                    // partial results are discarded, not exposed
                    abort_all(&workers);
                    return Err(DriftError::timeout(aggregate_timeout));
                }
            }
        };
        abort_all(&workers);

        if results.len() != pair_count {
            return Err(DriftError::internal(format!(
                "diff produced {} results for {} pairs",
                results.len(),
                pair_count
            )));
        }

        self.assemble_report(baseline, current, results)
    }

    pub fn stats(&self) -> DiffStatsSnapshot {
        let cache = self.cache.stats();
        DiffStatsSnapshot {
            comparisons: self.comparisons.load(Ordering::Relaxed),
            result_errors: self.result_errors.load(Ordering::Relaxed),
            reports: self.reports.load(Ordering::Relaxed),
            cache_hits: cache.hits,
            cache_misses: cache.misses,
        }
    }

    pub fn cache(&self) -> Arc<ComparisonCache> {
        Arc::clone(&self.cache)
    }

    /// Index both snapshots by id and pair the union, one-sided pairs
    /// first.
    fn build_pairs(baseline: &Snapshot, current: &Snapshot) -> Vec<ComparisonPair> {
        let baseline_index = baseline.index_by_id();
        let current_index = current.index_by_id();

        let ids: BTreeSet<&str> = baseline_index
            .keys()
            .chain(current_index.keys())
            .copied()
            .collect();

        let mut pairs: Vec<ComparisonPair> = ids
            .into_iter()
            .map(|id| {
                let baseline = baseline_index.get(id).map(|r| (*r).clone());
                let current = current_index.get(id).map(|r| (*r).clone());
                let priority = if baseline.is_none() || current.is_none() {
                    WorkPriority::High
                } else {
                    WorkPriority::Normal
                };
                ComparisonPair {
                    id: id.to_string(),
                    baseline,
                    current,
                    priority,
                }
            })
            .collect();

        pairs.sort_unstable_by(|a, b| b.priority.cmp(&a.priority));
        pairs
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: String,
        job_rx: Arc<Mutex<mpsc::Receiver<ComparisonPair>>>,
        result_tx: mpsc::Sender<DiffResult>,
        cancel: CancellationToken,
    ) {
        loop {
            let pair = {
                let mut rx = job_rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    pair = rx.recv() => pair,
                }
            };
            let Some(pair) = pair else { break };

            let result = self.process_pair(pair, &worker_id).await;
            if result_tx.send(result).await.is_err() {
                break;
            }
        }
    }

    /// Compare one pair: cache consult, drift-type determination, severity
    /// and risk attachment.
    async fn process_pair(&self, pair: ComparisonPair, worker_id: &str) -> DiffResult {
        let started = Instant::now();
        self.comparisons.fetch_add(1, Ordering::Relaxed);

        if let Some(mut cached) = self.cache.get(&pair.id) {
            // identity is preserved up to the two bookkeeping fields
            cached.worker_id = worker_id.to_string();
            cached.compare_time = started.elapsed();
            return cached;
        }

        let id = pair.id;
        let (drift_type, outcome) = match (pair.baseline, pair.current) {
            (Some(baseline), Some(current)) => {
                let comparator = Arc::clone(&self.comparator);
                let task =
                    tokio::task::spawn_blocking(move || comparator(&baseline, &current));
                let outcome = match tokio::time::timeout(self.config.compare_timeout, task).await
                {
                    Ok(Ok(changes)) => Ok(changes),
                    Ok(Err(join_err)) if join_err.is_panic() => {
                        warn!(worker_id = %worker_id, resource_id = %id, "comparator panicked; isolated");
                        Err(format!("comparator panicked in worker {worker_id}"))
                    }
                    Ok(Err(_)) => Err("comparator task cancelled".to_string()),
                    Err(_) => Err(format!(
                        "comparison timed out after {}ms",
                        self.config.compare_timeout.as_millis()
                    )),
                };
                (DriftType::Modified, outcome)
            }
            (Some(baseline), None) => (
                DriftType::Deleted,
                Ok(vec![synthetic_change(&id, Some(&baseline), None)]),
            ),
            (None, Some(current)) => (
                DriftType::Created,
                Ok(vec![synthetic_change(&id, None, Some(&current))]),
            ),
            (None, None) => (DriftType::Modified, Err(INVALID_PAIR_ERROR.to_string())),
        };

        match outcome {
            Ok(changes) => {
                let severity = aggregate_severity(&changes);
                let risk_score = risk_score(&changes, drift_type);
                let result = DiffResult {
                    resource_id: id,
                    changes,
                    drift_type,
                    severity,
                    risk_score,
                    compare_time: started.elapsed(),
                    worker_id: worker_id.to_string(),
                    error: None,
                };
                self.cache.insert(result.clone());
                result
            }
            Err(message) => {
                self.result_errors.fetch_add(1, Ordering::Relaxed);
                DiffResult {
                    resource_id: id,
                    changes: Vec::new(),
                    drift_type,
                    severity: Severity::Low,
                    risk_score: 0.0,
                    compare_time: started.elapsed(),
                    worker_id: worker_id.to_string(),
                    error: Some(message),
                }
            }
        }
    }

    /// Fold the per-pair results into the report: concatenated changes,
    /// bucket counts, mean risk, and the high-risk tally.
    fn assemble_report(
        &self,
        baseline: &Snapshot,
        current: &Snapshot,
        results: Vec<DiffResult>,
    ) -> Result<DriftReport> {
        let mut report = DriftReport::new(&baseline.id, &current.id);
        let mut risk_sum = 0.0;
        let mut counted = 0usize;

        for result in results {
            if let Some(error) = &result.error {
                if error == INVALID_PAIR_ERROR {
                    return Err(DriftError::internal(format!(
                        "comparison pair for {} had neither side",
                        result.resource_id
                    )));
                }
                debug!(
                    resource_id = %result.resource_id,
                    error = %error,
                    "diff result carried an error; excluded from summary"
                );
                continue;
            }

            counted += 1;
            risk_sum += result.risk_score;
            if result.severity.is_high_risk() {
                report.summary.high_risk_changes += 1;
            }
            match result.drift_type {
                DriftType::Created => report.summary.added += 1,
                DriftType::Deleted => report.summary.deleted += 1,
                DriftType::Modified => {
                    // a modified bucket entry requires actual changes
                    if !result.changes.is_empty() {
                        report.summary.modified += 1;
                    }
                }
            }
            report.changes.extend(result.changes);
        }

        report.summary.total_changes = report.changes.len();
        report.summary.risk_score = if counted > 0 {
            risk_sum / counted as f64
        } else {
            0.0
        };
        self.reports.fetch_add(1, Ordering::Relaxed);
        Ok(report)
    }
}

fn abort_all(workers: &[tokio::task::JoinHandle<()>]) {
    for worker in workers {
        worker.abort();
    }
}

/// Single change representing a whole-resource creation or deletion.
fn synthetic_change(id: &str, baseline: Option<&Resource>, current: Option<&Resource>) -> Change {
    let description = if baseline.is_some() {
        format!("resource deleted: {id}")
    } else {
        format!("resource created: {id}")
    };
    Change {
        field: "resource".to_string(),
        path: id.to_string(),
        old_value: baseline.and_then(|r| serde_json::to_value(r).ok()),
        new_value: current.and_then(|r| serde_json::to_value(r).ok()),
        severity: Severity::High,
        description,
    }
}

/// Overall severity: high when most changes are high or critical, medium
/// when any are, low otherwise.
fn aggregate_severity(changes: &[Change]) -> Severity {
    if changes.is_empty() {
        return Severity::Low;
    }
    let high = changes
        .iter()
        .filter(|c| c.severity.is_high_risk())
        .count();
    if high * 2 > changes.len() {
        Severity::High
    } else if high > 0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Severity-weighted mean over the change count, elevated for whole-
/// resource creations and deletions, clamped to `[0, 1]`.
fn risk_score(changes: &[Change], drift_type: DriftType) -> f64 {
    if changes.is_empty() {
        return 0.0;
    }
    let mean = changes.iter().map(|c| c.severity.weight()).sum::<f64>() / changes.len() as f64;
    let elevated = match drift_type {
        DriftType::Created | DriftType::Deleted => mean + 0.1,
        DriftType::Modified => mean,
    };
    elevated.clamp(0.0, 1.0)
}
