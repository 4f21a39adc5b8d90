use driftwatch_types::DiffResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Insertions between lazy expiry sweeps.
const SWEEP_EVERY: u64 = 64;

struct CacheEntry {
    result: DiffResult,
    inserted_at: Instant,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evicted: u64,
    pub entries: usize,
}

/// TTL-bounded memoization of per-resource diff results.
///
/// The cache is advisory: correctness never depends on it. Entries past
/// their TTL read as absent and are lazily evicted on the insert path or
/// through [`ComparisonCache::sweep`]. A caller taking a hit rewrites only
/// the `worker_id` and `compare_time` fields.
pub struct ComparisonCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evicted: AtomicU64,
}

impl ComparisonCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Look up a fresh entry for a resource id.
    pub fn get(&self, resource_id: &str) -> Option<DiffResult> {
        let entries = self.entries.read();
        match entries.get(resource_id) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.result.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a result keyed by its resource id.
    pub fn insert(&self, result: DiffResult) {
        let count = self.insertions.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        entries.insert(
            result.resource_id.clone(),
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
        if count % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let dropped = Self::sweep_locked(&mut entries, self.ttl);
            if dropped > 0 {
                self.evicted.fetch_add(dropped as u64, Ordering::Relaxed);
            }
        }
    }

    /// Evict expired entries; reclaim hook for the GC governor.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write();
        let dropped = Self::sweep_locked(&mut entries, self.ttl);
        if dropped > 0 {
            self.evicted.fetch_add(dropped as u64, Ordering::Relaxed);
            debug!(dropped, "comparison cache sweep");
        }
        dropped
    }

    /// Drop everything; used between unrelated runs in tests and tooling.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            entries: self.entries.read().len(),
        }
    }

    fn sweep_locked(entries: &mut HashMap<String, CacheEntry>, ttl: Duration) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftwatch_types::{DriftType, Severity};

    fn result(id: &str) -> DiffResult {
        DiffResult {
            resource_id: id.to_string(),
            changes: Vec::new(),
            drift_type: DriftType::Modified,
            severity: Severity::Low,
            risk_score: 0.0,
            compare_time: Duration::from_millis(1),
            worker_id: "w-0".to_string(),
            error: None,
        }
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = ComparisonCache::new(Duration::from_secs(60));
        cache.insert(result("a"));
        assert!(cache.get("a").is_some());
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_expired_entry_reads_as_absent() {
        let cache = ComparisonCache::new(Duration::ZERO);
        cache.insert(result("a"));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_sweep_evicts_expired() {
        let cache = ComparisonCache::new(Duration::ZERO);
        cache.insert(result("a"));
        cache.insert(result("b"));
        assert_eq!(cache.sweep(), 2);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_reinsert_refreshes_entry() {
        let cache = ComparisonCache::new(Duration::from_secs(60));
        cache.insert(result("a"));
        let mut newer = result("a");
        newer.risk_score = 0.5;
        cache.insert(newer);
        assert_eq!(cache.get("a").unwrap().risk_score, 0.5);
        assert_eq!(cache.stats().entries, 1);
    }
}
