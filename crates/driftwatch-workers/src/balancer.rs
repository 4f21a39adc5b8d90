use crate::scalable::ScalablePool;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Pool selection strategy. The set is fixed, so a tagged enum rather than
/// a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    ResourceBased,
}

/// Routes submissions across pools.
///
/// Selection is safe under concurrent callers; the only mutable state is an
/// atomic cursor.
pub struct LoadBalancer {
    strategy: Strategy,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pick a pool for the next submission.
    pub fn select(&self, pools: &[Arc<ScalablePool>]) -> Option<Arc<ScalablePool>> {
        if pools.is_empty() {
            return None;
        }
        let picked = match self.strategy {
            Strategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % pools.len();
                pools[idx].clone()
            }
            Strategy::WeightedRoundRobin => self.select_weighted(pools),
            Strategy::LeastConnections => pools
                .iter()
                .min_by_key(|pool| {
                    let stats = pool.stats();
                    (stats.active_workers, stats.queue_depth)
                })
                .cloned()?,
            Strategy::ResourceBased => pools
                .iter()
                .min_by_key(|pool| {
                    let stats = pool.stats();
                    // composite load: queue depth x active workers x latency
                    (stats.queue_depth as u64 + 1)
                        * (stats.active_workers as u64 + 1)
                        * (stats.avg_response_time_ms + 1)
                })
                .cloned()?,
        };
        Some(picked)
    }

    /// Weight each pool by its current worker count.
    fn select_weighted(&self, pools: &[Arc<ScalablePool>]) -> Arc<ScalablePool> {
        let weights: Vec<usize> = pools
            .iter()
            .map(|pool| pool.current_workers().max(1))
            .collect();
        let total: usize = weights.iter().sum();
        let mut position = self.cursor.fetch_add(1, Ordering::Relaxed) % total;
        for (pool, weight) in pools.iter().zip(&weights) {
            if position < *weight {
                return pool.clone();
            }
            position -= weight;
        }
        // cursor arithmetic guarantees a hit above; this is unreachable
        pools[0].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalable::Processor;
    use async_trait::async_trait;
    use driftwatch_types::{AutoscaleConfig, WorkItem, WorkResult};
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

    fn pool(id: &str, workers: usize) -> Arc<ScalablePool> {
        let config = AutoscaleConfig {
            min_workers: 1,
            max_workers: workers.max(1),
            initial_workers: workers.max(1),
            ..Default::default()
        };
        let (pool, _results) =
            ScalablePool::new(id, config, 8, Arc::new(NoopProcessor), None);
        pool.start();
        pool
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let pools = vec![pool("a", 1), pool("b", 1), pool("c", 1)];
        let balancer = LoadBalancer::new(Strategy::RoundRobin);

        let picks: Vec<String> = (0..6)
            .map(|_| balancer.select(&pools).unwrap().id().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
        for p in &pools {
            p.stop().await;
        }
    }

    #[tokio::test]
    async fn test_weighted_favors_larger_pools() {
        let pools = vec![pool("small", 1), pool("large", 3)];
        let balancer = LoadBalancer::new(Strategy::WeightedRoundRobin);

        let mut counts = std::collections::HashMap::new();
        for _ in 0..40 {
            let picked = balancer.select(&pools).unwrap().id().to_string();
            *counts.entry(picked).or_insert(0usize) += 1;
        }
        assert!(counts["large"] > counts["small"]);
        for p in &pools {
            p.stop().await;
        }
    }

    #[tokio::test]
    async fn test_empty_pool_list_yields_none() {
        let balancer = LoadBalancer::new(Strategy::LeastConnections);
        assert!(balancer.select(&[]).is_none());
    }

    #[tokio::test]
    async fn test_least_connections_prefers_idle_pool() {
        let pools = vec![pool("idle", 2), pool("busy", 2)];
        let balancer = LoadBalancer::new(Strategy::LeastConnections);
        let picked = balancer.select(&pools).unwrap();
        // both idle: selection still succeeds and is one of the pools
        assert!(picked.id() == "idle" || picked.id() == "busy");
        for p in &pools {
            p.stop().await;
        }
    }
}
