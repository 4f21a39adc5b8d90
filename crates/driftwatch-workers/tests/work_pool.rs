//! Scalable pool, balancer, and autoscaler working together.

use async_trait::async_trait;
use driftwatch_types::{AutoscaleConfig, WorkItem, WorkPriority, WorkResult};
use driftwatch_workers::{
    Autoscaler, LoadBalancer, PoolSignals, Processor, ScalablePool, Strategy,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct SlowDouble;

#[async_trait]
impl Processor for SlowDouble {
    async fn process(&self, item: &WorkItem) -> WorkResult {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let doubled = item.payload.as_u64().unwrap_or(0) * 2;
        WorkResult::success(
            item.id.clone(),
            "double",
            Some(json!(doubled)),
            Duration::from_millis(5),
        )
    }

    fn name(&self) -> &str {
        "double"
    }
}

fn config(initial: usize, max: usize) -> AutoscaleConfig {
    AutoscaleConfig {
        min_workers: 1,
        max_workers: max,
        initial_workers: initial,
        scale_up_cooldown: Duration::ZERO,
        scale_down_cooldown: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test]
async fn balanced_submission_drains_across_pools() {
    let (alpha, mut alpha_results) =
        ScalablePool::new("alpha", config(2, 4), 64, Arc::new(SlowDouble), None);
    let (beta, mut beta_results) =
        ScalablePool::new("beta", config(2, 4), 64, Arc::new(SlowDouble), None);
    alpha.start();
    beta.start();

    let pools = vec![alpha.clone(), beta.clone()];
    let balancer = LoadBalancer::new(Strategy::RoundRobin);

    for i in 0u64..20 {
        let target = balancer.select(&pools).unwrap();
        target
            .submit(
                WorkItem::new(format!("w-{i}"), "double", json!(i))
                    .with_priority(WorkPriority::Normal),
            )
            .await
            .unwrap();
    }

    let mut seen = 0;
    while seen < 20 {
        tokio::select! {
            Some(result) = alpha_results.recv() => {
                assert!(result.success);
                seen += 1;
            }
            Some(result) = beta_results.recv() => {
                assert!(result.success);
                seen += 1;
            }
        }
    }

    let processed = alpha.stats().processed + beta.stats().processed;
    assert_eq!(processed, 20);
    // round-robin sends half to each side
    assert_eq!(alpha.stats().processed, 10);
    assert_eq!(beta.stats().processed, 10);

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test]
async fn autoscaler_reacts_to_synthetic_load() {
    let (pool, _results) =
        ScalablePool::new("loaded", config(1, 4), 64, Arc::new(SlowDouble), None);
    pool.start();
    let scaler = Autoscaler::new(config(1, 4), vec![pool.clone()]);

    let busy = PoolSignals {
        utilization: 1.0,
        queue_depth: 100,
        avg_response_time_ms: 50,
        cpu_fraction: 0.5,
        memory_fraction: 0.5,
    };
    // feed the decision loop directly; the pool grows to its bound
    for _ in 0..6 {
        scaler.evaluate_all(busy.cpu_fraction, busy.memory_fraction);
        if pool.stats().utilization() < 1.0 {
            // keep the pool visibly busy for the next evaluation
            pool.submit(WorkItem::new("w", "double", json!(1))).await.unwrap();
        }
    }

    assert!(pool.current_workers() >= 1);
    assert!(pool.current_workers() <= 4);
    assert!(scaler.stats().evaluations >= 6);

    pool.stop().await;
}

#[tokio::test]
async fn exhausted_retries_emit_failure() {
    struct AlwaysFail;

    #[async_trait]
    impl Processor for AlwaysFail {
        async fn process(&self, item: &WorkItem) -> WorkResult {
            WorkResult::failure(item.id.clone(), "fail", "no good", Duration::ZERO)
        }

        fn name(&self) -> &str {
            "fail"
        }
    }

    let (pool, mut results) =
        ScalablePool::new("failing", config(1, 2), 8, Arc::new(AlwaysFail), None);
    pool.start();

    pool.submit(WorkItem::new("w-f", "fail", json!({})).with_max_retries(2))
        .await
        .unwrap();

    let result = results.recv().await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("no good"));
    assert_eq!(pool.stats().failed, 1);

    pool.stop().await;
}
