//! End-to-end drift scenarios over the diff pool.

use driftwatch_diff::{structural_comparator, ComparisonCache, DiffPool};
use driftwatch_types::{Change, DiffConfig, DriftReport, Resource, Severity, Snapshot};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn pool_with_workers(workers: usize) -> Arc<DiffPool> {
    DiffPool::new(
        DiffConfig {
            workers,
            compare_timeout: Duration::from_secs(10),
        },
        Arc::new(ComparisonCache::new(Duration::from_secs(300))),
        structural_comparator(),
    )
}

fn snapshot(id: &str, resources: Vec<Resource>) -> Snapshot {
    Snapshot::new(id, "test").with_resources(resources)
}

async fn compute(pool: &Arc<DiffPool>, baseline: &Snapshot, current: &Snapshot) -> DriftReport {
    pool.compute(baseline, current, &CancellationToken::new())
        .await
        .unwrap()
}

/// Order-insensitive view of a report's changes.
fn change_multiset(report: &DriftReport) -> Vec<(String, String, String)> {
    let mut set: Vec<_> = report
        .changes
        .iter()
        .map(|c: &Change| (c.field.clone(), c.path.clone(), c.description.clone()))
        .collect();
    set.sort();
    set
}

#[tokio::test]
async fn scaling_change_reports_one_medium_modification() {
    let baseline = snapshot(
        "base",
        vec![Resource::new("deployment/frontend", "deployment", "frontend", "kubernetes")
            .with_config("replicas", json!(3))
            .with_config("image", json!("frontend:v2.1.0"))],
    );
    let current = snapshot(
        "curr",
        vec![Resource::new("deployment/frontend", "deployment", "frontend", "kubernetes")
            .with_config("replicas", json!(7))
            .with_config("image", json!("frontend:v2.1.0"))],
    );

    let report = compute(&pool_with_workers(4), &baseline, &current).await;

    assert_eq!(report.summary.modified, 1);
    assert_eq!(report.summary.added, 0);
    assert_eq!(report.summary.deleted, 0);
    assert_eq!(report.summary.total_changes, 1);
    assert_eq!(report.changes[0].path, "configuration.replicas");
    assert_eq!(report.changes[0].severity, Severity::Medium);
    assert!((report.summary.risk_score - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn deleted_resource_reports_synthetic_high_change() {
    let baseline = snapshot(
        "base",
        vec![Resource::new("service/old", "service", "old", "kubernetes")],
    );
    let current = snapshot("curr", vec![]);

    let report = compute(&pool_with_workers(4), &baseline, &current).await;

    assert_eq!(report.summary.deleted, 1);
    assert_eq!(report.summary.added, 0);
    assert_eq!(report.summary.total_changes, 1);
    assert_eq!(report.changes[0].field, "resource");
    assert_eq!(report.changes[0].severity, Severity::High);
    assert!(report.changes[0].old_value.is_some());
    assert!(report.changes[0].new_value.is_none());
    assert!((report.summary.risk_score - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn created_resource_mirrors_deletion() {
    let baseline = snapshot("base", vec![]);
    let current = snapshot(
        "curr",
        vec![Resource::new("service/new", "service", "new", "kubernetes")],
    );

    let report = compute(&pool_with_workers(4), &baseline, &current).await;

    assert_eq!(report.summary.added, 1);
    assert_eq!(report.summary.deleted, 0);
    assert_eq!(report.changes[0].severity, Severity::High);
    assert!(report.changes[0].old_value.is_none());
    assert!(report.changes[0].new_value.is_some());
    assert!((report.summary.risk_score - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn mixed_drift_counts_every_bucket() {
    let a = Resource::new("a", "deployment", "a", "kubernetes").with_config("image", json!("v1"));
    let a_changed =
        Resource::new("a", "deployment", "a", "kubernetes").with_config("image", json!("v2"));
    let b = Resource::new("b", "service", "b", "kubernetes");
    let c = Resource::new("c", "service", "c", "kubernetes");

    let baseline = snapshot("base", vec![a, b]);
    let current = snapshot("curr", vec![a_changed, c]);

    let report = compute(&pool_with_workers(4), &baseline, &current).await;

    assert_eq!(report.summary.modified, 1);
    assert_eq!(report.summary.deleted, 1);
    assert_eq!(report.summary.added, 1);
    assert_eq!(report.summary.total_changes, 3);
}

fn many_resources(count: usize, image: &str) -> Vec<Resource> {
    (0..count)
        .map(|i| {
            Resource::new(
                format!("deployment/app-{i}"),
                "deployment",
                format!("app-{i}"),
                "kubernetes",
            )
            .with_config("replicas", json!(i % 9))
            .with_config("image", json!(image))
            .with_tag("team", format!("team-{}", i % 7))
        })
        .collect()
}

#[tokio::test]
async fn identical_snapshots_are_idempotent() {
    let resources = many_resources(1000, "app:v1");
    let baseline = snapshot("base", resources.clone());
    let current = snapshot("curr", resources);

    let report = compute(&pool_with_workers(8), &baseline, &current).await;

    assert_eq!(report.summary.total_changes, 0);
    assert_eq!(report.summary.added, 0);
    assert_eq!(report.summary.deleted, 0);
    assert_eq!(report.summary.modified, 0);
    assert_eq!(report.summary.risk_score, 0.0);
}

#[tokio::test]
async fn symmetry_of_created_and_deleted() {
    let shared = Resource::new("shared", "service", "shared", "kubernetes");
    let only_in_a = Resource::new("x", "service", "x", "kubernetes");

    let a = snapshot("a", vec![shared.clone(), only_in_a]);
    let b = snapshot("b", vec![shared]);

    // fresh pools: the cache is keyed by id and must not leak across runs
    let forward = compute(&pool_with_workers(4), &a, &b).await;
    let backward = compute(&pool_with_workers(4), &b, &a).await;

    assert_eq!(forward.summary.deleted, 1);
    assert_eq!(forward.summary.added, 0);
    assert_eq!(backward.summary.added, 1);
    assert_eq!(backward.summary.deleted, 0);
}

#[tokio::test]
async fn worker_count_does_not_change_the_report() {
    let baseline = snapshot("base", many_resources(10_000, "app:v1"));
    let current = snapshot("curr", many_resources(10_000, "app:v2"));

    let mut reports = Vec::new();
    for workers in [1usize, 4, 16] {
        let pool = pool_with_workers(workers);
        reports.push(compute(&pool, &baseline, &current).await);
    }

    let reference_changes = change_multiset(&reports[0]);
    let reference_summary = reports[0].summary.clone();
    for report in &reports[1..] {
        assert_eq!(change_multiset(report), reference_changes);
        assert_eq!(report.summary, reference_summary);
    }
    assert_eq!(reference_summary.modified, 10_000);
}

#[tokio::test]
async fn repeated_run_hits_the_cache_and_reports_equally() {
    let baseline = snapshot("base", many_resources(50, "app:v1"));
    let current = snapshot("curr", many_resources(50, "app:v2"));

    let pool = pool_with_workers(4);
    let first = compute(&pool, &baseline, &current).await;
    let second = compute(&pool, &baseline, &current).await;

    assert_eq!(change_multiset(&first), change_multiset(&second));
    assert_eq!(first.summary, second.summary);
    // every pair in the union resolves from the cache on the second run
    assert!(pool.cache().hits() >= 50);
}

#[tokio::test]
async fn union_ids_each_appear_at_most_once() {
    let baseline = snapshot("base", many_resources(20, "app:v1"));
    let current = snapshot("curr", many_resources(30, "app:v2"));

    let report = compute(&pool_with_workers(4), &baseline, &current).await;

    // 20 modified + 10 created; every id contributes exactly one result
    assert_eq!(report.summary.modified, 20);
    assert_eq!(report.summary.added, 10);
    assert_eq!(report.summary.deleted, 0);
}
