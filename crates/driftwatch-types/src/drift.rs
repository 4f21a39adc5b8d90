use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Severity attached to a single change or an aggregated diff result.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Risk weight used in the per-result weighted mean
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Low => 0.1,
            Severity::Medium => 0.4,
            Severity::High => 0.7,
            Severity::Critical => 1.0,
        }
    }

    pub fn is_high_risk(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

/// How a resource drifted between baseline and current.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DriftType {
    Created,
    Deleted,
    Modified,
}

/// A single field-level difference between two versions of a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Change {
    /// Top-level field the change belongs to, e.g. `configuration`
    pub field: String,
    /// Dotted path into the resource, e.g. `configuration.replicas`
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<serde_json::Value>,
    pub severity: Severity,
    pub description: String,
}

/// Outcome of comparing one resource id across the two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResult {
    pub resource_id: String,
    pub changes: Vec<Change>,
    pub drift_type: DriftType,
    pub severity: Severity,
    /// Weighted-mean risk in `[0, 1]`
    pub risk_score: f64,
    /// Wall time spent comparing this pair
    pub compare_time: Duration,
    /// Worker that produced (or re-stamped, on cache hit) this result
    pub worker_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DiffResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Aggregate counters over a whole report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DriftSummary {
    pub total_changes: usize,
    pub added: usize,
    pub deleted: usize,
    pub modified: usize,
    /// Mean of per-result risk scores, in `[0, 1]`
    pub risk_score: f64,
    /// Results whose overall severity is high or critical
    pub high_risk_changes: usize,
}

/// The product of one drift run: every change between two snapshots plus
/// the summary buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub baseline_id: String,
    pub current_id: String,
    pub changes: Vec<Change>,
    pub summary: DriftSummary,
}

impl DriftReport {
    pub fn new(baseline_id: impl Into<String>, current_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            baseline_id: baseline_id.into(),
            current_id: current_id.into(),
            changes: Vec::new(),
            summary: DriftSummary::default(),
        }
    }

    pub fn has_drift(&self) -> bool {
        self.summary.added + self.summary.deleted + self.summary.modified > 0
    }
}
