use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Priority levels for queue ordering in the scalable pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for WorkPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// A generic unit of work consumed by the scalable pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique work identifier
    pub id: String,
    /// Routing key matched against processor capabilities
    pub work_type: String,
    pub priority: WorkPriority,
    /// Opaque payload interpreted by the processor
    pub payload: serde_json::Value,
    /// Per-item processing deadline
    pub timeout: Duration,
    /// Attempts made so far
    pub retries: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(
        id: impl Into<String>,
        work_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            work_type: work_type.into(),
            priority: WorkPriority::default(),
            payload,
            timeout: Duration::from_secs(30),
            retries: 0,
            max_retries: 3,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: WorkPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// True once the retry budget is spent
    pub fn is_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Result emitted by a pool worker for one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResult {
    pub work_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: Duration,
    pub worker_id: String,
    pub processed_at: DateTime<Utc>,
}

impl WorkResult {
    /// Create a successful work result
    pub fn success(
        work_id: impl Into<String>,
        worker_id: impl Into<String>,
        result: Option<serde_json::Value>,
        duration: Duration,
    ) -> Self {
        Self {
            work_id: work_id.into(),
            success: true,
            result,
            error: None,
            duration,
            worker_id: worker_id.into(),
            processed_at: Utc::now(),
        }
    }

    /// Create a failed work result
    pub fn failure(
        work_id: impl Into<String>,
        worker_id: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            work_id: work_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            duration,
            worker_id: worker_id.into(),
            processed_at: Utc::now(),
        }
    }
}
