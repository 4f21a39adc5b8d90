use thiserror::Error;

/// Result type for driftwatch operations
pub type DriftResult<T> = Result<T, DriftError>;

/// Error taxonomy shared across the engine.
///
/// Per-job failures travel inside result values; these errors are for the
/// control path. Pools never panic on caller input.
#[derive(Error, Debug)]
pub enum DriftError {
    /// Malformed snapshot, unknown id, or an invalid comparison pair
    #[error("input error: {0}")]
    Input(String),

    /// Caller-supplied normalizer returned failure, wrapped with attempts
    #[error("normalization failed after {attempts} attempt(s): {message}")]
    Normalize { message: String, attempts: u32 },

    /// Per-operation or aggregate deadline expired
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Parent context cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Queue full, rate-limiter denial after retry budget, or backpressure
    /// that never cleared
    #[error("capacity error: {0}")]
    Capacity(String),

    /// Snapshot persistence failure
    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Isolated panic or invariant violation; surfaced, never swallowed
    #[error("internal error: {0}")]
    Internal(String),
}

impl DriftError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// True for errors a retry could plausibly clear
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Capacity(_) | Self::Io(_))
    }
}
