use driftwatch_types::{DriftError, DriftResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Poll cadence for waiters that missed the single wake-up.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Process-wide backpressure flag.
///
/// The memory monitor engages the gate when residency crosses the
/// backpressure threshold and releases it when residency falls back below.
/// Release publishes a single wake-up; one waiter resumes immediately and
/// the rest observe the flag on their next poll. Every submit path checks
/// the gate before dispatching work.
#[derive(Default)]
pub struct BackpressureGate {
    engaged: AtomicBool,
    waker: Notify,
    waits: AtomicU64,
    wait_timeouts: AtomicU64,
}

impl BackpressureGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns true if the gate was previously clear.
    pub fn engage(&self) -> bool {
        let was_clear = !self.engaged.swap(true, Ordering::AcqRel);
        if was_clear {
            debug!("backpressure engaged");
        }
        was_clear
    }

    /// Clear the flag and wake a single waiter.
    pub fn release(&self) {
        if self.engaged.swap(false, Ordering::AcqRel) {
            debug!("backpressure released");
            self.waker.notify_one();
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    /// Wait until the gate clears, bounded by `timeout`.
    ///
    /// Returns `DriftError::Capacity` when the gate is still engaged at the
    /// deadline; it never blocks indefinitely.
    pub async fn wait_until_clear(&self, timeout: Duration) -> DriftResult<()> {
        if !self.is_engaged() {
            return Ok(());
        }
        self.waits.fetch_add(1, Ordering::Relaxed);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_engaged() {
                return Ok(());
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(DriftError::capacity(format!(
                    "backpressure did not clear within {}ms",
                    timeout.as_millis()
                )));
            }
            let slice = WAIT_POLL_INTERVAL.min(deadline - now);
            // A missed notify is fine: the poll slice re-reads the flag.
            let _ = tokio::time::timeout(slice, self.waker.notified()).await;
        }
    }

    /// (waits entered, waits that timed out)
    pub fn wait_counters(&self) -> (u64, u64) {
        (
            self.waits.load(Ordering::Relaxed),
            self.wait_timeouts.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_clear_gate_returns_immediately() {
        let gate = BackpressureGate::new();
        gate.wait_until_clear(Duration::from_secs(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out_while_engaged() {
        let gate = BackpressureGate::new();
        gate.engage();
        let err = gate
            .wait_until_clear(Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, DriftError::Capacity(_)));
        let (waits, timeouts) = gate.wait_counters();
        assert_eq!((waits, timeouts), (1, 1));
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let gate = Arc::new(BackpressureGate::new());
        gate.engage();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_until_clear(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.release();

        waiter.await.unwrap().unwrap();
        assert!(!gate.is_engaged());
    }

    #[tokio::test]
    async fn test_multiple_waiters_all_resume_after_release() {
        let gate = Arc::new(BackpressureGate::new());
        gate.engage();

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            waiters.push(tokio::spawn(async move {
                gate.wait_until_clear(Duration::from_secs(5)).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.release();

        // one waiter wakes on the notify, the rest on the poll cadence
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
    }
}
