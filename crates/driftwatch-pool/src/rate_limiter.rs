use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

struct BucketState {
    tokens: AtomicU64,
    capacity: u64,
    shut_down: AtomicBool,
}

/// Token bucket for admission control.
///
/// `allow()` is non-blocking: it succeeds while a token is available and
/// fails otherwise. A background task produces one token every `1/rate`
/// seconds; tokens beyond `burst` are dropped. After [`TokenBucket::shutdown`]
/// the refill task stops and `allow()` permanently returns false.
pub struct TokenBucket {
    state: Arc<BucketState>,
    rate: f64,
    refill_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TokenBucket {
    /// Create a bucket holding `burst` tokens, refilled at `rate` tokens
    /// per second. Must be called from within a tokio runtime.
    pub fn new(rate: f64, burst: u64) -> Self {
        let state = Arc::new(BucketState {
            tokens: AtomicU64::new(burst),
            capacity: burst,
            shut_down: AtomicBool::new(false),
        });

        let refill_state = state.clone();
        let tick = Duration::from_secs_f64(1.0 / rate.max(f64::MIN_POSITIVE));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if refill_state.shut_down.load(Ordering::Acquire) {
                    break;
                }
                let mut current = refill_state.tokens.load(Ordering::Acquire);
                while current < refill_state.capacity {
                    match refill_state.tokens.compare_exchange(
                        current,
                        current + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => current = actual,
                    }
                }
            }
            debug!("rate limiter refill task stopped");
        });

        Self {
            state,
            rate,
            refill_task: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Try to take one token. Never blocks.
    pub fn allow(&self) -> bool {
        if self.state.shut_down.load(Ordering::Acquire) {
            return false;
        }
        let mut current = self.state.tokens.load(Ordering::Acquire);
        while current > 0 {
            match self.state.tokens.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Tokens currently available
    pub fn available(&self) -> u64 {
        self.state.tokens.load(Ordering::Acquire)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> u64 {
        self.state.capacity
    }

    /// Stop the refill task; every later `allow()` is denied.
    pub fn shutdown(&self) {
        self.state.shut_down.store(true, Ordering::Release);
        if let Some(handle) = self.refill_task.lock().take() {
            handle.abort();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_is_available_immediately() {
        let bucket = TokenBucket::new(10.0, 5);
        for _ in 0..5 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());
    }

    #[tokio::test]
    async fn test_refill_restores_tokens() {
        let bucket = TokenBucket::new(100.0, 2);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(bucket.allow());
    }

    #[tokio::test]
    async fn test_admissions_bounded_by_rate_plus_burst() {
        let bucket = TokenBucket::new(50.0, 10);
        let start = tokio::time::Instant::now();
        let mut admitted = 0u64;
        while start.elapsed() < Duration::from_millis(1000) {
            if bucket.allow() {
                admitted += 1;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // over one second: at most rate + burst, with slack for timer drift
        assert!(admitted <= 50 + 10 + 5, "admitted {admitted}");
    }

    #[tokio::test]
    async fn test_shutdown_denies_permanently() {
        let bucket = TokenBucket::new(100.0, 10);
        assert!(bucket.allow());
        bucket.shutdown();
        assert!(!bucket.allow());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!bucket.allow());
        assert!(bucket.is_shut_down());
    }

    #[tokio::test]
    async fn test_concurrent_allow_never_oversells() {
        let bucket = Arc::new(TokenBucket::new(0.001, 100));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move {
                let mut taken = 0u64;
                for _ in 0..1000 {
                    if bucket.allow() {
                        taken += 1;
                    }
                }
                taken
            }));
        }
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert!(total <= 100, "oversold: {total}");
    }
}
