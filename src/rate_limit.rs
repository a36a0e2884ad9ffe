use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use crate::error::{PipelensError, Result};

/// Outcome of a single non-blocking attempt to take tokens from the bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    Granted,
    /// Not enough tokens; the value is how long until `cost` tokens will have accrued.
    Blocked(Duration),
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, capacity: f64, refill_per_second: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_second).clamp(0.0, capacity);
        self.last_refill = now;
    }
}

/// Token bucket shared by every outbound Azure DevOps request.
///
/// The bucket starts full. Callers that cannot be served within `max_wait`
/// fail with `PipelensError::RateLimitExceeded` instead of queueing.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    max_wait: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_second: f64, max_wait: Duration) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_per_second: refill_per_second.max(0.0),
            max_wait,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refills the bucket and debits `cost` tokens if they are available.
    pub fn try_acquire(&self, cost: u32) -> Acquire {
        let cost = f64::from(cost);
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.refill(Instant::now(), self.capacity, self.refill_per_second);

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            return Acquire::Granted;
        }

        let missing = cost - bucket.tokens;
        if cost > self.capacity || self.refill_per_second <= 0.0 {
            return Acquire::Blocked(Duration::MAX);
        }
        Acquire::Blocked(
            Duration::try_from_secs_f64(missing / self.refill_per_second).unwrap_or(Duration::MAX),
        )
    }

    /// Takes `cost` tokens, sleeping for at most `max_wait` in total.
    ///
    /// # Errors
    ///
    /// Returns `PipelensError::RateLimitExceeded` with a retry hint when the tokens
    /// will not accrue before the wait bound runs out.
    pub async fn acquire(&self, cost: u32) -> Result<()> {
        let deadline = Instant::now() + self.max_wait;

        loop {
            let wait = match self.try_acquire(cost) {
                Acquire::Granted => return Ok(()),
                Acquire::Blocked(wait) => wait,
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if wait > remaining {
                warn!("Outbound rate limit reached, next token in {}ms", wait.as_millis());
                return Err(PipelensError::RateLimitExceeded { retry_after: wait });
            }

            debug!("Waiting {}ms for rate limit token", wait.as_millis());
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_starts_full_then_blocks() {
        let limiter = RateLimiter::new(3, 1.0, Duration::ZERO);

        for _ in 0..3 {
            assert_eq!(limiter.try_acquire(1), Acquire::Granted);
        }

        match limiter.try_acquire(1) {
            Acquire::Blocked(wait) => assert_eq!(wait, Duration::from_secs(1)),
            Acquire::Granted => panic!("bucket should be empty"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_capacity() {
        let limiter = RateLimiter::new(2, 10.0, Duration::ZERO);
        assert_eq!(limiter.try_acquire(2), Acquire::Granted);

        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(limiter.try_acquire(2), Acquire::Granted);
        assert!(matches!(limiter.try_acquire(1), Acquire::Blocked(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_within_bound() {
        let limiter = RateLimiter::new(1, 10.0, Duration::from_millis(250));
        tokio_test::assert_ok!(limiter.acquire(1).await);

        let started = Instant::now();
        tokio_test::assert_ok!(limiter.acquire(1).await);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_fails_fast_beyond_bound() {
        let limiter = RateLimiter::new(1, 1.0, Duration::from_millis(250));
        tokio_test::assert_ok!(limiter.acquire(1).await);

        let started = Instant::now();
        let err = limiter.acquire(1).await.unwrap_err();
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(
            err,
            PipelensError::RateLimitExceeded {
                retry_after: Duration::from_secs(1)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_above_capacity_never_granted() {
        let limiter = RateLimiter::new(2, 100.0, Duration::from_secs(10));
        assert_eq!(limiter.try_acquire(3), Acquire::Blocked(Duration::MAX));
        assert!(limiter.acquire(3).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debits_never_exceed_capacity_plus_refill() {
        let capacity = 5;
        let rate = 2.0;
        let limiter = RateLimiter::new(capacity, rate, Duration::ZERO);
        let start = Instant::now();
        let mut granted = 0u32;

        for _ in 0..40 {
            while limiter.try_acquire(1) == Acquire::Granted {
                granted += 1;
            }
            let allowed = f64::from(capacity) + rate * start.elapsed().as_secs_f64();
            assert!(f64::from(granted) <= allowed + 1e-9);
            tokio::time::advance(Duration::from_millis(130)).await;
        }

        assert!(granted > capacity);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_bucket() {
        let limiter = Arc::new(RateLimiter::new(4, 0.5, Duration::ZERO));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire(1).await.is_ok() })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 4);
    }
}
