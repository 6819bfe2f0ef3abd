//! Outbound rate limiting
//!
//! Per-connection limiter shared by application sends and keepalive pings.
//! Slots are spaced `1s / rate` apart with room for `burst` back-to-back
//! sends; a rate of zero disables limiting.

use crate::{Result, StreamError};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Send-slot limiter
#[derive(Debug)]
pub struct RateLimiter {
    /// `None` when unlimited
    bucket: Option<Mutex<SlotBucket>>,
}

#[derive(Debug)]
struct SlotBucket {
    /// Time between two slots
    interval: Duration,
    /// How far ahead of the schedule a burst may run
    tolerance: Duration,
    /// Earliest time the schedule allows the next send
    next_free: Instant,
}

impl SlotBucket {
    /// Take a slot at `now`, or report how long until one frees up
    fn try_take(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        let horizon = now + self.tolerance;
        if horizon < self.next_free {
            return Err(self.next_free - horizon);
        }

        self.next_free = self.next_free.max(now) + self.interval;
        Ok(())
    }
}

impl RateLimiter {
    /// `rate` sends per second, `burst` of them back-to-back (minimum 1)
    pub fn new(rate: u64, burst: u32) -> Self {
        if rate == 0 {
            return Self::unlimited();
        }

        let interval = Duration::from_nanos((1_000_000_000 / rate).max(1));
        let burst = burst.max(1);

        Self {
            bucket: Some(Mutex::new(SlotBucket {
                interval,
                tolerance: interval * (burst - 1),
                next_free: Instant::now(),
            })),
        }
    }

    /// Limiter that never waits
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// Try to take a slot without waiting
    pub fn try_acquire(&self) -> bool {
        match &self.bucket {
            Some(bucket) => bucket.lock().try_take(Instant::now()).is_ok(),
            None => true,
        }
    }

    /// Time until a slot is available (zero when one is free now)
    pub fn time_until_available(&self) -> Duration {
        match &self.bucket {
            Some(bucket) => {
                let bucket = bucket.lock();
                let horizon = Instant::now() + bucket.tolerance;
                bucket.next_free.saturating_duration_since(horizon)
            }
            None => Duration::ZERO,
        }
    }

    /// Wait for a send slot
    ///
    /// Nothing is reserved while waiting, so abandoning the wait (cancel or
    /// drop) leaves the schedule untouched.
    ///
    /// # Errors
    /// `StreamError::Cancelled` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(bucket) = &self.bucket else {
            return if cancel.is_cancelled() {
                Err(StreamError::Cancelled)
            } else {
                Ok(())
            };
        };

        loop {
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }

            let wait = match bucket.lock().try_take(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_unlimited() {
        let limiter = RateLimiter::new(0, 1);
        assert!(limiter.is_unlimited());
        for _ in 0..1_000 {
            assert!(limiter.try_acquire());
        }
        assert_eq!(limiter.time_until_available(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_denied() {
        let limiter = RateLimiter::new(10, 3);

        for _ in 0..3 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
        assert!(limiter.time_until_available() > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_spaces_sends() {
        let limiter = RateLimiter::new(10, 1);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..5 {
            assert_ok!(limiter.acquire(&cancel).await);
        }

        // First slot is immediate, the other four are 100ms apart
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_cancelled_while_waiting() {
        let limiter = Arc::new(RateLimiter::new(1, 1));
        let cancel = CancellationToken::new();

        assert_ok!(limiter.acquire(&cancel).await);

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(StreamError::Cancelled)));
    }

    #[tokio::test]
    async fn test_acquire_with_cancelled_token() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_err!(RateLimiter::unlimited().acquire(&cancel).await);
        assert_err!(RateLimiter::new(5, 1).acquire(&cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_keeps_schedule() {
        let limiter = RateLimiter::new(2, 1);
        let cancel = CancellationToken::new();
        assert_ok!(limiter.acquire(&cancel).await);

        // Drop a pending acquisition halfway through its wait
        let _ = tokio::time::timeout(Duration::from_millis(200), limiter.acquire(&cancel)).await;

        // The slot at 500ms is still free for the next caller
        let start = Instant::now();
        assert_ok!(limiter.acquire(&cancel).await);
        assert!(start.elapsed() <= Duration::from_millis(300));
    }
}
