//! Token-bucket rate limiter shared by every outbound call

use crate::cancel::CancellationToken;
use atelier_core::Result;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Blocking token bucket. `rate` tokens are added per second up to
/// `capacity`; each outbound request takes one. A non-positive rate
/// disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            rate: requests_per_second,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A limiter that never blocks
    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate.is_nan() || self.rate <= 0.0
    }

    /// Take a token if one is available, otherwise report how long until one is
    fn take_at(&self, now: Instant) -> std::result::Result<(), Duration> {
        if self.is_unlimited() {
            return Ok(());
        }
        let mut bucket = self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = bucket.last_refill.max(now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate))
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.take_at(Instant::now()).is_ok()
    }

    /// Block until a token is available
    pub fn acquire(&self) {
        while let Err(wait) = self.take_at(Instant::now()) {
            std::thread::sleep(wait);
        }
    }

    /// Block until a token is available or the run is cancelled
    pub fn acquire_cancellable(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            cancel.check()?;
            match self.take_at(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(wait) => cancel.sleep(wait)?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_empty() {
        let limiter = RateLimiter::new(1.0, 2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_refills_over_time() {
        let limiter = RateLimiter::new(10.0, 1);
        let t0 = Instant::now();
        assert!(limiter.take_at(t0).is_ok());
        let wait = limiter.take_at(t0).unwrap_err();
        assert!(wait <= Duration::from_millis(101));
        assert!(limiter.take_at(t0 + Duration::from_millis(150)).is_ok());
    }

    #[test]
    fn test_acquire_paces_requests() {
        let limiter = RateLimiter::new(20.0, 1);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire();
        }
        // First token is free, the next three each wait ~50ms
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn test_unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();
        for _ in 0..1000 {
            assert!(limiter.try_acquire());
        }
    }

    #[test]
    fn test_acquire_cancellable() {
        let limiter = RateLimiter::new(0.01, 1);
        let cancel = CancellationToken::new();
        limiter.acquire_cancellable(&cancel).unwrap();
        cancel.cancel();
        assert!(limiter.acquire_cancellable(&cancel).is_err());
    }
}
