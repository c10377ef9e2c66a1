//! Advisory token-bucket pacing for byte transfers.
//!
//! The bandwidth knobs are advisory: the bucket paces whole request and
//! response bodies as they pass through the client, and nothing else in
//! the system enforces the limit.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiting bytes per second. Rate 0 disables pacing.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter for `bytes_per_sec`; 0 means unlimited.
    #[must_use]
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        // One second of burst keeps small metadata-sized bodies unpaced.
        let capacity = rate.max(1.0);
        Self {
            rate,
            capacity,
            bucket: Mutex::new(Bucket { tokens: capacity, last_refill: Instant::now() }),
        }
    }

    /// Whether pacing is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.rate > 0.0
    }

    /// Wait until `bytes` tokens are available, then consume them.
    pub async fn acquire(&self, bytes: u64) {
        if !self.is_enabled() {
            return;
        }

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
                bucket.last_refill = Instant::now();

                let needed = bytes as f64;
                if bucket.tokens >= needed {
                    bucket.tokens -= needed;
                    return;
                }
                // Oversized bodies may drive the balance negative once
                // rather than stalling forever on a small capacity.
                if needed > self.capacity {
                    bucket.tokens -= needed;
                    return;
                }
                Duration::from_secs_f64((needed - bucket.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = RateLimiter::new(0);
        assert!(!limiter.is_enabled());
        let started = Instant::now();
        limiter.acquire(u64::MAX).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_burst_within_capacity_is_immediate() {
        let limiter = RateLimiter::new(1_000_000);
        let started = Instant::now();
        limiter.acquire(500_000).await;
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_pacing_waits_for_refill() {
        let limiter = RateLimiter::new(100_000);
        // Drain the initial burst allowance.
        limiter.acquire(100_000).await;

        // Another 40 KB at 100 KB/s needs roughly 0.4 s of refill.
        let started = Instant::now();
        limiter.acquire(40_000).await;
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
