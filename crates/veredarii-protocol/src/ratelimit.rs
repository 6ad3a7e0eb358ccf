//! Token-bucket limiter shared by every join attempt on a network.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::ProtocolError;

/// Refill rate (tokens per second) and bucket size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub rate: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: 0.2,
            burst: 3,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A limiter that starts with a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(config.burst),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Take one token, or fail with [`ProtocolError::RateLimited`].
    pub async fn acquire(&self) -> Result<(), ProtocolError> {
        if self.try_acquire().await {
            Ok(())
        } else {
            Err(ProtocolError::RateLimited)
        }
    }

    /// Take one token if available.
    pub async fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now()).await
    }

    pub async fn try_acquire_at(&self, now: Instant) -> bool {
        let mut bucket = self.bucket.lock().await;
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.rate).min(f64::from(self.config.burst));
        bucket.last_refill = now.max(bucket.last_refill);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn burst_then_reject() {
        let limiter = RateLimiter::new(RateLimitConfig { rate: 0.2, burst: 3 });
        let start = Instant::now();
        assert!(limiter.try_acquire_at(start).await);
        assert!(limiter.try_acquire_at(start + Duration::from_millis(100)).await);
        assert!(limiter.try_acquire_at(start + Duration::from_millis(200)).await);
        assert!(!limiter.try_acquire_at(start + Duration::from_millis(900)).await);
    }

    #[tokio::test]
    async fn refills_at_rate() {
        let limiter = RateLimiter::new(RateLimitConfig { rate: 0.2, burst: 3 });
        let start = Instant::now();
        for _ in 0..3 {
            assert!(limiter.try_acquire_at(start).await);
        }
        assert!(!limiter.try_acquire_at(start + Duration::from_secs(4)).await);
        assert!(limiter.try_acquire_at(start + Duration::from_secs(6)).await);
        assert!(!limiter.try_acquire_at(start + Duration::from_secs(6)).await);
    }

    #[tokio::test]
    async fn never_exceeds_burst() {
        let limiter = RateLimiter::new(RateLimitConfig { rate: 10.0, burst: 2 });
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(limiter.try_acquire_at(later).await);
        assert!(limiter.try_acquire_at(later).await);
        assert!(!limiter.try_acquire_at(later).await);
    }

    #[tokio::test]
    async fn empty_bucket_is_rate_limited() {
        let limiter = RateLimiter::new(RateLimitConfig { rate: 0.001, burst: 1 });
        limiter.acquire().await.unwrap();
        assert!(matches!(limiter.acquire().await, Err(ProtocolError::RateLimited)));
    }
}
