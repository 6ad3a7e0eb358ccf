//! Replay cache for handshake signatures.
//!
//! A signature seen within the TTL is a replay. Entries older than the TTL
//! are swept periodically; the cache is also bounded so a flood of unique
//! claims cannot grow it without limit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Hard cap on remembered signatures.
pub const MAX_CACHE_SIZE: usize = 100_000;

#[derive(Debug)]
pub struct ReplayCache {
    ttl: Duration,
    seen: Mutex<HashMap<Vec<u8>, Instant>>,
}

impl ReplayCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record `signature`; returns `false` if it was already seen within the TTL.
    pub async fn check_and_record(&self, signature: &[u8]) -> bool {
        self.check_and_record_at(signature, Instant::now()).await
    }

    pub async fn check_and_record_at(&self, signature: &[u8], now: Instant) -> bool {
        let mut seen = self.seen.lock().await;
        if let Some(at) = seen.get(signature) {
            if now.saturating_duration_since(*at) < self.ttl {
                return false;
            }
        }
        if seen.len() >= MAX_CACHE_SIZE {
            let ttl = self.ttl;
            seen.retain(|_, at| now.saturating_duration_since(*at) < ttl);
            if seen.len() >= MAX_CACHE_SIZE {
                if let Some(oldest) = seen.iter().min_by_key(|(_, at)| **at).map(|(k, _)| k.clone()) {
                    seen.remove(&oldest);
                }
            }
        }
        seen.insert(signature.to_vec(), now);
        true
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now()).await
    }

    pub async fn evict_expired_at(&self, now: Instant) -> usize {
        let mut seen = self.seen.lock().await;
        let before = seen.len();
        let ttl = self.ttl;
        seen.retain(|_, at| now.saturating_duration_since(*at) < ttl);
        before - seen.len()
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_within_ttl_is_replay() {
        let cache = ReplayCache::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(cache.check_and_record_at(b"sig", now).await);
        assert!(!cache.check_and_record_at(b"sig", now + Duration::from_secs(59)).await);
        assert!(cache.check_and_record_at(b"other", now).await);
    }

    #[tokio::test]
    async fn duplicate_after_ttl_is_accepted() {
        let cache = ReplayCache::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(cache.check_and_record_at(b"sig", now).await);
        assert!(cache.check_and_record_at(b"sig", now + Duration::from_secs(61)).await);
    }

    #[tokio::test]
    async fn eviction_drops_only_expired() {
        let cache = ReplayCache::new(Duration::from_secs(60));
        let now = Instant::now();
        cache.check_and_record_at(b"old", now).await;
        cache.check_and_record_at(b"new", now + Duration::from_secs(50)).await;

        let removed = cache.evict_expired_at(now + Duration::from_secs(70)).await;
        assert_eq!(removed, 1);
        assert_eq!(cache.len().await, 1);
    }
}
