//! Per-node counters.
//!
//! [`Counter`] is a relaxed atomic: suitable for statistics, not for
//! coordinating tasks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A monotonically increasing counter.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

#[derive(Debug, Default)]
pub struct NodeMetrics {
    pub auth_verified: Counter,
    pub auth_rejected: Counter,
    pub join_accepted: Counter,
    pub join_rejected: Counter,
    pub join_rate_limited: Counter,
    /// Join attempts that reached invitation decryption.
    pub join_decrypt_attempts: Counter,
    pub members_learned: Counter,
    pub proxy_calls: Counter,
    pub proxy_denied: Counter,
    pub query_envelopes: Counter,
    pub query_denied: Counter,
    pub file_requests: Counter,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            auth_verified: self.auth_verified.get(),
            auth_rejected: self.auth_rejected.get(),
            join_accepted: self.join_accepted.get(),
            join_rejected: self.join_rejected.get(),
            join_rate_limited: self.join_rate_limited.get(),
            join_decrypt_attempts: self.join_decrypt_attempts.get(),
            members_learned: self.members_learned.get(),
            proxy_calls: self.proxy_calls.get(),
            proxy_denied: self.proxy_denied.get(),
            query_envelopes: self.query_envelopes.get(),
            query_denied: self.query_denied.get(),
            file_requests: self.file_requests.get(),
        }
    }
}

/// Point-in-time copy of [`NodeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub auth_verified: u64,
    pub auth_rejected: u64,
    pub join_accepted: u64,
    pub join_rejected: u64,
    pub join_rate_limited: u64,
    pub join_decrypt_attempts: u64,
    pub members_learned: u64,
    pub proxy_calls: u64,
    pub proxy_denied: u64,
    pub query_envelopes: u64,
    pub query_denied: u64,
    pub file_requests: u64,
}
