//! Dispatch metrics
//!
//! Lock-free counters using atomic operations.
//! Updated by the request dispatcher, exported via `/server-status`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Request dispatch counters
pub struct DispatchMetrics {
    /// Total requests seen by the dispatcher
    requests: AtomicU64,
    /// Requests answered from the response cache
    cache_hits: AtomicU64,
    /// Requests that reached a handler
    cache_misses: AtomicU64,
    /// Requests refused by a rate limiter
    rejected: AtomicU64,
    /// Cluster operations abandoned because of shutdown
    cancelled: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

/// Metrics snapshot for API export
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DispatchSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub hit_ratio: f64,
    pub uptime_seconds: u64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub fn record_cache_hit(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_miss(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of metrics
    pub fn snapshot(&self) -> DispatchSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);

        let hit_ratio = if requests > 0 {
            cache_hits as f64 / requests as f64
        } else {
            0.0
        };

        DispatchSnapshot {
            requests,
            cache_hits,
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            hit_ratio,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let snapshot = DispatchMetrics::new().snapshot();

        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.rejected, 0);
        assert_eq!(snapshot.hit_ratio, 0.0);
    }

    #[test]
    fn test_cache_counters() {
        let metrics = DispatchMetrics::new();

        metrics.record_cache_miss();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 4);
        assert_eq!(snapshot.cache_hits, 3);
        assert_eq!(snapshot.cache_misses, 1);
        assert!((snapshot.hit_ratio - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejections_do_not_count_as_requests() {
        let metrics = DispatchMetrics::new();
        metrics.record_cache_miss();
        metrics.record_rejected();
        metrics.record_cancelled();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.cancelled, 1);
    }
}
