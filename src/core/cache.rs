//! Short-TTL response cache
//!
//! Memoizes handler output per request fingerprint so that duplicate bursts
//! from the UI do not each cost a limiter check and a cluster round-trip.
//! A janitor daemon sweeps expired entries on its own schedule, keeping
//! memory bounded even when no requests arrive.

use axum::http::{HeaderValue, Method, StatusCode};
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default time-to-live of a cached response (2 seconds).
pub const DEFAULT_TTL: Duration = Duration::from_secs(2);

/// Default period of the janitor sweep (5 seconds).
pub const DEFAULT_JANITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Deterministic cache key of a request.
///
/// Hash of method, path and the query pairs decoded and sorted, so
/// `?a=1&b=2` and `?b=2&a=1` share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(method: &Method, path: &str, query: Option<&str>) -> Self {
        let mut pairs: Vec<(String, String)> = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        pairs.sort();

        let normalized = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();

        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(path.as_bytes());
        hasher.update(b"?");
        hasher.update(normalized.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A captured, complete handler response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

#[derive(Debug)]
struct CacheEntry {
    response: CachedResponse,
    expires_at: Instant,
}

/// Fingerprint-keyed response store with a fixed TTL.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live entry for `key`, if any.
    pub fn get(&self, key: &Fingerprint) -> Option<CachedResponse> {
        self.get_at(key, Instant::now())
    }

    /// Lookup against an explicit clock reading. An entry is never returned
    /// at or past its expiry, even if the janitor has not removed it yet.
    pub fn get_at(&self, key: &Fingerprint, now: Instant) -> Option<CachedResponse> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.response.clone())
    }

    /// Store `response` under `key`, live for one TTL from now.
    pub fn insert(&self, key: Fingerprint, response: CachedResponse) {
        self.insert_at(key, response, Instant::now());
    }

    pub fn insert_at(&self, key: Fingerprint, response: CachedResponse, now: Instant) {
        let entry = CacheEntry {
            response,
            expires_at: now + self.ttl,
        };
        self.entries.lock().insert(key, entry);
    }

    /// Remove every entry whose expiry is at or before now.
    /// Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        // each entry is judged by its own expiry under the lock, so a fresh
        // re-insert of the same key survives the sweep
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Background daemon that evicts expired cache entries.
///
/// Runs independently of request traffic until cancelled.
pub struct CacheJanitor {
    cache: Arc<ResponseCache>,
    interval: Duration,
}

impl CacheJanitor {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self {
            cache,
            interval: DEFAULT_JANITOR_INTERVAL,
        }
    }

    /// Sets a custom sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sweeps on every tick until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            target: "api",
            interval_ms = self.interval.as_millis() as u64,
            "Cache janitor starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(target: "api", "Cache janitor shutting down");
                    break;
                }

                _ = interval.tick() => {
                    let evicted = self.cache.sweep();
                    if evicted > 0 {
                        debug!(target: "api", evicted, remaining = self.cache.len(), "Evicted expired responses");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn response(body: &'static str) -> CachedResponse {
        CachedResponse {
            status: StatusCode::OK,
            content_type: Some(HeaderValue::from_static("application/json")),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn key(path: &str) -> Fingerprint {
        Fingerprint::new(&Method::GET, path, None)
    }

    #[test]
    fn test_fingerprint_ignores_query_order() {
        let a = Fingerprint::new(&Method::GET, "/client-request", Some("action=put&key=a&value=1"));
        let b = Fingerprint::new(&Method::GET, "/client-request", Some("value=1&action=put&key=a"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_route_method_and_values() {
        let base = Fingerprint::new(&Method::GET, "/conn", Some("x=1"));
        assert_ne!(base, Fingerprint::new(&Method::GET, "/server-status", Some("x=1")));
        assert_ne!(base, Fingerprint::new(&Method::HEAD, "/conn", Some("x=1")));
        assert_ne!(base, Fingerprint::new(&Method::GET, "/conn", Some("x=2")));
        assert_ne!(base, Fingerprint::new(&Method::GET, "/conn", None));
    }

    #[test]
    fn test_fingerprint_decodes_before_comparing() {
        let encoded = Fingerprint::new(&Method::GET, "/p", Some("k=a%20b"));
        let plus = Fingerprint::new(&Method::GET, "/p", Some("k=a+b"));
        assert_eq!(encoded, plus);
    }

    #[test]
    fn test_hit_within_ttl_miss_after() {
        let cache = ResponseCache::new(Duration::from_secs(2));
        let t0 = Instant::now();
        cache.insert_at(key("/conn"), response("{}"), t0);

        assert!(cache.get_at(&key("/conn"), t0).is_some());
        assert!(cache.get_at(&key("/conn"), t0 + Duration::from_millis(1999)).is_some());
        // never served at or past expiry, janitor or not
        assert!(cache.get_at(&key("/conn"), t0 + Duration::from_secs(2)).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let cache = ResponseCache::new(Duration::from_secs(2));
        let t0 = Instant::now();
        cache.insert_at(key("/old"), response("old"), t0);
        cache.insert_at(key("/new"), response("new"), t0 + Duration::from_secs(1));

        assert_eq!(cache.sweep_at(t0 + Duration::from_secs(2)), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_at(&key("/new"), t0 + Duration::from_secs(2)).is_some());
    }

    #[test]
    fn test_reinsert_survives_sweep() {
        let cache = ResponseCache::new(Duration::from_secs(2));
        let t0 = Instant::now();
        cache.insert_at(key("/s"), response("first"), t0);
        cache.insert_at(key("/s"), response("second"), t0 + Duration::from_secs(3));

        assert_eq!(cache.sweep_at(t0 + Duration::from_secs(3)), 0);
        let hit = cache.get_at(&key("/s"), t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_evicts_without_traffic() {
        let cache = Arc::new(ResponseCache::new(Duration::from_millis(500)));
        cache.insert(key("/conn"), response("{}"));

        let shutdown = CancellationToken::new();
        let janitor = CacheJanitor::new(cache.clone()).with_interval(Duration::from_secs(1));
        let task = tokio::spawn(janitor.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cache.is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_stops_on_cancel() {
        let cache = Arc::new(ResponseCache::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(CacheJanitor::new(cache).run(shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("janitor did not exit")
            .unwrap();
    }

    proptest! {
        #[test]
        fn prop_retrievable_until_expiry(ttl_ms in 1u64..10_000, probe_ms in 0u64..20_000) {
            let cache = ResponseCache::new(Duration::from_millis(ttl_ms));
            let t0 = Instant::now();
            cache.insert_at(key("/p"), response("v"), t0);

            let probe = t0 + Duration::from_millis(probe_ms);
            let live = cache.get_at(&key("/p"), probe).is_some();
            prop_assert_eq!(live, probe_ms < ttl_ms);

            cache.sweep_at(probe);
            prop_assert_eq!(cache.len(), usize::from(probe_ms < ttl_ms));
        }

        #[test]
        fn prop_fingerprint_ignores_pair_order(
            pairs in proptest::collection::vec(("[a-z]{1,4}", "[a-z0-9 ]{0,4}"), 0..6)
        ) {
            let encode = |pairs: &[(String, String)]| {
                url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish()
            };
            let mut reversed = pairs.clone();
            reversed.reverse();

            prop_assert_eq!(
                Fingerprint::new(&Method::GET, "/conn", Some(&encode(&pairs))),
                Fingerprint::new(&Method::GET, "/conn", Some(&encode(&reversed)))
            );
        }
    }
}
