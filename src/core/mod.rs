//! Shared-state primitives used by the dispatch layer and the daemons
//!
//! - IntervalLimiter: one grant per interval, per route-class
//! - ResponseCache: short-TTL memoization keyed by request fingerprint
//! - TelemetryRecord: per-endpoint measurements behind one RwLock

pub mod cache;
pub mod ratelimit;
pub mod record;

pub use cache::{CacheJanitor, CachedResponse, Fingerprint, ResponseCache};
pub use ratelimit::{IntervalLimiter, Limiters};
pub use record::{EndpointData, Measurement, RecordSnapshot, TelemetryRecord};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Current UTC time as RFC 3339, empty if the clock cannot be formatted
pub fn rfc3339_now() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}
