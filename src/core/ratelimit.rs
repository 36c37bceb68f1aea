//! Interval rate limiter
//!
//! Admission control for one route-class: at most one request is let
//! through per interval, no matter how many callers race for it.
//! Rejected callers are not queued, they are told to come back later.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// One allow-decision per fixed interval, shared by every caller of a route-class.
#[derive(Debug)]
pub struct IntervalLimiter {
    /// Minimum spacing between two granted requests
    interval: Duration,
    /// When the last request was granted (None until the first grant)
    last_granted: Mutex<Option<Instant>>,
}

impl IntervalLimiter {
    /// Create a limiter that grants once per `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_granted: Mutex::new(None),
        }
    }

    /// Configured interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Try to take this interval's slot.
    ///
    /// Returns `true` and records the grant if the interval since the last
    /// grant has fully elapsed, `false` otherwise.
    #[inline]
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// [`allow`](Self::allow) against an explicit clock reading.
    pub fn allow_at(&self, now: Instant) -> bool {
        // check and update under the same guard
        let mut last = self.last_granted.lock();
        match *last {
            Some(granted) if now < granted + self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Time left until the next call could be granted (zero if it would be now)
    pub fn retry_after(&self) -> Duration {
        self.retry_after_at(Instant::now())
    }

    /// [`retry_after`](Self::retry_after) against an explicit clock reading.
    pub fn retry_after_at(&self, now: Instant) -> Duration {
        match *self.last_granted.lock() {
            Some(granted) => (granted + self.interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

/// The limiter set of a running server, one instance per route-class.
///
/// Separate instances keep a burst on one endpoint from eating the budget
/// of another.
#[derive(Debug)]
pub struct Limiters {
    /// `/conn` and `/server-status`
    pub read: IntervalLimiter,
    /// Data operations on `/client-request`
    pub client_request: IntervalLimiter,
    /// Member stop/restart on `/client-request`
    pub stop_restart: IntervalLimiter,
    /// `/get-record` and the telemetry sync tick
    pub sync_record: std::sync::Arc<IntervalLimiter>,
}

impl Limiters {
    pub fn new(
        read: Duration,
        client_request: Duration,
        stop_restart: Duration,
        sync_record: Duration,
    ) -> Self {
        Self {
            read: IntervalLimiter::new(read),
            client_request: IntervalLimiter::new(client_request),
            stop_restart: IntervalLimiter::new(stop_restart),
            sync_record: std::sync::Arc::new(IntervalLimiter::new(sync_record)),
        }
    }
}
