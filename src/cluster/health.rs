//! Cluster health snapshot and poller
//!
//! The poller queries the cluster on a fixed period and publishes what it
//! sees to a [`StatusBoard`]. `/server-status` only ever reads the board, so
//! it never waits on the cluster. A failed query keeps the previous
//! snapshot.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ClusterHandle, MemberStatus};
use crate::core::rfc3339_now;

/// Default interval between health polls (1 second).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Overall cluster health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// No poll has completed yet.
    Unknown,
    /// Every member is running and there is a leader.
    Healthy,
    /// A leader exists but some members are down.
    Degraded,
    /// No leader.
    Unavailable,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unavailable => "unavailable",
        }
    }

    fn classify(members: &[MemberStatus]) -> Self {
        let has_leader = members.iter().any(|m| m.is_leader);
        let all_running = members.iter().all(|m| m.running);
        match (has_leader, all_running) {
            (false, _) => HealthState::Unavailable,
            (true, true) => HealthState::Healthy,
            (true, false) => HealthState::Degraded,
        }
    }
}

/// Point-in-time view of the cluster served by `/server-status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub state: HealthState,
    pub leader: Option<String>,
    pub running_members: usize,
    pub members: Vec<MemberStatus>,
    /// When the snapshot was taken (RFC 3339), None before the first poll.
    pub observed_at: Option<String>,
}

impl ClusterStatus {
    /// Snapshot served before the first poll completes.
    pub fn initial() -> Self {
        Self {
            state: HealthState::Unknown,
            leader: None,
            running_members: 0,
            members: Vec::new(),
            observed_at: None,
        }
    }

    pub fn from_members(members: Vec<MemberStatus>) -> Self {
        Self {
            state: HealthState::classify(&members),
            leader: members.iter().find(|m| m.is_leader).map(|m| m.name.clone()),
            running_members: members.iter().filter(|m| m.running).count(),
            members,
            observed_at: Some(rfc3339_now()),
        }
    }
}

impl Default for ClusterStatus {
    fn default() -> Self {
        Self::initial()
    }
}

/// Latest published snapshot plus poll bookkeeping.
#[derive(Debug)]
pub struct StatusBoard {
    current: RwLock<ClusterStatus>,
    polls_ok: AtomicU64,
    polls_failed: AtomicU64,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(ClusterStatus::initial()),
            polls_ok: AtomicU64::new(0),
            polls_failed: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, status: ClusterStatus) {
        *self.current.write() = status;
        self.polls_ok.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed poll; the current snapshot stays in place.
    pub fn record_failure(&self) {
        self.polls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ClusterStatus {
        self.current.read().clone()
    }

    pub fn polls_ok(&self) -> u64 {
        self.polls_ok.load(Ordering::Relaxed)
    }

    pub fn polls_failed(&self) -> u64 {
        self.polls_failed.load(Ordering::Relaxed)
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// Background daemon refreshing the [`StatusBoard`].
pub struct HealthPoller {
    handle: Arc<dyn ClusterHandle>,
    board: Arc<StatusBoard>,
    interval: Duration,
}

impl HealthPoller {
    pub fn new(handle: Arc<dyn ClusterHandle>, board: Arc<StatusBoard>) -> Self {
        Self {
            handle,
            board,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets a custom poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Query the cluster once and publish the result.
    pub async fn poll_once(&self) {
        match self.handle.status().await {
            Ok(members) => {
                let status = ClusterStatus::from_members(members);
                debug!(
                    target: "cluster",
                    state = status.state.as_str(),
                    leader = ?status.leader,
                    running = status.running_members,
                    "Published cluster status"
                );
                self.board.publish(status);
            }
            Err(e) => {
                self.board.record_failure();
                crate::log_cluster!(
                    tracing::Level::WARN,
                    error = %e,
                    failures = self.board.polls_failed(),
                    "Health poll failed, keeping previous snapshot"
                );
            }
        }
    }

    /// Polls on every tick until `shutdown` fires. The first poll runs
    /// immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            target: "cluster",
            interval_ms = self.interval.as_millis() as u64,
            "Health poller starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(target: "cluster", "Health poller shutting down");
                    break;
                }

                _ = interval.tick() => {
                    // a poll that outlives shutdown is abandoned
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            info!(target: "cluster", "Health poller shutting down");
                            break;
                        }
                        _ = self.poll_once() => {}
                    }
                }
            }
        }
    }
}
