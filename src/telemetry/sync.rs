//! Telemetry synchronizer
//!
//! Periodically pushes the telemetry record to the remote sink. The record is
//! serialized under its read lock and uploaded after the lock is released,
//! so a slow upload never blocks handlers appending measurements. A failed
//! upload waits for the next natural tick; there is no retry loop.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Level};

use super::RemoteSink;
use crate::core::{rfc3339_now, IntervalLimiter, TelemetryRecord};

/// Default interval between sync ticks (30 seconds).
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default object name of the uploaded record.
pub const DEFAULT_OBJECT_NAME: &str = "record.json";

/// Sync state reported to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// False when no sink could be constructed at startup.
    pub enabled: bool,
    pub uploads: u64,
    pub failures: u64,
    /// Ticks refused by the limiter.
    pub throttled: u64,
    pub last_success: Option<String>,
    pub last_error: Option<String>,
}

/// What a sync attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No sink configured.
    Disabled,
    /// The sync limiter refused this attempt.
    Throttled,
    /// Upload succeeded.
    Uploaded { bytes: usize },
    /// Serialization or upload failed.
    Failed(String),
}

/// The record, the optional sink and the limiter they share.
pub struct RecordSync {
    record: Arc<TelemetryRecord>,
    sink: Option<Arc<dyn RemoteSink>>,
    limiter: Arc<IntervalLimiter>,
    object_name: String,
    status: Mutex<SyncStatus>,
}

impl RecordSync {
    pub fn new(
        record: Arc<TelemetryRecord>,
        sink: Option<Arc<dyn RemoteSink>>,
        limiter: Arc<IntervalLimiter>,
        object_name: impl Into<String>,
    ) -> Self {
        let status = SyncStatus {
            enabled: sink.is_some(),
            ..SyncStatus::default()
        };
        Self {
            record,
            sink,
            limiter,
            object_name: object_name.into(),
            status: Mutex::new(status),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().clone()
    }

    pub fn record(&self) -> &Arc<TelemetryRecord> {
        &self.record
    }

    /// Upload the record now, bypassing the limiter.
    ///
    /// Callers that did not already pass the sync limiter should use
    /// [`tick`](Self::tick).
    pub async fn sync_now(&self) -> SyncOutcome {
        let Some(sink) = self.sink.as_ref() else {
            return SyncOutcome::Disabled;
        };

        // read lock is held only inside to_json
        let bytes = match self.record.to_json() {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(format!("serialize: {e}")),
        };
        let len = bytes.len();

        match sink.put(&self.object_name, bytes).await {
            Ok(()) => {
                let mut status = self.status.lock();
                status.uploads += 1;
                status.last_success = Some(rfc3339_now());
                status.last_error = None;
                SyncOutcome::Uploaded { bytes: len }
            }
            Err(e) => self.fail(e.to_string()),
        }
    }

    /// Limiter-gated sync against the current clock.
    pub async fn tick(&self) -> SyncOutcome {
        self.tick_at(Instant::now()).await
    }

    /// Limiter-gated sync for a tick scheduled at `scheduled`.
    ///
    /// The grant is charged to the scheduled deadline rather than the wakeup
    /// time, so a periodic tick is never refused by its own previous grant
    /// when the runtime wakes it a little late.
    pub async fn tick_at(&self, scheduled: Instant) -> SyncOutcome {
        if !self.is_enabled() {
            return SyncOutcome::Disabled;
        }
        if !self.limiter.allow_at(scheduled) {
            self.status.lock().throttled += 1;
            return SyncOutcome::Throttled;
        }
        self.sync_now().await
    }

    /// Close the sink, if any.
    pub async fn close(&self) {
        if let Some(sink) = self.sink.as_ref() {
            sink.close().await;
            info!(target: "telemetry", "Storage sink closed");
        }
    }

    fn fail(&self, error: String) -> SyncOutcome {
        let mut status = self.status.lock();
        status.failures += 1;
        status.last_error = Some(error.clone());
        SyncOutcome::Failed(error)
    }
}

/// Background daemon driving [`RecordSync::tick`].
pub struct TelemetrySyncer {
    sync: Arc<RecordSync>,
    interval: Duration,
}

impl TelemetrySyncer {
    pub fn new(sync: Arc<RecordSync>) -> Self {
        Self {
            sync,
            interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    /// Sets a custom tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Syncs on every tick until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            target: "telemetry",
            interval_secs = self.interval.as_secs(),
            "Telemetry syncer starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        // a late tick pushes the schedule back instead of bursting
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(target: "telemetry", "Telemetry syncer shutting down");
                    break;
                }

                scheduled = interval.tick() => {
                    let outcome = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            info!(target: "telemetry", "Telemetry syncer shutting down mid-upload");
                            break;
                        }
                        outcome = self.sync.tick_at(scheduled) => outcome,
                    };

                    match outcome {
                        SyncOutcome::Uploaded { bytes } => {
                            debug!(target: "telemetry", bytes, "Record synced");
                        }
                        SyncOutcome::Throttled => {
                            debug!(target: "telemetry", "Sync skipped, budget used by a forced sync");
                        }
                        SyncOutcome::Failed(error) => {
                            crate::log_telemetry!(Level::WARN, %error, "Record sync failed, retrying next tick");
                        }
                        SyncOutcome::Disabled => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::Measurement;
    use crate::core::RecordSnapshot;
    use crate::test_utils::MockSink;

    fn measurement() -> Measurement {
        Measurement {
            at: rfc3339_now(),
            action: "put".to_string(),
            node: "node1".to_string(),
            latency_us: 10,
            ok: true,
        }
    }

    fn setup(interval: Duration) -> (Arc<RecordSync>, Arc<MockSink>) {
        let record = Arc::new(TelemetryRecord::new(["tester"], 64));
        let sink = Arc::new(MockSink::new());
        let limiter = Arc::new(IntervalLimiter::new(interval));
        let sync = Arc::new(RecordSync::new(
            record,
            Some(sink.clone() as Arc<dyn RemoteSink>),
            limiter,
            DEFAULT_OBJECT_NAME,
        ));
        (sync, sink)
    }

    #[tokio::test]
    async fn test_disabled_without_sink() {
        let sync = RecordSync::new(
            Arc::new(TelemetryRecord::default()),
            None,
            Arc::new(IntervalLimiter::new(Duration::from_secs(30))),
            DEFAULT_OBJECT_NAME,
        );
        assert!(!sync.status().enabled);
        assert_eq!(sync.tick().await, SyncOutcome::Disabled);
        assert_eq!(sync.sync_now().await, SyncOutcome::Disabled);
    }

    #[tokio::test]
    async fn test_tick_uploads_serialized_record() {
        let (sync, sink) = setup(Duration::from_secs(30));
        sync.record().append("tester", measurement());

        assert!(matches!(sync.tick().await, SyncOutcome::Uploaded { .. }));

        let puts = sink.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, DEFAULT_OBJECT_NAME);
        let uploaded: RecordSnapshot = serde_json::from_slice(&puts[0].1).unwrap();
        assert_eq!(uploaded.endpoint("tester").unwrap().total_requests, 1);

        let status = sync.status();
        assert_eq!(status.uploads, 1);
        assert!(status.last_success.is_some());
    }

    #[tokio::test]
    async fn test_tick_is_rate_limited() {
        let (sync, sink) = setup(Duration::from_secs(30));
        assert!(matches!(sync.tick().await, SyncOutcome::Uploaded { .. }));
        assert_eq!(sync.tick().await, SyncOutcome::Throttled);
        assert_eq!(sink.puts().len(), 1);
        assert_eq!(sync.status().throttled, 1);
    }

    #[tokio::test]
    async fn test_tick_on_schedule_is_granted() {
        let (sync, sink) = setup(Duration::from_secs(30));
        let t0 = Instant::now();

        assert!(matches!(sync.tick_at(t0).await, SyncOutcome::Uploaded { .. }));
        // the next deadline is exactly one interval later
        assert!(matches!(
            sync.tick_at(t0 + Duration::from_secs(30)).await,
            SyncOutcome::Uploaded { .. }
        ));
        assert_eq!(sync.tick_at(t0 + Duration::from_secs(59)).await, SyncOutcome::Throttled);
        assert_eq!(sink.puts().len(), 2);
    }

    #[tokio::test]
    async fn test_forced_sync_consumes_next_tick() {
        let (sync, sink) = setup(Duration::from_secs(30));
        let t0 = Instant::now();

        // a forced upload between two ticks takes the budget
        assert!(matches!(sync.tick_at(t0 + Duration::from_secs(10)).await, SyncOutcome::Uploaded { .. }));
        assert_eq!(sync.tick_at(t0 + Duration::from_secs(30)).await, SyncOutcome::Throttled);
        assert!(matches!(
            sync.tick_at(t0 + Duration::from_secs(60)).await,
            SyncOutcome::Uploaded { .. }
        ));
        assert_eq!(sink.puts().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_retried() {
        let (sync, sink) = setup(Duration::from_millis(1));
        sink.fail(true);

        assert!(matches!(sync.tick().await, SyncOutcome::Failed(_)));
        let status = sync.status();
        assert_eq!(status.failures, 1);
        assert!(status.last_error.is_some());
        assert!(sink.puts().is_empty());

        sink.fail(false);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(sync.tick().await, SyncOutcome::Uploaded { .. }));
        assert!(sync.status().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_syncer_ticks_on_interval() {
        let (sync, sink) = setup(Duration::from_secs(10));
        let shutdown = CancellationToken::new();
        let syncer = TelemetrySyncer::new(sync).with_interval(Duration::from_secs(10));
        let task = tokio::spawn(syncer.run(shutdown.clone()));

        // first tick is skipped
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sink.puts().is_empty());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sink.puts().len(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_syncer_uploads_every_period_on_real_clock() {
        let period = Duration::from_millis(20);
        let (sync, sink) = setup(period);
        let shutdown = CancellationToken::new();
        let syncer = TelemetrySyncer::new(sync.clone()).with_interval(period);
        let task = tokio::spawn(syncer.run(shutdown.clone()));

        tokio::time::sleep(period * 15).await;
        shutdown.cancel();
        task.await.unwrap();

        let status = sync.status();
        assert_eq!(status.throttled, 0);
        assert_eq!(status.failures, 0);
        assert!(status.uploads >= 5, "only {} uploads", status.uploads);
        assert_eq!(sink.puts().len() as u64, status.uploads);
    }

    #[tokio::test]
    async fn test_close_reaches_sink() {
        let (sync, sink) = setup(Duration::from_secs(1));
        sync.close().await;
        assert!(sink.is_closed());
    }
}
