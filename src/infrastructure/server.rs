//! Process lifecycle
//!
//! [`Server::start`] brings the cluster up before anything is served, then
//! runs the HTTP listener and the background daemons as supervised
//! activities sharing one cancellation token. A failing or panicking
//! activity cancels its siblings and is reported by [`Server::stop`].

use futures_util::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{error, info, warn};

use super::api::{router, AppState};
use super::config::Config;
use super::metrics::DispatchMetrics;
use crate::cluster::{ClusterLauncher, ClusterSupervisor, LocalLauncher, PortAllocator};
use crate::core::{CacheJanitor, ResponseCache, TelemetryRecord};
use crate::telemetry::{HttpObjectStore, RecordSync, RemoteSink, SinkConfig, TelemetrySyncer};
use crate::{LabError, Result};

/// Where the telemetry sink comes from
pub enum SinkSource {
    /// Sync disabled
    None,
    /// Build an [`HttpObjectStore`] from this credentials document
    Credentials(Vec<u8>),
    /// Use an already constructed sink
    Sink(Arc<dyn RemoteSink>),
}

/// Lifecycle state of a [`Server`]
///
/// Only ever moves forward: `Created → Running → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Cluster up, activities not yet spawned
    Created,
    Running,
    Stopping,
    Stopped,
}

impl ServerState {
    /// Whether `next` is the single step after `self`
    pub fn can_advance_to(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Created, Running) | (Running, Stopping) | (Stopping, Stopped)
        )
    }
}

/// Move `state` to `next`; out-of-order transitions are refused
fn advance(state: &Mutex<ServerState>, next: ServerState) -> bool {
    let mut current = state.lock();
    if !current.can_advance_to(next) {
        warn!(target: "main", from = ?*current, to = ?next, "Refused server state transition");
        return false;
    }
    *current = next;
    true
}

/// What `stop` tears down
struct Running {
    cluster: Arc<ClusterSupervisor>,
    sync: Arc<RecordSync>,
    supervisor: JoinHandle<std::result::Result<(), String>>,
}

/// A running control plane
pub struct Server {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Mutex<ServerState>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Server {
    /// Start the cluster, bind the listener and spawn every activity.
    ///
    /// # Errors
    /// Invalid configuration, cluster bootstrap failure or a listener that
    /// cannot be bound. Nothing is left running when this fails.
    pub async fn start(
        config: &Config,
        launcher: &dyn ClusterLauncher,
        ports: &PortAllocator,
        sink: SinkSource,
    ) -> Result<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();

        let cluster = Arc::new(
            ClusterSupervisor::start(launcher, &config.cluster.settings(), ports).await?,
        );

        let addr = SocketAddr::new(config.api.host, config.api.port);
        let listener = match bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(target: "main", %addr, error = %e, "Failed to bind API listener");
                cluster.shutdown().await;
                return Err(e.into());
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                cluster.shutdown().await;
                return Err(e.into());
            }
        };

        let limiters = Arc::new(config.limits.build());
        let record = Arc::new(TelemetryRecord::new(
            config.telemetry.tester_endpoints.iter().cloned(),
            config.telemetry.max_measurements_per_endpoint,
        ));
        let sync = Arc::new(RecordSync::new(
            record.clone(),
            open_sink(sink, config),
            limiters.sync_record.clone(),
            config.telemetry.object_name.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(config.cache.ttl()));
        let lifecycle = Mutex::new(ServerState::Created);

        let state = AppState {
            cluster: cluster.clone(),
            limiters,
            record,
            sync: sync.clone(),
            metrics: Arc::new(DispatchMetrics::new()),
            shutdown: shutdown.clone(),
        };
        let app = router(state, cache.clone());

        let mut activities = Activities::new(shutdown.clone());
        activities.spawn("health-poller", {
            let poller = cluster.health_poller();
            let token = shutdown.clone();
            async move {
                poller.run(token).await;
                Ok(())
            }
        });
        activities.spawn("cache-janitor", {
            let janitor = CacheJanitor::new(cache).with_interval(config.cache.janitor_interval());
            let token = shutdown.clone();
            async move {
                janitor.run(token).await;
                Ok(())
            }
        });
        if sync.is_enabled() {
            activities.spawn("telemetry-syncer", {
                let syncer =
                    TelemetrySyncer::new(sync.clone()).with_interval(config.telemetry.sync_interval());
                let token = shutdown.clone();
                async move {
                    syncer.run(token).await;
                    Ok(())
                }
            });
        }
        activities.spawn("http-server", {
            let token = shutdown.clone();
            async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await
                    .map_err(|e| e.to_string())
            }
        });
        let supervisor = tokio::spawn(activities.supervise());
        advance(&lifecycle, ServerState::Running);

        info!(target: "main", %addr, "Server started");

        Ok(Self {
            addr,
            shutdown,
            state: lifecycle,
            running: tokio::sync::Mutex::new(Some(Running {
                cluster,
                sync,
                supervisor,
            })),
        })
    }

    /// Address the API listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current lifecycle state; `Running` once `start` has returned
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Resolves once shutdown has begun, whether requested or caused by a
    /// faulted activity
    pub fn stop_notify(&self) -> WaitForCancellationFutureOwned {
        self.shutdown.clone().cancelled_owned()
    }

    /// Cancel every activity, wait for them, close the sink and tear the
    /// cluster down. Later calls return `Ok(())` without doing anything.
    ///
    /// # Errors
    /// [`LabError::Fault`] if an activity failed or panicked while running.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return Ok(());
        };

        advance(&self.state, ServerState::Stopping);
        warn!(target: "main", addr = %self.addr, "Stopping server");
        self.shutdown.cancel();

        let drained = run.supervisor.await;
        run.sync.close().await;
        run.cluster.shutdown().await;

        advance(&self.state, ServerState::Stopped);
        warn!(target: "main", "Server stopped");

        match drained {
            Ok(Ok(())) => Ok(()),
            Ok(Err(fault)) => Err(LabError::Fault(fault)),
            Err(e) => Err(LabError::Fault(format!("supervisor task: {e}"))),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Starts servers against one launcher, advancing one shared port
/// allocator so successive clusters never reuse a range.
pub struct ControlPlane {
    config: Config,
    launcher: Arc<dyn ClusterLauncher>,
    ports: PortAllocator,
}

impl ControlPlane {
    pub fn new(config: Config, launcher: Arc<dyn ClusterLauncher>) -> Self {
        let ports = config.cluster.port_allocator();
        Self {
            config,
            launcher,
            ports,
        }
    }

    /// Control plane running clusters in-process
    pub fn local(config: Config) -> Self {
        Self::new(config, Arc::new(LocalLauncher))
    }

    /// Start a server on `port`. Without `credentials` telemetry sync is
    /// disabled; each of `tester_endpoints` gets an empty record entry.
    pub async fn start_server(
        &self,
        port: u16,
        credentials: Option<Vec<u8>>,
        tester_endpoints: Vec<String>,
    ) -> Result<Server> {
        let mut config = self.config.clone();
        config.api.port = port;
        config.telemetry.tester_endpoints = tester_endpoints;

        let sink = credentials.map_or(SinkSource::None, SinkSource::Credentials);
        Server::start(&config, self.launcher.as_ref(), &self.ports, sink).await
    }
}

async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(target: "api", %addr, "API server listening");
    Ok(listener)
}

/// Build the sink; failure leaves sync disabled
fn open_sink(source: SinkSource, config: &Config) -> Option<Arc<dyn RemoteSink>> {
    match source {
        SinkSource::None => {
            info!(target: "telemetry", "No storage credentials, telemetry sync disabled");
            None
        }
        SinkSource::Sink(sink) => Some(sink),
        SinkSource::Credentials(credentials) => {
            let telemetry = &config.telemetry;
            let sink_config = SinkConfig {
                identity: telemetry.identity.clone(),
                scope: telemetry.scope.clone(),
                credentials,
                namespace: telemetry.namespace.clone(),
            };
            match HttpObjectStore::new(sink_config) {
                Ok(store) => {
                    info!(target: "telemetry", namespace = %telemetry.namespace, "Storage sink ready");
                    Some(Arc::new(store))
                }
                Err(e) => {
                    warn!(target: "telemetry", error = %e, "Storage sink unavailable, telemetry sync disabled");
                    None
                }
            }
        }
    }
}

/// Background tasks sharing one shutdown token
struct Activities {
    shutdown: CancellationToken,
    tasks: JoinSet<std::result::Result<(), String>>,
}

impl Activities {
    fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    /// Run `activity`; an error, a panic or an exit before shutdown cancels
    /// the token
    fn spawn<F>(&mut self, name: &'static str, activity: F)
    where
        F: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let outcome = match AssertUnwindSafe(activity).catch_unwind().await {
                Ok(Ok(())) if shutdown.is_cancelled() => Ok(()),
                Ok(Ok(())) => Err(format!("{name} exited unexpectedly")),
                Ok(Err(e)) => Err(format!("{name} failed: {e}")),
                Err(panic) => Err(format!("{name} panicked: {}", panic_message(&*panic))),
            };

            if let Err(fault) = &outcome {
                error!(target: "main", activity = name, %fault, "Activity faulted, shutting down");
                shutdown.cancel();
            }
            outcome
        });
    }

    /// Wait for every activity; the first fault is the result
    async fn supervise(mut self) -> std::result::Result<(), String> {
        let mut first_fault = None;
        while let Some(joined) = self.tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(format!("activity aborted: {e}")));
            if let Err(fault) = outcome {
                first_fault.get_or_insert(fault);
            }
        }
        first_fault.map_or(Ok(()), Err)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
