//! Cluster supervisor
//!
//! Owns the demo cluster for the lifetime of the server: picks a port range
//! that no earlier cluster of this process used, gives the members a fresh
//! working directory, launches them and tears everything down exactly once.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{info, warn};

use super::health::{HealthPoller, StatusBoard, DEFAULT_POLL_INTERVAL};
use super::{ClusterConfig, ClusterError, ClusterHandle, ClusterLauncher};

/// Default first port handed out by a [`PortAllocator`]
pub const DEFAULT_BASE_PORT: u16 = 2389;

/// Default distance between two allocated ranges
pub const DEFAULT_PORT_STEP: u16 = 10;

/// Hands out port ranges that never repeat within one allocator's life.
///
/// Share one allocator (behind an `Arc`) between every cluster the process
/// starts so restarts never collide with a previous range.
#[derive(Debug)]
pub struct PortAllocator {
    next: Mutex<u16>,
    step: u16,
}

impl PortAllocator {
    pub fn new(base: u16, step: u16) -> Self {
        Self {
            next: Mutex::new(base),
            step: step.max(1),
        }
    }

    /// Reserve the next range and return its first port
    pub fn allocate(&self) -> Result<u16, ClusterError> {
        let mut next = self.next.lock();
        let port = *next;
        *next = port
            .checked_add(self.step)
            .ok_or_else(|| ClusterError::Bootstrap("port range exhausted".to_string()))?;
        Ok(port)
    }

    pub fn step(&self) -> u16 {
        self.step
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PORT, DEFAULT_PORT_STEP)
    }
}

/// Cluster shape and polling cadence
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub size: usize,
    pub poll_interval: Duration,
    pub client_auto_tls: bool,
    pub peer_auto_tls: bool,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            size: 5,
            poll_interval: DEFAULT_POLL_INTERVAL,
            client_auto_tls: false,
            peer_auto_tls: false,
        }
    }
}

/// Running demo cluster together with its working directory and status board
pub struct ClusterSupervisor {
    handle: Arc<dyn ClusterHandle>,
    board: Arc<StatusBoard>,
    config: ClusterConfig,
    poll_interval: Duration,
    /// Cleared by the one shutdown that actually runs
    workdir: Mutex<Option<TempDir>>,
}

impl ClusterSupervisor {
    /// Allocate ports and a working directory, then launch the members.
    ///
    /// # Errors
    /// Fails fast if the directory cannot be created or the launcher fails.
    /// Nothing is retried; the directory is removed on failure.
    pub async fn start(
        launcher: &dyn ClusterLauncher,
        settings: &ClusterSettings,
        ports: &PortAllocator,
    ) -> Result<Self, ClusterError> {
        let root_port = ports.allocate()?;
        let workdir = tempfile::Builder::new()
            .prefix("clusterlab-cluster")
            .tempdir()?;

        let config = ClusterConfig {
            size: settings.size,
            root_dir: workdir.path().to_path_buf(),
            root_port,
            client_auto_tls: settings.client_auto_tls,
            peer_auto_tls: settings.peer_auto_tls,
        };

        info!(
            target: "cluster",
            size = config.size,
            root_port,
            dir = %config.root_dir.display(),
            "Starting cluster"
        );
        let handle = launcher.start(config.clone()).await?;
        info!(target: "cluster", members = handle.members().len(), "Cluster started");

        Ok(Self {
            handle,
            board: Arc::new(StatusBoard::new()),
            config,
            poll_interval: settings.poll_interval,
            workdir: Mutex::new(Some(workdir)),
        })
    }

    pub fn handle(&self) -> &Arc<dyn ClusterHandle> {
        &self.handle
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Poller publishing this cluster's status to its board
    pub fn health_poller(&self) -> HealthPoller {
        HealthPoller::new(self.handle.clone(), self.board.clone()).with_interval(self.poll_interval)
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    pub fn is_shut_down(&self) -> bool {
        self.workdir.lock().is_none()
    }

    /// Tear down every member and remove the working directory.
    /// Only the first call does anything.
    pub async fn shutdown(&self) {
        let workdir = self.workdir.lock().take();
        let Some(workdir) = workdir else {
            return;
        };

        warn!(target: "cluster", "Stopping cluster");
        self.handle.shutdown().await;

        let path = workdir.path().to_path_buf();
        if let Err(e) = workdir.close() {
            warn!(target: "cluster", dir = %path.display(), error = %e, "Failed to remove cluster directory");
        }
        warn!(target: "cluster", "Stopped cluster");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalLauncher;
    use crate::test_utils::{free_port_range, FailingLauncher, MockLauncher};

    #[test]
    fn test_port_allocator_advances() {
        let ports = PortAllocator::new(2389, 10);
        assert_eq!(ports.allocate().unwrap(), 2389);
        assert_eq!(ports.allocate().unwrap(), 2399);
        assert_eq!(ports.allocate().unwrap(), 2409);
    }

    #[test]
    fn test_port_allocator_concurrent_ranges_unique() {
        let ports = Arc::new(PortAllocator::new(10_000, 10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = ports.clone();
                std::thread::spawn(move || (0..50).map(|_| ports.allocate().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u16> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
    }

    #[test]
    fn test_port_allocator_exhaustion() {
        let ports = PortAllocator::new(u16::MAX - 5, 10);
        assert!(matches!(ports.allocate(), Err(ClusterError::Bootstrap(_))));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_local_cluster() {
        let settings = ClusterSettings {
            size: 3,
            ..ClusterSettings::default()
        };
        let ports = PortAllocator::new(free_port_range(10), 10);
        let supervisor = ClusterSupervisor::start(&LocalLauncher, &settings, &ports)
            .await
            .unwrap();

        let dir = supervisor.config().root_dir.clone();
        assert!(dir.is_dir());
        assert_eq!(supervisor.handle().members().len(), 3);

        supervisor.shutdown().await;
        assert!(supervisor.is_shut_down());
        assert!(!dir.exists());

        // second shutdown is a no-op
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_launch_failure_propagates() {
        let ports = PortAllocator::new(20_000, 10);
        let result = ClusterSupervisor::start(&FailingLauncher, &ClusterSettings::default(), &ports).await;
        assert!(matches!(result, Err(ClusterError::Bootstrap(_))));

        // the failed attempt still consumed its range
        assert_eq!(ports.allocate().unwrap(), 20_010);
    }

    #[tokio::test]
    async fn test_shutdown_reaches_handle_once() {
        let launcher = MockLauncher::new(3);
        let ports = PortAllocator::default();
        let supervisor = ClusterSupervisor::start(&launcher, &ClusterSettings::default(), &ports)
            .await
            .unwrap();

        supervisor.shutdown().await;
        supervisor.shutdown().await;
        assert_eq!(launcher.cluster().shutdown_calls(), 1);
    }
}
