//! Test doubles for the cluster and storage collaborators
//!
//! Shared by the unit tests of every module.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cluster::{
    ClientOp, ClusterConfig, ClusterError, ClusterHandle, ClusterLauncher, MemberInfo,
    MemberStatus, OpOutcome,
};
use crate::telemetry::{RemoteSink, SinkError};

/// First port of `len` consecutive ports that are free right now
pub fn free_port_range(len: u16) -> u16 {
    loop {
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let base = probe.local_addr().unwrap().port();
        drop(probe);

        if base.checked_add(len).is_none() {
            continue;
        }
        if (base..base + len).all(|p| TcpListener::bind(("127.0.0.1", p)).is_ok()) {
            return base;
        }
    }
}

/// Scriptable in-memory cluster
pub struct MockCluster {
    size: usize,
    fail_status: AtomicBool,
    hang_execute: AtomicBool,
    panic_status: AtomicBool,
    executed: Mutex<Vec<ClientOp>>,
    shutdown_calls: AtomicUsize,
}

impl MockCluster {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            fail_status: AtomicBool::new(false),
            hang_execute: AtomicBool::new(false),
            panic_status: AtomicBool::new(false),
            executed: Mutex::new(Vec::new()),
            shutdown_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    /// Make every `execute` wait forever
    pub fn hang_execute(&self, hang: bool) {
        self.hang_execute.store(hang, Ordering::SeqCst);
    }

    /// Make the next `status` call panic
    pub fn panic_on_status(&self, panic: bool) {
        self.panic_status.store(panic, Ordering::SeqCst);
    }

    pub fn executed(&self) -> Vec<ClientOp> {
        self.executed.lock().clone()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterHandle for MockCluster {
    fn members(&self) -> Vec<MemberInfo> {
        (0..self.size)
            .map(|i| MemberInfo {
                name: format!("node{}", i + 1),
                client_url: format!("http://localhost:{}", 2389 + 2 * i),
                peer_url: format!("http://localhost:{}", 2390 + 2 * i),
            })
            .collect()
    }

    fn scheme(&self) -> &'static str {
        "http"
    }

    async fn status(&self) -> Result<Vec<MemberStatus>, ClusterError> {
        if self.panic_status.load(Ordering::SeqCst) {
            panic!("status probe exploded");
        }
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(ClusterError::Bootstrap("status unavailable".to_string()));
        }
        Ok(self
            .members()
            .into_iter()
            .enumerate()
            .map(|(i, m)| MemberStatus {
                name: m.name,
                endpoint: m.client_url,
                running: true,
                is_leader: i == 0,
                revision: 0,
            })
            .collect())
    }

    async fn execute(&self, op: ClientOp) -> Result<OpOutcome, ClusterError> {
        if self.hang_execute.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let node = op.node();
        if node >= self.size {
            return Err(ClusterError::UnknownMember(node));
        }
        let outcome = OpOutcome {
            node: format!("node{}", node + 1),
            message: format!("{} ok", op.action()),
            value: None,
            revision: 1,
        };
        self.executed.lock().push(op);
        Ok(outcome)
    }

    async fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Launcher that always hands out the same [`MockCluster`]
pub struct MockLauncher {
    cluster: Arc<MockCluster>,
    starts: AtomicUsize,
}

impl MockLauncher {
    pub fn new(size: usize) -> Self {
        Self {
            cluster: Arc::new(MockCluster::new(size)),
            starts: AtomicUsize::new(0),
        }
    }

    pub fn cluster(&self) -> &Arc<MockCluster> {
        &self.cluster
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterLauncher for MockLauncher {
    async fn start(&self, _config: ClusterConfig) -> Result<Arc<dyn ClusterHandle>, ClusterError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(self.cluster.clone())
    }
}

/// Launcher whose bootstrap always fails
pub struct FailingLauncher;

#[async_trait]
impl ClusterLauncher for FailingLauncher {
    async fn start(&self, _config: ClusterConfig) -> Result<Arc<dyn ClusterHandle>, ClusterError> {
        Err(ClusterError::Bootstrap("injected failure".to_string()))
    }
}

/// Sink that keeps uploads in memory
#[derive(Default)]
pub struct MockSink {
    fail: AtomicBool,
    closed: AtomicBool,
    puts: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn puts(&self) -> Vec<(String, Vec<u8>)> {
        self.puts.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSink for MockSink {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<(), SinkError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError::Upload("injected failure".to_string()));
        }
        self.puts.lock().push((name.to_string(), bytes));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
