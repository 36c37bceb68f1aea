//! Demo cluster collaborator
//!
//! The consensus store itself is an external collaborator. The control
//! plane only needs to start it, ask it for status, forward demo operations
//! and shut it down; those seams are the [`ClusterLauncher`] and
//! [`ClusterHandle`] traits.
//!
//! - **local**: in-process implementation used by the binary and tests
//! - **supervisor**: working directory, port allocation, lifecycle
//! - **health**: status board and the background health poller

pub mod health;
pub mod local;
pub mod supervisor;

pub use health::{ClusterStatus, HealthPoller, HealthState, StatusBoard};
pub use local::{LocalCluster, LocalLauncher};
pub use supervisor::{ClusterSettings, ClusterSupervisor, PortAllocator};

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Cluster collaborator errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Failed to bootstrap cluster: {0}")]
    Bootstrap(String),

    #[error("Port {port} unavailable: {source}")]
    PortUnavailable {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("No such member: {0}")]
    UnknownMember(usize),

    #[error("Member {0} is stopped")]
    MemberStopped(String),

    #[error("Member {0} is already running")]
    MemberRunning(String),

    #[error("Cluster has no quorum ({running}/{size} members running)")]
    NoQuorum { running: usize, size: usize },

    #[error("Cluster is shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters handed to the launcher
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of members to start
    pub size: usize,
    /// Isolated working directory; members create their data dirs under it
    pub root_dir: PathBuf,
    /// First port of the range reserved for this cluster
    pub root_port: u16,
    pub client_auto_tls: bool,
    pub peer_auto_tls: bool,
}

impl ClusterConfig {
    /// Client port of member `index`
    #[inline]
    pub fn client_port(&self, index: usize) -> u16 {
        self.root_port + (2 * index) as u16
    }

    /// Peer port of member `index`
    #[inline]
    pub fn peer_port(&self, index: usize) -> u16 {
        self.client_port(index) + 1
    }

    pub fn scheme(&self) -> &'static str {
        if self.client_auto_tls {
            "https"
        } else {
            "http"
        }
    }
}

/// Static addressing of one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    pub name: String,
    pub client_url: String,
    pub peer_url: String,
}

/// Live state of one member as reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberStatus {
    pub name: String,
    pub endpoint: String,
    pub running: bool,
    pub is_leader: bool,
    /// Latest revision the member has applied
    pub revision: u64,
}

/// Demo operation forwarded to a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Put { node: usize, key: String, value: String },
    Get { node: usize, key: String },
    Delete { node: usize, key: String },
    StopMember { node: usize },
    RestartMember { node: usize },
}

impl ClientOp {
    /// Wire name of the operation
    pub fn action(&self) -> &'static str {
        match self {
            ClientOp::Put { .. } => "put",
            ClientOp::Get { .. } => "get",
            ClientOp::Delete { .. } => "delete",
            ClientOp::StopMember { .. } => "stop-node",
            ClientOp::RestartMember { .. } => "restart-node",
        }
    }

    pub fn node(&self) -> usize {
        match self {
            ClientOp::Put { node, .. }
            | ClientOp::Get { node, .. }
            | ClientOp::Delete { node, .. }
            | ClientOp::StopMember { node }
            | ClientOp::RestartMember { node } => *node,
        }
    }

    /// Stop/restart change cluster membership and cost a full teardown or
    /// rebuild of a member.
    pub fn is_membership_change(&self) -> bool {
        matches!(self, ClientOp::StopMember { .. } | ClientOp::RestartMember { .. })
    }
}

/// Result of a demo operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpOutcome {
    /// Member that served the operation
    pub node: String,
    /// Human-readable result line for the UI
    pub message: String,
    /// Value read by `get`, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Cluster revision after the operation
    pub revision: u64,
}

/// Running cluster. Status reads are safe from any task; `shutdown` is
/// called exactly once by the supervisor.
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    /// Addressing of every member, in index order
    fn members(&self) -> Vec<MemberInfo>;

    /// Scheme clients use to reach the members
    fn scheme(&self) -> &'static str;

    /// Query every member's live state
    async fn status(&self) -> Result<Vec<MemberStatus>, ClusterError>;

    /// Run a demo operation
    async fn execute(&self, op: ClientOp) -> Result<OpOutcome, ClusterError>;

    /// Stop every member and release what they hold.
    /// Must tolerate partially started members.
    async fn shutdown(&self);
}

/// Starts clusters
#[async_trait]
pub trait ClusterLauncher: Send + Sync {
    async fn start(&self, config: ClusterConfig) -> Result<Arc<dyn ClusterHandle>, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_ports() {
        let config = ClusterConfig {
            size: 5,
            root_dir: PathBuf::from("/tmp/x"),
            root_port: 2389,
            client_auto_tls: false,
            peer_auto_tls: false,
        };
        assert_eq!(config.client_port(0), 2389);
        assert_eq!(config.peer_port(0), 2390);
        assert_eq!(config.client_port(4), 2397);
        assert_eq!(config.peer_port(4), 2398);
        assert_eq!(config.scheme(), "http");
    }

    #[test]
    fn test_membership_ops() {
        assert!(ClientOp::StopMember { node: 1 }.is_membership_change());
        assert!(ClientOp::RestartMember { node: 1 }.is_membership_change());
        assert!(!ClientOp::Get { node: 0, key: "k".into() }.is_membership_change());
        assert_eq!(ClientOp::RestartMember { node: 3 }.action(), "restart-node");
        assert_eq!(ClientOp::Delete { node: 2, key: "k".into() }.node(), 2);
    }
}
