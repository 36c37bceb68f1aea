//! Supervisory control plane for an ephemeral demo consensus-store cluster
//!
//! Starts a cluster, serves four rate-limited, cached HTTP routes in front of
//! it, and keeps a telemetry record that is periodically synced to remote
//! storage.

pub mod cluster;
pub mod core;
pub mod infrastructure;
pub mod telemetry;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types
pub use infrastructure::config::{Config, ConfigError};
pub use infrastructure::{ControlPlane, Server, ServerState, SinkSource};

use thiserror::Error;

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum LabError {
    #[error("Cluster error: {0}")]
    Cluster(#[from] cluster::ClusterError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Background activity faulted: {0}")]
    Fault(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, LabError>;
