//! Infrastructure
//!
//! Everything around the core primitives:
//! - Configuration and logging
//! - Dispatch metrics
//! - HTTP API
//! - Server lifecycle and graceful shutdown

pub mod api;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod server;

pub use server::{ControlPlane, Server, ServerState, SinkSource};
