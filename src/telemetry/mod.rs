//! Telemetry export
//!
//! - **sink**: remote object storage seam and its HTTP implementation
//! - **sync**: periodic, rate-limited upload of the telemetry record

pub mod sink;
pub mod sync;

pub use sink::{HttpObjectStore, RemoteSink, SinkConfig, SinkError};
pub use sync::{RecordSync, SyncOutcome, SyncStatus, TelemetrySyncer};
