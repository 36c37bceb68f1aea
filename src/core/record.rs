//! Telemetry record
//!
//! Accumulated request measurements per tester endpoint. Request handlers
//! append under the write lock; the synchronizer serializes under the read
//! lock and uploads after releasing it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Identity used when a client request names no tester endpoint
pub const DEFAULT_ENDPOINT: &str = "web";

/// Default cap on measurements kept per endpoint
pub const DEFAULT_MAX_MEASUREMENTS: usize = 1024;

/// One observed demo operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    /// RFC 3339 wall-clock time of the operation
    pub at: String,
    pub action: String,
    pub node: String,
    pub latency_us: u64,
    pub ok: bool,
}

/// Everything recorded for one tester endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointData {
    pub endpoint: String,
    pub total_requests: u64,
    pub failed_requests: u64,
    /// Most recent measurements, oldest first
    pub measurements: Vec<Measurement>,
}

/// Serializable copy of the whole record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub test_data: Vec<EndpointData>,
}

impl RecordSnapshot {
    pub fn endpoint(&self, name: &str) -> Option<&EndpointData> {
        self.test_data.iter().find(|d| d.endpoint == name)
    }
}

#[derive(Debug, Default)]
struct EndpointHistory {
    total_requests: u64,
    failed_requests: u64,
    measurements: VecDeque<Measurement>,
}

impl EndpointHistory {
    fn to_data(&self, endpoint: &str) -> EndpointData {
        EndpointData {
            endpoint: endpoint.to_string(),
            total_requests: self.total_requests,
            failed_requests: self.failed_requests,
            measurements: self.measurements.iter().cloned().collect(),
        }
    }
}

/// Process-lifetime telemetry, guarded by a single read/write lock.
#[derive(Debug)]
pub struct TelemetryRecord {
    max_measurements: usize,
    endpoints: RwLock<BTreeMap<String, EndpointHistory>>,
}

impl TelemetryRecord {
    /// Create a record seeded with an empty entry per tester endpoint
    pub fn new<I, S>(tester_endpoints: I, max_measurements: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints = tester_endpoints
            .into_iter()
            .map(|ep| (ep.into(), EndpointHistory::default()))
            .collect();
        Self {
            max_measurements: max_measurements.max(1),
            endpoints: RwLock::new(endpoints),
        }
    }

    /// Append a measurement for `endpoint` and return that endpoint's
    /// updated data.
    ///
    /// The whole append happens under one write guard, so concurrent
    /// appends never overwrite each other.
    pub fn append(&self, endpoint: &str, measurement: Measurement) -> EndpointData {
        let mut endpoints = self.endpoints.write();
        let history = endpoints.entry(endpoint.to_string()).or_default();

        history.total_requests += 1;
        if !measurement.ok {
            history.failed_requests += 1;
        }
        if history.measurements.len() == self.max_measurements {
            history.measurements.pop_front();
        }
        history.measurements.push_back(measurement);

        history.to_data(endpoint)
    }

    /// Data of a single endpoint
    pub fn endpoint(&self, endpoint: &str) -> Option<EndpointData> {
        self.endpoints
            .read()
            .get(endpoint)
            .map(|history| history.to_data(endpoint))
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        let endpoints = self.endpoints.read();
        RecordSnapshot {
            test_data: endpoints
                .iter()
                .map(|(name, history)| history.to_data(name))
                .collect(),
        }
    }

    /// JSON encoding of the record, produced under the read lock
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let endpoints = self.endpoints.read();
        let snapshot = RecordSnapshot {
            test_data: endpoints
                .iter()
                .map(|(name, history)| history.to_data(name))
                .collect(),
        };
        drop(endpoints);
        serde_json::to_vec(&snapshot)
    }
}

impl Default for TelemetryRecord {
    fn default() -> Self {
        Self::new(Vec::<String>::new(), DEFAULT_MAX_MEASUREMENTS)
    }
}
