//! Configuration management for the control plane
//!
//! Loads configuration from config.toml at startup.
//! Every interval, port and size is configurable; defaults match the demo
//! deployment.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::supervisor::{DEFAULT_BASE_PORT, DEFAULT_PORT_STEP};
use crate::cluster::{ClusterSettings, PortAllocator};
use crate::core::record::DEFAULT_MAX_MEASUREMENTS;
use crate::core::Limiters;
use crate::telemetry::sink::DEFAULT_SCOPE;
use crate::telemetry::sync::DEFAULT_OBJECT_NAME;

/// Control plane configuration
///
/// Loaded from config.toml at startup. Missing sections fall back to
/// their defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// HTTP API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Demo cluster shape and polling
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Rate limiter intervals per route-class
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Response cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Telemetry record and remote sync
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Address to listen on
    #[serde(default = "default_api_host")]
    pub host: IpAddr,

    /// Port for HTTP API server (0 picks a free port)
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Demo cluster configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Number of members
    #[serde(default = "default_cluster_size")]
    pub size: usize,

    /// First port of the first allocated range
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Distance between consecutive port ranges; must fit two ports per member
    #[serde(default = "default_port_step")]
    pub port_step: u16,

    /// Health poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Rate limiter intervals, in milliseconds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// `/conn` and `/server-status`
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,

    /// Data operations on `/client-request`
    #[serde(default = "default_client_request_ms")]
    pub client_request_ms: u64,

    /// Member stop/restart
    #[serde(default = "default_stop_restart_ms")]
    pub stop_restart_ms: u64,

    /// `/get-record` and the sync tick
    #[serde(default = "default_sync_record_ms")]
    pub sync_record_ms: u64,
}

/// Response cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,

    #[serde(default = "default_janitor_interval_ms")]
    pub janitor_interval_ms: u64,
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Storage credentials document; sync is disabled when unset
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,

    /// Project / account owning the bucket
    #[serde(default = "default_identity")]
    pub identity: String,

    #[serde(default = "default_scope")]
    pub scope: String,

    /// Bucket the record is written to
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_object_name")]
    pub object_name: String,

    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Tester endpoints seeded into the record
    #[serde(default)]
    pub tester_endpoints: Vec<String>,

    #[serde(default = "default_max_measurements")]
    pub max_measurements_per_endpoint: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Directory for rolling log files
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write log files in addition to the console
    #[serde(default = "default_file_logging")]
    pub file_logging: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            size: default_cluster_size(),
            base_port: default_base_port(),
            port_step: default_port_step(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            read_ms: default_read_ms(),
            client_request_ms: default_client_request_ms(),
            stop_restart_ms: default_stop_restart_ms(),
            sync_record_ms: default_sync_record_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            janitor_interval_ms: default_janitor_interval_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            credentials_path: None,
            identity: default_identity(),
            scope: default_scope(),
            namespace: default_namespace(),
            object_name: default_object_name(),
            sync_interval_ms: default_sync_interval_ms(),
            tester_endpoints: Vec::new(),
            max_measurements_per_endpoint: default_max_measurements(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
            file_logging: default_file_logging(),
        }
    }
}

fn default_api_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_api_port() -> u16 {
    4200
}

fn default_cluster_size() -> usize {
    5
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_port_step() -> u16 {
    DEFAULT_PORT_STEP
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_read_ms() -> u64 {
    100
}

fn default_client_request_ms() -> u64 {
    3_000
}

fn default_stop_restart_ms() -> u64 {
    5_000
}

fn default_sync_record_ms() -> u64 {
    30_000
}

fn default_cache_ttl_ms() -> u64 {
    2_000
}

fn default_janitor_interval_ms() -> u64 {
    5_000
}

fn default_identity() -> String {
    "etcd".to_string()
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_namespace() -> String {
    "record".to_string()
}

fn default_object_name() -> String {
    DEFAULT_OBJECT_NAME.to_string()
}

fn default_sync_interval_ms() -> u64 {
    30_000
}

fn default_max_measurements() -> usize {
    DEFAULT_MAX_MEASUREMENTS
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_file_logging() -> bool {
    true
}

impl Config {
    /// Load configuration from config.toml file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if file exists but cannot be parsed, or if the parsed
    /// values are inconsistent.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        let config = match std::fs::read_to_string(&config_path) {
            Ok(contents) => Self::from_toml(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File not found - use defaults
                Config::default()
            }
            Err(e) => return Err(ConfigError::IoError(e)),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("cluster.poll_interval_ms", self.cluster.poll_interval_ms),
            ("limits.read_ms", self.limits.read_ms),
            ("limits.client_request_ms", self.limits.client_request_ms),
            ("limits.stop_restart_ms", self.limits.stop_restart_ms),
            ("limits.sync_record_ms", self.limits.sync_record_ms),
            ("cache.ttl_ms", self.cache.ttl_ms),
            ("cache.janitor_interval_ms", self.cache.janitor_interval_ms),
            ("telemetry.sync_interval_ms", self.telemetry.sync_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }

        if self.cluster.size == 0 {
            return Err(ConfigError::Invalid("cluster.size must be positive".to_string()));
        }
        if (self.cluster.port_step as usize) < 2 * self.cluster.size {
            return Err(ConfigError::Invalid(format!(
                "cluster.port_step {} cannot hold {} members (two ports each)",
                self.cluster.port_step, self.cluster.size
            )));
        }
        Ok(())
    }

    /// Read the storage credentials, if configured
    pub fn load_credentials(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        self.telemetry
            .credentials_path
            .as_ref()
            .map(std::fs::read)
            .transpose()
            .map_err(ConfigError::IoError)
    }
}

impl ClusterConfig {
    pub fn settings(&self) -> ClusterSettings {
        ClusterSettings {
            size: self.size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..ClusterSettings::default()
        }
    }

    pub fn port_allocator(&self) -> PortAllocator {
        PortAllocator::new(self.base_port, self.port_step)
    }
}

impl LimitsConfig {
    pub fn build(&self) -> Limiters {
        Limiters::new(
            Duration::from_millis(self.read_ms),
            Duration::from_millis(self.client_request_ms),
            Duration::from_millis(self.stop_restart_ms),
            Duration::from_millis(self.sync_record_ms),
        )
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_millis(self.janitor_interval_ms)
    }
}

impl TelemetryConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading file
    IoError(std::io::Error),
    /// Parse error (invalid TOML)
    ParseError(String),
    /// Parsed but unusable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::ParseError(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(_) | ConfigError::Invalid(_) => None,
        }
    }
}
