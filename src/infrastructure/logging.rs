//! Centralized file-based logging system
//!
//! Writes logs to files under the configured directory, separated by log type:
//! - main/ - General application logs (JSON)
//! - error/ - Error and warning logs only
//! - api/ - Request dispatch logs
//! - cluster/ - Cluster lifecycle and health polling
//! - telemetry/ - Record sync logs

use std::fs;
use std::io;
use std::path::Path;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    EnvFilter,
};

use super::config::LoggingConfig;

const LOG_TYPES: [&str; 5] = ["main", "error", "api", "cluster", "telemetry"];

type BoxedSubscriber = Box<dyn Subscriber + Send + Sync>;

/// Initialize logging
///
/// Creates the log directory tree and sets up file appenders for the
/// different log types, plus a console layer. `RUST_LOG` overrides the
/// configured level. Returned guards must be kept alive for the duration of
/// the program.
///
/// # Errors
/// Fails if the log directories cannot be created or a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> io::Result<Vec<WorkerGuard>> {
    let (subscriber, guards) = build_subscriber(config)?;
    tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

    tracing::info!(
        target: "main",
        dir = %config.dir.display(),
        file_logging = config.file_logging,
        "Logging system initialized"
    );

    Ok(guards)
}

/// Assemble the layer stack without installing it
fn build_subscriber(config: &LoggingConfig) -> io::Result<(BoxedSubscriber, Vec<WorkerGuard>)> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if !config.file_logging {
        // Console layer for development
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true);
        let subscriber = tracing_subscriber::registry().with(filter).with(console_layer);
        return Ok((Box::new(subscriber), Vec::new()));
    }

    let logs_dir = config.dir.as_path();
    create_log_dirs(logs_dir)?;

    let mut guards = Vec::new();

    // Main log - all logs
    let (main_appender, main_guard) = create_appender(logs_dir, "main");
    guards.push(main_guard);

    // Error log - ERROR and WARN only
    let (error_appender, error_guard) = create_appender(logs_dir, "error");
    guards.push(error_guard);

    let (api_appender, api_guard) = create_appender(logs_dir, "api");
    guards.push(api_guard);

    let (cluster_appender, cluster_guard) = create_appender(logs_dir, "cluster");
    guards.push(cluster_guard);

    let (telemetry_appender, telemetry_guard) = create_appender(logs_dir, "telemetry");
    guards.push(telemetry_guard);

    let main_layer = tracing_subscriber::fmt::layer()
        .with_writer(main_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .json();

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::LevelFilter::WARN);

    let api_layer = tracing_subscriber::fmt::layer()
        .with_writer(api_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target().contains("api") || metadata.target().contains("tower_http")
        }));

    let cluster_layer = tracing_subscriber::fmt::layer()
        .with_writer(cluster_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target().contains("cluster")
        }));

    let telemetry_layer = tracing_subscriber::fmt::layer()
        .with_writer(telemetry_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target().contains("telemetry")
        }));

    // Console layer for development
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(main_layer)
        .with(error_layer)
        .with(api_layer)
        .with(cluster_layer)
        .with(telemetry_layer)
        .with(console_layer);

    Ok((Box::new(subscriber), guards))
}

/// Create the log root and one subdirectory per log type
fn create_log_dirs(logs_dir: &Path) -> io::Result<()> {
    for log_type in LOG_TYPES {
        fs::create_dir_all(logs_dir.join(log_type))?;
    }
    Ok(())
}

/// Create a daily rolling file appender
fn create_appender(logs_dir: &Path, name: &str) -> (NonBlocking, WorkerGuard) {
    let appender = RollingFileAppender::new(Rotation::DAILY, logs_dir.join(name), name);
    tracing_appender::non_blocking(appender)
}

/// Log macro helpers for specific log types
#[macro_export]
macro_rules! log_api {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "api", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_cluster {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "cluster", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_telemetry {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "telemetry", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_main {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "main", $level, $($arg)+)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_creation() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        create_log_dirs(&logs).unwrap();
        for log_type in LOG_TYPES {
            assert!(logs.join(log_type).is_dir());
        }

        // idempotent
        create_log_dirs(&logs).unwrap();
    }

    #[test]
    fn test_log_directory_creation_fails_under_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();

        assert!(create_log_dirs(&blocker).is_err());
    }

    fn read_logs(dir: &Path) -> String {
        let mut contents = String::new();
        for entry in fs::read_dir(dir).unwrap() {
            contents.push_str(&fs::read_to_string(entry.unwrap().path()).unwrap());
        }
        contents
    }

    #[test]
    fn test_file_logging_routes_by_target() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            dir: dir.path().join("logs"),
            level: "info".to_string(),
            file_logging: true,
        };

        let (subscriber, guards) = build_subscriber(&config).unwrap();
        assert_eq!(guards.len(), LOG_TYPES.len());
        tracing::subscriber::with_default(subscriber, || {
            log_cluster!(tracing::Level::WARN, "member node2 unreachable");
            log_api!(tracing::Level::INFO, "route served");
        });
        // flushes the non-blocking writers
        drop(guards);

        let logs = config.dir;
        let cluster = read_logs(&logs.join("cluster"));
        assert!(cluster.contains("member node2 unreachable"));
        assert!(!cluster.contains("route served"));

        let api = read_logs(&logs.join("api"));
        assert!(api.contains("route served"));

        let error = read_logs(&logs.join("error"));
        assert!(error.contains("member node2 unreachable"));
        assert!(!error.contains("route served"));

        let main = read_logs(&logs.join("main"));
        assert!(main.contains("route served") && main.contains("member node2 unreachable"));
    }

    #[test]
    fn test_console_only_needs_no_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            dir: dir.path().join("unused"),
            level: "debug".to_string(),
            file_logging: false,
        };

        let (_subscriber, guards) = build_subscriber(&config).unwrap();
        assert!(guards.is_empty());
        assert!(!config.dir.exists());
    }

    #[test]
    fn test_macros_expand() {
        // no subscriber installed; events are dropped
        log_api!(tracing::Level::DEBUG, route = "/conn", "dispatch");
        log_cluster!(tracing::Level::INFO, "cluster event");
        log_telemetry!(tracing::Level::WARN, "sync event");
        log_main!(tracing::Level::INFO, "main event");
    }
}
