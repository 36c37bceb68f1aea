//! Control plane for an ephemeral demo consensus-store cluster
//!
//! # Architecture
//! - **core**: Shared-state primitives (rate limiters, response cache, telemetry record)
//! - **cluster**: Cluster collaborator, supervisor and health poller
//! - **telemetry**: Remote sink and record synchronizer
//! - **infrastructure**: Config, logging, metrics, HTTP API, server lifecycle

use anyhow::Context;
use clusterlab::infrastructure::logging::init_logging;
use clusterlab::{log_main, Config, ControlPlane};
use tracing::Level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let _guards = init_logging(&config.logging).context("failed to initialize logging")?;

    let credentials = config
        .load_credentials()
        .context("failed to read storage credentials")?;
    let port = config.api.port;
    let tester_endpoints = config.telemetry.tester_endpoints.clone();

    log_main!(Level::INFO, port, "Starting clusterlab...");
    let plane = ControlPlane::local(config);
    let server = plane
        .start_server(port, credentials, tester_endpoints)
        .await
        .context("failed to start server")?;
    log_main!(Level::INFO, addr = %server.local_addr(), "clusterlab ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => log_main!(Level::WARN, "Received Ctrl-C"),
                Err(e) => log_main!(Level::ERROR, error = %e, "Failed to listen for Ctrl-C"),
            }
        }
        _ = server.stop_notify() => {
            log_main!(Level::ERROR, "Server shut itself down");
        }
    }

    server.stop().await.context("server stopped with a fault")?;
    log_main!(Level::INFO, "Bye");
    Ok(())
}
