//! `ekp` — encryption key proxy binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the tracing subscriber.
//! 3. Activate the configured KMS connector and start the server loop,
//!    which owns the refreshers and the connector core task.
//! 4. Wait for a shutdown signal, then halt the proxy.

use anyhow::{Context, Result};
use tracing::info;

use ekp::config::Config;
use ekp::server;
use ekp::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        connector_type = %cfg.kms_connector_type,
        "ekp starting"
    );

    // -----------------------------------------------------------------------
    // 3. Proxy server
    // -----------------------------------------------------------------------
    let (proxy, server) = server::spawn(cfg).context("failed to start the encrypt key proxy")?;

    // -----------------------------------------------------------------------
    // 4. Shutdown
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    info!("shutdown signal received");
    proxy
        .halt(u64::from(std::process::id()))
        .await
        .context("halt was not acknowledged")?;

    server.await.context("server task panicked")??;
    info!("ekp stopped");
    Ok(())
}
