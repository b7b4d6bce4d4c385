//! Fleet control-plane entry point.
//!
//! Initialises tracing, loads configuration from `FLEET_SERVER_*`
//! environment variables and serves the agent protocol plus the operator
//! API until Ctrl-C.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use fleet_common::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "fleet-server starting");

    let config: ServerConfig = envy::prefixed("FLEET_SERVER_")
        .from_env()
        .context("failed to load config from FLEET_SERVER_* env vars")?;

    tracing::info!(
        data_dir = %config.data_dir.display(),
        liveness_secs = config.liveness_secs,
        flush_interval_secs = config.flush_interval_secs,
        sweep_interval_secs = config.sweep_interval_secs,
        "configuration loaded",
    );

    fleet_server::run(config).await
}
