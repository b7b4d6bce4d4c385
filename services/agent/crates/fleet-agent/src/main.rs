//! Fleet agent entry point.
//!
//! Loads `FLEET_AGENT_*` configuration, registers with the control plane and
//! heartbeats until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleet_agent::client::HttpControlPlane;
use fleet_agent::command_runner::TokioCommandRunner;
use fleet_agent::executor::TaskExecutor;
use fleet_agent::identity::Identity;
use fleet_agent::runtime::Agent;
use fleet_common::AgentConfig;

/// Remote worker for the fleet control plane
#[derive(Parser)]
#[command(name = "fleet-agent", version)]
struct Cli {
    /// Control-plane URL or host:port (overrides FLEET_AGENT_SERVER_URL)
    server: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config: AgentConfig = envy::prefixed("FLEET_AGENT_")
        .from_env()
        .context("failed to load config from FLEET_AGENT_* env vars")?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    let client = HttpControlPlane::new(&config.server_url).context("failed to build HTTP client")?;
    let identity = Identity::detect(
        client.base_url(),
        config.agent_id.as_deref(),
        config.name.as_deref(),
    );
    tracing::info!(
        server_url = %client.base_url(),
        agent_id = %identity.agent_id,
        heartbeat_secs = config.heartbeat_secs,
        "fleet-agent starting",
    );

    let executor = TaskExecutor::new(
        Arc::new(TokioCommandRunner),
        config.command_timeout(),
        config.external_interface.clone(),
    );
    let agent = Agent::new(
        Arc::new(client),
        executor,
        identity,
        config.heartbeat_interval(),
    )
    .register()
    .await
    .context("failed to register with the control plane")?;

    agent.run(shutdown_signal()).await;
    Ok(())
}

/// Wait for SIGINT (Ctrl-C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}
