//! Fleet control plane: agent registry, task ledger and dispatch.

pub mod clock;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod ledger;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use fleet_common::{PersistMode, ServerConfig};

use crate::dispatch::Dispatcher;
use crate::http::AppState;
use crate::ledger::{Ledger, SnapshotStore};

/// Open the ledger described by `config`.
#[must_use]
pub fn open_ledger(config: &ServerConfig) -> Ledger {
    match config.persist {
        PersistMode::Disabled => Ledger::in_memory(),
        mode => Ledger::open(SnapshotStore::new(&config.data_dir), mode),
    }
}

/// Periodically write dirty tables.
pub fn spawn_flusher(ledger: Arc<Ledger>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let ledger = Arc::clone(&ledger);
            match tokio::task::spawn_blocking(move || ledger.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "deferred flush failed"),
                Err(e) => tracing::error!(error = %e, "flush worker failed"),
            }
        }
    })
}

/// Periodically fail Running tasks that outlived their timeout.
pub fn spawn_sweeper(state: Arc<AppState>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let state = Arc::clone(&state);
            match tokio::task::spawn_blocking(move || state.dispatcher.sweep_overdue()).await {
                Ok(failed) if !failed.is_empty() => {
                    tracing::info!(count = failed.len(), "sweep failed overdue tasks");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "sweep worker failed"),
            }
        }
    })
}

/// Serve until Ctrl-C, then flush the ledger.
///
/// # Errors
///
/// Fails when the listener cannot be bound or the server errors out.
pub async fn run(config: ServerConfig) -> Result<()> {
    let ledger = Arc::new(open_ledger(&config));
    let dispatcher = Dispatcher::new(Arc::clone(&ledger)).with_liveness(config.liveness());
    let state = Arc::new(AppState::new(dispatcher));

    let flusher = (config.persist == PersistMode::Deferred)
        .then(|| spawn_flusher(Arc::clone(&ledger), config.flush_interval()));
    let sweeper = config
        .sweep_interval()
        .map(|every| spawn_sweeper(Arc::clone(&state), every));

    let router = http::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        persist = ?config.persist,
        sweep = config.sweep_interval().is_some(),
        "control plane ready",
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    for handle in [flusher, sweeper].into_iter().flatten() {
        handle.abort();
    }
    tokio::task::spawn_blocking(move || ledger.flush())
        .await
        .context("final flush worker failed")?
        .context("final ledger flush failed")?;

    tracing::info!("control plane shut down");
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
