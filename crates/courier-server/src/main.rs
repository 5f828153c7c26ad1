//! # courier-server
//!
//! Real-time direct-messaging hub.
//!
//! This binary provides:
//! - **WebSocket sessions** (`/ws?user_id=N`), one live connection per user
//! - **Hub**: a single task that owns the connection registry and fans each
//!   message out to the receiver and the sender's echo
//! - **Backlog delivery** of unread messages whenever a user reconnects
//! - **Liveness** probes and read/write deadlines that reap dead peers
//! - **REST API** (axum) for sending messages and querying history

mod api;
mod config;
mod error;
mod hub;
mod liveness;
mod reconcile;
mod session;
mod transport;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_store::{MemoryStore, MessageStore, SqliteStore};

use crate::api::AppState;
use crate::config::{ServerConfig, StoreBackend};
use crate::hub::HubHandle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!(
        "Starting {} server v{}",
        courier_shared::constants::APP_NAME,
        env!("CARGO_PKG_VERSION")
    );

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the message store
    // -----------------------------------------------------------------------
    let store: Arc<dyn MessageStore> = match &config.store {
        StoreBackend::Sqlite(path) => Arc::new(SqliteStore::open(path)?),
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory message store; messages are lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    // -----------------------------------------------------------------------
    // 4. Start the hub
    // -----------------------------------------------------------------------
    let (hub, hub_task) = hub::spawn_hub(store.clone(), config.hub_config());

    let app_state = AppState {
        hub: hub.clone(),
        store,
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP server until a shutdown signal arrives
    // -----------------------------------------------------------------------
    let result = api::serve(app_state, config.http_addr, shutdown_signal(hub)).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    }

    if let Err(e) = hub_task.await {
        tracing::error!(error = %e, "Hub task panicked");
    }
    info!("Shutdown complete");

    result
}

/// Resolves on Ctrl+C or SIGTERM, after every live session has been told to
/// drain.
async fn shutdown_signal(hub: HubHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    match hub.stats().await {
        Ok(stats) => info!(?stats, "Draining sessions"),
        Err(e) => tracing::warn!(error = %e, "Hub stats unavailable"),
    }
    if let Err(e) = hub.shutdown().await {
        tracing::warn!(error = %e, "Hub already stopped");
    }
}
