//! Gateway server setup and initialization

use anyhow::{Context, Result};
use axum::{routing::any, Router};
use tokio::net::TcpListener;

use super::{gateway_handler, GatewayState};
use crate::config::Config;
use crate::control;

/// Start the gateway server
///
/// Control routes are registered explicitly; everything else falls through
/// to the catch-all gateway handler. Shutdown drains in-flight requests.
pub async fn start_gateway(
    config: Config,
    state: GatewayState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let app = Router::new()
        .merge(control::routes())
        .route("/*path", any(gateway_handler))
        .with_state(state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Gateway listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Gateway shut down gracefully");
    Ok(())
}
