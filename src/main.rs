// Switchboard - multi-backend LLM request gateway
//
// Accepts Anthropic-style "messages" requests, routes each one to an
// upstream provider (DashScope, OpenRouter, Ollama, LMStudio, SiliconFlow,
// or any OpenAI-compatible server), translates formats in both directions
// including the streaming SSE event grammar, enforces per-key token
// budgets, and records every interaction in SQLite.
//
// Architecture:
// - Gateway server (axum): catch-all handler for client traffic plus the
//   control API consumed by the operator UI
// - Provider adapters (reqwest): one client per upstream family
// - Converters: Anthropic <-> OpenAI request/response/stream translation
// - Router: global-direct priority lists or small-model scene routing
// - Store (rusqlite): platforms, models, routing, keys, usage, records

mod cli;
mod config;
mod control;
mod convert;
mod gateway;
mod providers;
mod routing;
mod store;
mod tokens;
mod util;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::Cli;
use config::{Config, VERSION};
use gateway::GatewayState;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().apply(Config::load());

    std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "switchboard.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Precedence: RUST_LOG env var > config > default "info"
    let default_filter = format!("switchboard={},axum=info", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    tracing::info!("switchboard {} starting", VERSION);
    tracing::info!("Database: {}", config.db_path.display());

    let store = Store::open(&config.db_path)?;
    let state = GatewayState::new(store)?;

    // Initial snapshot build; an empty database starts in passthrough mode
    state.reload().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    gateway::server::start_gateway(config, state, shutdown_rx).await
}
