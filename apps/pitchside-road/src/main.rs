use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pitchside_road::config::ServerConfig;
use pitchside_road::{AppState, serve};

#[tokio::main]
async fn main() -> Result<()> {
    // Default to INFO level if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::parse();
    let ttl = config.pending_ttl()?;
    info!("Starting Pitchside Road on {}", config.bind);
    info!("Pairing code TTL: {} seconds", ttl.as_secs());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    serve(listener, AppState::new(ttl))
        .await
        .context("server stopped")
}
