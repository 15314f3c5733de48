//! Context Relay server
//!
//! Entry point: loads configuration, builds the relay core and serves it over
//! WebSockets until a shutdown signal arrives.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use context_relay::config::AppConfig;
use context_relay::relay::{ConnectionManager, EchoGenerator};
use context_relay::server::start_server;
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present) before reading any configuration
    let _ = dotenv();

    // Initialize tracing (M-LOG-STRUCTURED)
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(AppConfig::load()?);
    info!(
        name: "relay.config.loaded",
        history_capacity = config.relay.history_capacity,
        chunk_size = config.relay.chunk_size,
        "Relay configuration loaded"
    );

    let manager = ConnectionManager::new(config.relay.clone(), Arc::new(EchoGenerator));
    start_server(config, manager).await
}
