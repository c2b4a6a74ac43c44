//! Game node entry point.
//!
//! Loads the TOML configuration, applies CLI overrides, starts backend
//! discovery and serves player streams until a termination signal arrives.

mod cli;
mod config;
mod logging;
mod ping;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Args;
use config::AppConfig;
use game_server::GameServer;
use service_discovery::{MemoryStore, ServicePool, TcpDialer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long running sessions get to receive their kick on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (before logging setup)
    let mut config = AppConfig::load_from_file(&args.config).await?;
    config.apply_overrides(&args)?;
    config
        .validate()
        .context("Configuration validation failed")?;

    logging::setup_logging(&config.logging)?;
    info!(
        "🚀 game node v{} | config: {}",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    let store = MemoryStore::new();
    config
        .discovery
        .seed(&store)
        .context("Failed to seed discovery store")?;
    let pool = ServicePool::start(
        Arc::new(store),
        TcpDialer::new(config.discovery.pool.dial_timeout()),
        config.discovery.pool.clone(),
    )
    .await;
    info!("🔎 Discovered services: {:?}", pool.service_names());

    let server = Arc::new(GameServer::new(config.server.clone(), ping::handlers()));
    info!("📋 Configuration Summary:");
    info!("  🌐 Bind address: {}", config.server.bind_address);
    info!("  👥 Max connections: {}", config.server.max_connections);
    info!("  📬 Push queue capacity: {}", config.server.push_queue_capacity);

    let mut server_task = tokio::spawn({
        let server = server.clone();
        async move { server.start().await }
    });

    info!("🛑 Press Ctrl+C to gracefully shutdown");
    tokio::select! {
        finished = &mut server_task => {
            pool.shutdown();
            return match finished {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("❌ Server error: {}", e);
                    Err(e.into())
                }
                Err(e) => Err(e).context("Server task failed"),
            };
        }
        signal = signals::wait_for_shutdown() => {
            signal.context("Failed to listen for shutdown signals")?;
        }
    }

    info!("🛑 Shutdown signal received, initiating graceful shutdown...");
    server.shutdown().await?;
    pool.shutdown();

    match tokio::time::timeout(SHUTDOWN_GRACE, server_task).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => return Err(e).context("Server task failed"),
        Err(_) => warn!("Server did not stop within {:?}", SHUTDOWN_GRACE),
    }

    info!("✅ Game node shutdown complete");
    Ok(())
}
