//! Zenoh bridge for Riden RD60xx power supplies.
//!
//! Accepts reverse-TCP connections from RD60xx units (the PSU is the TCP
//! client) and bridges telemetry and control to zenoh.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use zenoh_bridge_rd60xx::adapter::{self, InboundHandler};
use zenoh_bridge_rd60xx::config::BridgeConfig;
use zenoh_bridge_rd60xx::registry::Registry;
use zenoh_bridge_rd60xx::{init_tracing, listener};

/// Zenoh bridge for Riden RD60xx power supplies.
#[derive(Parser, Debug)]
#[command(name = "zenoh-bridge-rd60xx")]
#[command(about = "Bridges Riden RD60xx power supplies to Zenoh")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "rd60xx.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = BridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging)?;

    info!("Starting zenoh-bridge-rd60xx");
    info!("Loaded configuration from {:?}", args.config);

    let session = adapter::connect(&config.zenoh).await?;

    let registry = Arc::new(Registry::new(
        config.psu.names.clone(),
        config.psu.default_period_secs,
    ));
    let (events_tx, events_rx) = mpsc::channel(256);

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(adapter::run_outbound(
        session.clone(),
        config.psu.key_prefix.clone(),
        events_rx,
    )));

    let handler = InboundHandler::new(
        config.psu.key_prefix.clone(),
        registry.clone(),
        events_tx.clone(),
    );
    tasks.push(tokio::spawn({
        let session = session.clone();
        async move {
            if let Err(e) = adapter::run_inbound(session, handler).await {
                error!("Bus adapter failed: {e}");
            }
        }
    }));

    tasks.push(tokio::spawn({
        let psu = config.psu.clone();
        let registry = registry.clone();
        let events = events_tx.clone();
        async move {
            if let Err(e) = listener::run(psu, registry, events).await {
                error!("Listener failed: {e}");
            }
        }
    }));

    info!("Bridge running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Cancel device sessions first, then the service tasks.
    registry.shutdown();
    for task in &tasks {
        task.abort();
    }

    session
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;
    info!("Bridge stopped");

    Ok(())
}
