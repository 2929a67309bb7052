//! Zenoh bridge for Riden RD60xx power supplies.
//!
//! The RD60xx Wi-Fi module speaks Modbus RTU framing with the TCP roles
//! inverted: the PSU dials out and the bridge listens. This crate accepts
//! those connections, identifies each unit, polls telemetry on a per-device
//! cadence, and exposes state and control over zenoh:
//!
//! - [`listener`] - TCP accept loop and per-PSU on-boarding
//! - [`device`] - per-PSU session state machine over the frame codec
//! - [`dispatcher`] - per-device request serialization, timeout and retry
//! - [`poller`] - per-device periodic telemetry reads
//! - [`registry`] - identity-keyed shared state
//! - [`adapter`] - zenoh subscriptions and publishing
//! - [`config`] - JSON5 configuration
//! - [`keyexpr`] / [`messages`] - topic hierarchy and payload types

pub mod adapter;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod keyexpr;
pub mod listener;
pub mod messages;
pub mod poller;
pub mod registry;

pub use error::CommandError;

use config::{LogFormat, LoggingConfig};

/// Initialize tracing with the given configuration.
///
/// Supports human-readable text (default) and structured JSON output. The
/// `RUST_LOG` environment variable overrides the configured level.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
    }

    Ok(())
}
