//! Bridge configuration (JSON5 format).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] json5::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Zenoh connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZenohConfig {
    /// Zenoh mode: "client", "peer", or "router".
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Endpoints to connect to (for client mode).
    #[serde(default)]
    pub connect: Vec<String>,

    /// Endpoints to listen on (for peer/router mode).
    #[serde(default)]
    pub listen: Vec<String>,
}

fn default_mode() -> String {
    "peer".to_string()
}

impl Default for ZenohConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            connect: Vec::new(),
            listen: Vec::new(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// PSU-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsuConfig {
    /// Address the reverse-TCP listener binds to. The PSUs are the TCP
    /// clients; the bridge never dials out.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Key expression prefix for all PSU topics.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline for one wire request, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Re-sends after a timed-out request before the cycle fails.
    #[serde(default = "default_request_retries")]
    pub request_retries: u32,

    /// Poll period applied to units seen for the first time, in seconds.
    /// 0 disables automatic polling.
    #[serde(default)]
    pub default_period_secs: f64,

    /// Write the host clock to a unit when it connects.
    #[serde(default = "default_set_clock")]
    pub set_clock_on_connect: bool,

    /// Display names keyed by identity ("{model}_{serial}"). Units without
    /// an entry are listed as "Unnamed".
    #[serde(default)]
    pub names: HashMap<String, String>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_key_prefix() -> String {
    "riden_psu".to_string()
}

fn default_request_timeout_ms() -> u64 {
    1000
}

fn default_request_retries() -> u32 {
    2
}

fn default_set_clock() -> bool {
    true
}

impl Default for PsuConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            key_prefix: default_key_prefix(),
            request_timeout_ms: default_request_timeout_ms(),
            request_retries: default_request_retries(),
            default_period_secs: 0.0,
            set_clock_on_connect: default_set_clock(),
            names: HashMap::new(),
        }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Zenoh connection settings.
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// PSU listener and polling settings.
    #[serde(default)]
    pub psu: PsuConfig,
}

impl BridgeConfig {
    /// Load and validate a configuration file in JSON5 format.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.psu
            .listen
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("listen address: {e}")))?;

        if self.psu.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms must be positive".into(),
            ));
        }
        if !self.psu.default_period_secs.is_finite() || self.psu.default_period_secs < 0.0 {
            return Err(ConfigError::Invalid(
                "default_period_secs must be zero or a positive number".into(),
            ));
        }
        if self.psu.key_prefix.is_empty() || self.psu.key_prefix.contains(['*', '$', '#']) {
            return Err(ConfigError::Invalid(
                "key_prefix must be a literal key expression".into(),
            ));
        }
        Ok(())
    }
}
