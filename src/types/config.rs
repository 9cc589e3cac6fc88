//! Configuration structures.
//!
//! Configuration is plain serde data; durations use humantime strings
//! (`"250ms"`, `"30s"`). Every section falls back to its defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::{Error, Result};

/// Global client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Reconnect policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Request correlation configuration.
    #[serde(default)]
    pub requests: RequestConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load a JSON config file. Missing sections and fields take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.connection.max_frame_bytes == 0 {
            return Err(Error::config("connection.max_frame_bytes must be positive"));
        }
        if self.connection.outbound_capacity == 0 {
            return Err(Error::config("connection.outbound_capacity must be positive"));
        }
        if self.reconnect.initial_delay > self.reconnect.max_delay {
            return Err(Error::config(format!(
                "reconnect.initial_delay ({:?}) exceeds reconnect.max_delay ({:?})",
                self.reconnect.initial_delay, self.reconnect.max_delay
            )));
        }
        if self.requests.sweep_interval.is_zero() {
            return Err(Error::config("requests.sweep_interval must be positive"));
        }
        Ok(())
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server address handed to the transport.
    pub url: String,

    /// Maximum accepted frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Outbound frames buffered per connection before sends are dropped.
    pub outbound_capacity: usize,

    /// Upper bound on a single connect attempt.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "127.0.0.1:20000".to_string(),
            max_frame_bytes: 5 * 1024 * 1024,
            outbound_capacity: 1024,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Reconnect policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the second consecutive attempt; doubles afterwards.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Cap on the delay between attempts.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Consecutive failed attempts before giving up. None means unlimited.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Request correlation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Age after which a pending request is rejected. None disables timeouts.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// How often pending requests are checked against `timeout` and for
    /// callers that stopped waiting.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
