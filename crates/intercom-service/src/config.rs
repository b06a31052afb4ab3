//! Intercom service configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default matching the endpoint firmware, so an empty environment is a
//! valid configuration.

use crate::actors::{ConnectionSettings, SessionSettings};
use intercom_protocol::DEFAULT_PORT;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind address for the control API, health and metrics.
pub const DEFAULT_HTTP_BIND_ADDRESS: &str = "0.0.0.0:8090";

/// Default TCP connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 5;

/// Default keepalive PING interval in seconds.
pub const DEFAULT_KEEPALIVE_INTERVAL_SECONDS: u64 = 5;

/// Default wait for a START or ANSWER reply, in milliseconds.
pub const DEFAULT_STREAM_START_WAIT_MS: u64 = 500;

/// Default capacity of each outbound audio queue.
pub const DEFAULT_AUDIO_QUEUE_CAPACITY: usize = 8;

/// Default display name sent to endpoints by call sessions.
pub const DEFAULT_CALLER_NAME: &str = "Intercom Hub";

/// Default service instance ID prefix.
pub const DEFAULT_SERVICE_ID_PREFIX: &str = "intercom";

/// Intercom service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address (default: "0.0.0.0:8090").
    pub http_bind_address: String,

    /// TCP port used when a request does not name one (default: 6054).
    pub endpoint_port: u16,

    /// TCP connect timeout in seconds (default: 5).
    pub connect_timeout_seconds: u64,

    /// Keepalive PING interval in seconds (default: 5).
    pub keepalive_interval_seconds: u64,

    /// How long to wait for PONG/RING after START, in milliseconds (default: 500).
    pub stream_start_wait_ms: u64,

    /// Outbound audio queue capacity per direction (default: 8).
    pub audio_queue_capacity: usize,

    /// Caller display name sent in START by call sessions.
    pub caller_name: String,

    /// Unique identifier for this service instance.
    pub service_id: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let http_bind_address = vars
            .get("INTERCOM_HTTP_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HTTP_BIND_ADDRESS.to_string());

        let endpoint_port = parse_var(vars, "INTERCOM_ENDPOINT_PORT", DEFAULT_PORT)?;
        if endpoint_port == 0 {
            return Err(ConfigError::InvalidValue(
                "INTERCOM_ENDPOINT_PORT must be non-zero".to_string(),
            ));
        }

        let connect_timeout_seconds = parse_positive(
            vars,
            "INTERCOM_CONNECT_TIMEOUT_SECONDS",
            DEFAULT_CONNECT_TIMEOUT_SECONDS,
        )?;

        let keepalive_interval_seconds = parse_positive(
            vars,
            "INTERCOM_KEEPALIVE_INTERVAL_SECONDS",
            DEFAULT_KEEPALIVE_INTERVAL_SECONDS,
        )?;

        let stream_start_wait_ms = parse_positive(
            vars,
            "INTERCOM_STREAM_START_WAIT_MS",
            DEFAULT_STREAM_START_WAIT_MS,
        )?;

        let audio_queue_capacity = parse_var(
            vars,
            "INTERCOM_AUDIO_QUEUE_CAPACITY",
            DEFAULT_AUDIO_QUEUE_CAPACITY,
        )?;
        if audio_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "INTERCOM_AUDIO_QUEUE_CAPACITY must be at least 1".to_string(),
            ));
        }

        let caller_name = vars
            .get("INTERCOM_CALLER_NAME")
            .filter(|name| !name.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_CALLER_NAME.to_string());

        // Generate service instance ID
        let service_id = vars.get("INTERCOM_SERVICE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SERVICE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            http_bind_address,
            endpoint_port,
            connect_timeout_seconds,
            keepalive_interval_seconds,
            stream_start_wait_ms,
            audio_queue_capacity,
            caller_name,
            service_id,
        })
    }

    /// Per-connection timing derived from this configuration.
    #[must_use]
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_seconds),
            stream_start_wait: Duration::from_millis(self.stream_start_wait_ms),
            ..ConnectionSettings::default()
        }
    }

    /// Session-level settings derived from this configuration.
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connection: self.connection_settings(),
            audio_queue_capacity: self.audio_queue_capacity,
            caller_name: self.caller_name.clone(),
            default_port: self.endpoint_port,
            ..SessionSettings::default()
        }
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
        None => Ok(default),
    }
}

fn parse_positive(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let value = parse_var(vars, name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(format!("{name} must be positive")));
    }
    Ok(value)
}
