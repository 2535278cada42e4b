//! Backend configuration.
//!
//! Configuration comes from explicit construction or from the environment
//! (`.env` files are honored via `dotenvy`; real environment variables win).
//! Everything has a sensible default except the backend endpoint and API
//! key, which must be supplied.
//!
//! # Environment variables
//!
//! - `RELAY_BACKEND_URL` — WebSocket endpoint of the conversational backend
//! - `RELAY_API_KEY` — bearer token presented during the upgrade
//! - `RELAY_OPEN_TIMEOUT_SECS` — connect handshake budget (default 15)
//! - `RELAY_RECONNECT_BACKOFF_MS` — delay between close confirmation and
//!   reopen (default 500)
//! - `RELAY_SOFT_RESTART_SECS` / `RELAY_HARD_RESTART_SECS` — proactive
//!   restart thresholds (defaults 420 / 540)
//! - `RELAY_BUFFER_CAPACITY` — replay buffer frame bound (default 500)
//!
//! # Example
//! ```rust,no_run
//! use voxbridge_relay::BackendConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BackendConfig::from_env()?;
//! println!("Relaying to {}", config.endpoint);
//! # Ok(())
//! # }
//! ```

use std::env;
use std::time::Duration;

use crate::core::relay::{BufferPolicy, RelayError, RelayResult, RestartPolicy};
use crate::utils::validate_backend_endpoint;

/// Connection-level configuration for the conversational backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// WebSocket endpoint (`wss://…`; plain `ws://` only for loopback)
    pub endpoint: String,

    /// Bearer token presented during the WebSocket upgrade
    pub api_key: String,

    /// Budget for the connect handshake, upgrade through ready
    pub open_timeout: Duration,

    /// Delay between a confirmed close and the reopen during a reconnect
    pub reconnect_backoff: Duration,

    /// Proactive restart thresholds
    pub restart: RestartPolicy,

    /// Replay buffer limits
    pub buffering: BufferPolicy,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            open_timeout: Duration::from_secs(15),
            reconnect_backoff: Duration::from_millis(500),
            restart: RestartPolicy::default(),
            buffering: BufferPolicy::default(),
        }
    }
}

impl BackendConfig {
    /// Load configuration from the environment, validating the result.
    pub fn from_env() -> RelayResult<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        if let Ok(v) = env::var("RELAY_BACKEND_URL") {
            config.endpoint = v;
        }
        if let Ok(v) = env::var("RELAY_API_KEY") {
            config.api_key = v;
        }
        if let Ok(v) = env::var("RELAY_OPEN_TIMEOUT_SECS") {
            config.open_timeout = Duration::from_secs(parse_var("RELAY_OPEN_TIMEOUT_SECS", &v)?);
        }
        if let Ok(v) = env::var("RELAY_RECONNECT_BACKOFF_MS") {
            config.reconnect_backoff =
                Duration::from_millis(parse_var("RELAY_RECONNECT_BACKOFF_MS", &v)?);
        }
        if let Ok(v) = env::var("RELAY_SOFT_RESTART_SECS") {
            config.restart.soft_age = Duration::from_secs(parse_var("RELAY_SOFT_RESTART_SECS", &v)?);
        }
        if let Ok(v) = env::var("RELAY_HARD_RESTART_SECS") {
            config.restart.hard_age = Duration::from_secs(parse_var("RELAY_HARD_RESTART_SECS", &v)?);
        }
        if let Ok(v) = env::var("RELAY_BUFFER_CAPACITY") {
            config.buffering.capacity = parse_var::<usize>("RELAY_BUFFER_CAPACITY", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for contradictions and missing required
    /// values.
    pub fn validate(&self) -> RelayResult<()> {
        if self.endpoint.is_empty() {
            return Err(RelayError::InvalidConfiguration(
                "backend endpoint is required".to_string(),
            ));
        }
        validate_backend_endpoint(&self.endpoint)
            .map_err(|e| RelayError::InvalidConfiguration(e.to_string()))?;
        if self.api_key.is_empty() {
            return Err(RelayError::InvalidConfiguration(
                "backend API key is required".to_string(),
            ));
        }
        if self.restart.soft_age >= self.restart.hard_age {
            return Err(RelayError::InvalidConfiguration(format!(
                "soft restart age ({:?}) must be below the hard age ({:?})",
                self.restart.soft_age, self.restart.hard_age
            )));
        }
        if self.buffering.capacity == 0 {
            return Err(RelayError::InvalidConfiguration(
                "replay buffer capacity must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> RelayResult<T> {
    value.parse().map_err(|_| {
        RelayError::InvalidConfiguration(format!("{key} must be a number, got: {value}"))
    })
}
