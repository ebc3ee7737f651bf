use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_MAX_CONNECTIONS_PER_DESTINATION: usize = 4;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SINGLE_REQUEST_THRESHOLD: usize = 2;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Upper bound on simultaneously existing connections per bucket.
    pub max_connections_per_destination: usize,
    /// How long a parked connection survives without new work.
    pub idle_timeout_ms: u64,
    /// Hosts whose learned requests-per-connection falls below this value
    /// are served from a single connection.
    pub single_request_threshold: usize,
    /// Bound on opening (or reopening) a transport.
    pub connect_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections_per_destination: DEFAULT_MAX_CONNECTIONS_PER_DESTINATION,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            single_request_threshold: DEFAULT_SINGLE_REQUEST_THRESHOLD,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Config {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_connections_per_destination(mut self, max: usize) -> Self {
        self.max_connections_per_destination = max;
        self
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections_per_destination == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections_per_destination",
                reason: "must allow at least one connection",
            });
        }
        if self.single_request_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "single_request_threshold",
                reason: "must be at least 1",
            });
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "idle_timeout_ms",
                reason: "must be non-zero",
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "connect_timeout_ms",
                reason: "must be non-zero",
            });
        }
        Ok(())
    }
}
