//! Server configuration.

use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use srpc_protocol::DEFAULT_MAX_FRAME_LEN;
use std::net::SocketAddr;
use std::path::Path;

/// Configuration for the RPC server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Largest frame accepted or produced, in bytes.
    pub max_frame_len: usize,
    /// Invocations allowed to run at once across all connections.
    pub max_concurrent_invocations: usize,
    /// Built-in traffic-control filter.
    pub traffic_control: TrafficControlConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_concurrent_invocations: 256,
            traffic_control: TrafficControlConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse a configuration from TOML. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document is invalid.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;
        Self::from_toml_str(&contents)
    }

    /// Check values that deserialize but cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_invocations == 0 {
            return Err(Error::Config(
                "max_concurrent_invocations must be at least 1".to_string(),
            ));
        }
        if self.traffic_control.enabled && self.traffic_control.permits_per_second <= 0.0 {
            return Err(Error::Config(
                "traffic_control.permits_per_second must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of the traffic-control filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficControlConfig {
    /// Register the filter ahead of all others.
    pub enabled: bool,
    /// Requests admitted per second.
    pub permits_per_second: f64,
}

impl Default for TrafficControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            permits_per_second: 1000.0,
        }
    }
}
