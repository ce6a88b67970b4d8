//! Client configuration.

use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use srpc_protocol::DEFAULT_MAX_FRAME_LEN;
use std::path::Path;
use std::time::Duration;

/// Configuration for the RPC client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Serializer used for requests, by name.
    pub serializer: String,
    /// Compressor used for requests, by name (`"off"` for none).
    pub compressor: String,
    /// Default time to wait for a response, in milliseconds.
    pub request_timeout_ms: u64,
    /// Address selection strategy (`"random"` or `"consistent-hash"`).
    pub load_balancer: String,
    /// Largest frame accepted or produced, in bytes.
    pub max_frame_len: usize,
    /// Connection pool settings.
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            serializer: "cbor".to_string(),
            compressor: "gzip".to_string(),
            request_timeout_ms: 10_000, // 10 seconds
            load_balancer: "random".to_string(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            pool: PoolConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from TOML. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document is invalid.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("Failed to parse config: {e}")))
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

    /// Default request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Configuration for connection pooling.
///
/// The pool is unbounded: acquiring a connection for an address either reuses
/// an idle one or dials a new one, and never waits for a slot. Under sustained
/// concurrency the number of sockets grows with the number of concurrent
/// requests per address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Longest a single frame write may take, in milliseconds. A connection
    /// whose write stalls past this is closed.
    pub write_timeout_ms: u64,
    /// Interval between health passes in milliseconds.
    pub health_check_interval_ms: u64,
    /// A checked-out connection with no pending request is reclaimed after
    /// this many quiet milliseconds.
    pub reclaim_after_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,        // 3 seconds
            write_timeout_ms: 10_000,         // 10 seconds
            health_check_interval_ms: 30_000, // 30 seconds
            reclaim_after_ms: 60_000,         // 1 minute
        }
    }
}

impl PoolConfig {
    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Write timeout.
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Interval between health passes.
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Quiet period before reclaiming a checked-out connection.
    #[must_use]
    pub const fn reclaim_after(&self) -> Duration {
        Duration::from_millis(self.reclaim_after_ms)
    }
}
