//! Error types for the RPC server.

use std::net::SocketAddr;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the RPC server.
///
/// Filter and invocation faults never surface here; they are answered to the
/// caller as error responses.
#[derive(Debug, Error)]
pub enum Error {
    /// The listener could not be bound.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        /// Requested bind address.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation on a connection.
    #[error("Protocol error: {0}")]
    Protocol(#[from] srpc_protocol::Error),

    /// The rate of the traffic-control filter could not be changed.
    #[error("Rate limiter error: {0}")]
    RateLimit(#[from] srpc_rate_limiter::Error),

    /// Traffic control is disabled on this server.
    #[error("Traffic control is not enabled")]
    TrafficControlDisabled,

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}
