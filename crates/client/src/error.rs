//! Error types for the RPC client.

use srpc_protocol::RemoteError;
use srpc_registry::RegistryError;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the RPC client.
#[derive(Debug, Error)]
pub enum Error {
    /// No address is available for the target service.
    #[error("No address available for service '{0}'")]
    AddressResolution(String),

    /// The registry could not be queried.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Connecting to a server failed.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        /// Address that was dialed.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Connecting to a server did not finish in time.
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),

    /// The request could not be written.
    #[error("Transport error: {0}")]
    Transport(#[from] srpc_protocol::Error),

    /// The request was not written, or not answered, before the deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection carrying the request went away before a response.
    #[error("Connection closed before a response was received")]
    ConnectionClosed,

    /// The server answered with an error.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The result could not be converted into the requested type.
    #[error("Unexpected result type: {0}")]
    ResultType(#[from] serde_json::Error),

    /// No load balancer is registered under this name.
    #[error("Unknown load balancer: {0}")]
    UnknownLoadBalancer(String),

    /// No serializer or compressor is registered under this name.
    #[error("Unknown codec: {0}")]
    UnknownCodec(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The client has been shut down.
    #[error("Client is shut down")]
    ShutDown,
}
