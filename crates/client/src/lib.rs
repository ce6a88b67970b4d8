//! Client side of the srpc runtime.
//!
//! A call resolves the target service's addresses through a [`Registry`],
//! picks one with a [`LoadBalancer`], checks out a pooled connection to it,
//! writes the request and registers it in the pending table. The
//! connection's reader completes the pending entry when the response with
//! the same request id arrives.
//!
//! [`Registry`]: srpc_registry::Registry
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod client;
mod config;
mod connection;
mod error;
mod pending;
mod pool;
pub mod selector;

pub use client::{CallOptions, ClientBuilder, ResponseFuture, RpcClient};
pub use config::{ClientConfig, PoolConfig};
pub use connection::{Connection, ConnectionTable};
pub use error::{Error, Result};
pub use pending::{PendingResponse, PendingTable};
pub use pool::{AddressPool, ConnectionPool};
pub use selector::{ConsistentHashLoadBalancer, LoadBalancer, RandomLoadBalancer};
