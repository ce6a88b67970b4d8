//! Server side of the srpc runtime.
//!
//! The server accepts TCP connections and decodes frames with the protocol
//! codec. Heartbeat probes are answered on the spot. Each request runs on
//! its own task: it passes through the [`FilterChain`] (the built-in
//! [`TrafficControlFilter`] first, when enabled), then the [`Invoker`]
//! resolves the service and method from the [`ServiceRegistry`] and runs
//! it. Denials, faults and method failures are all answered as error
//! responses; only protocol violations close a connection.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod dispatch;
mod error;
pub mod filter;
mod invoker;
mod server;
mod service;

pub use config::{ServerConfig, TrafficControlConfig};
pub use dispatch::{Admission, Invocation, Pipeline};
pub use error::{Error, Result};
pub use filter::{Call, Decision, Filter, FilterChain, FilterFault, TrafficControlFilter};
pub use invoker::Invoker;
pub use server::{RpcServer, ServerHandle};
pub use service::{Method, MethodError, MethodFuture, Service, ServiceBuilder, ServiceRegistry};
