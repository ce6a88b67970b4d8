//! Ordered request filters.
//!
//! Filters run in registration order before a request reaches its method.
//! The first deny ends the chain and is answered as an error naming the
//! filter. A filter that fails (returns a fault or panics) is answered the
//! same way with a fault error; neither outcome touches the connection.

mod traffic_control;

pub use traffic_control::TrafficControlFilter;

use srpc_protocol::{RemoteError, Request};
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Verdict of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Pass the request on.
    Allow,
    /// Reject the request.
    Deny,
}

/// A failure inside a filter, as opposed to a deny.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct FilterFault(pub String);

impl FilterFault {
    /// Create a fault with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A request as seen by filters.
#[derive(Debug, Clone, Copy)]
pub struct Call<'a> {
    /// Address of the calling client.
    pub peer: SocketAddr,
    /// Correlation id of the request.
    pub request_id: u32,
    /// The decoded request.
    pub request: &'a Request,
}

/// A named interceptor deciding whether a request may proceed.
pub trait Filter: Send + Sync + 'static {
    /// Name reported when the filter denies or faults.
    fn name(&self) -> &str;

    /// Decide on a request.
    ///
    /// # Errors
    ///
    /// Returns a [`FilterFault`] if the filter cannot reach a decision.
    fn decide(&self, call: &Call<'_>) -> Result<Decision, FilterFault>;
}

/// Filters in the order they run.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    /// An empty chain, which allows everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter to the end of the chain.
    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    /// Names of the filters in run order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|filter| filter.name()).collect()
    }

    /// Number of filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the chain has no filters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the chain, stopping at the first filter that does not allow.
    ///
    /// # Errors
    ///
    /// Returns the error to answer the caller with if a filter denied the
    /// request or failed.
    pub fn run(&self, call: &Call<'_>) -> Result<(), RemoteError> {
        for filter in &self.filters {
            let decision = catch_unwind(AssertUnwindSafe(|| filter.decide(call)));
            match decision {
                Ok(Ok(Decision::Allow)) => {}
                Ok(Ok(Decision::Deny)) => {
                    debug!(filter = filter.name(), request_id = call.request_id, peer = %call.peer, "request denied");
                    return Err(RemoteError::filtered(filter.name()));
                }
                Ok(Err(fault)) => {
                    warn!(filter = filter.name(), request_id = call.request_id, error = %fault, "filter fault");
                    return Err(RemoteError::filter_fault(filter.name(), fault.0));
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(filter = filter.name(), request_id = call.request_id, error = %message, "filter panicked");
                    return Err(RemoteError::filter_fault(filter.name(), message));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panicked".to_string())
}
