//! Address selection strategies.
//!
//! A [`LoadBalancer`] picks one address out of the candidates the registry
//! returned for a service. Strategies are compiled in and looked up by name
//! through [`load_balancer`].

mod consistent_hash;
mod random;

pub use consistent_hash::ConsistentHashLoadBalancer;
pub use random::RandomLoadBalancer;

use crate::error::{Error, Result};

use std::net::SocketAddr;
use std::sync::Arc;

/// Picks a target address for a request.
pub trait LoadBalancer: Send + Sync + 'static {
    /// Registered name of the strategy.
    fn name(&self) -> &'static str;

    /// Choose among at least two candidates.
    ///
    /// `routing_key` identifies the request (its id, or a caller-supplied
    /// affinity key). Returns `None` only if `candidates` is empty.
    fn pick(&self, service: &str, candidates: &[SocketAddr], routing_key: &[u8])
    -> Option<SocketAddr>;

    /// Select the address for a request to `service`.
    ///
    /// A single candidate is returned as is, without consulting the strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressResolution`] if there are no candidates.
    fn select_address(
        &self,
        service: &str,
        candidates: &[SocketAddr],
        routing_key: &[u8],
    ) -> Result<SocketAddr> {
        match candidates {
            [] => Err(Error::AddressResolution(service.to_string())),
            [only] => Ok(*only),
            _ => self
                .pick(service, candidates, routing_key)
                .ok_or_else(|| Error::AddressResolution(service.to_string())),
        }
    }
}

type Factory = fn() -> Arc<dyn LoadBalancer>;

const LOAD_BALANCERS: &[(&str, Factory)] = &[
    (RandomLoadBalancer::NAME, new_random),
    (ConsistentHashLoadBalancer::NAME, new_consistent_hash),
];

fn new_random() -> Arc<dyn LoadBalancer> {
    Arc::new(RandomLoadBalancer)
}

fn new_consistent_hash() -> Arc<dyn LoadBalancer> {
    Arc::new(ConsistentHashLoadBalancer::new())
}

/// Create the load balancer registered under `name`.
///
/// # Errors
///
/// Returns [`Error::UnknownLoadBalancer`] if no strategy has that name.
pub fn load_balancer(name: &str) -> Result<Arc<dyn LoadBalancer>> {
    LOAD_BALANCERS
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, factory)| factory())
        .ok_or_else(|| Error::UnknownLoadBalancer(name.to_string()))
}
