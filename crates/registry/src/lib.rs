//! Service address discovery.
//!
//! The client only needs one thing from service discovery: the current set of
//! addresses serving a given service name. [`Registry`] is that contract;
//! [`StaticRegistry`] is an in-memory implementation for fixed deployments and
//! tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;

pub use error::RegistryError;

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

/// Resolves a service name to the addresses currently serving it.
#[async_trait]
pub trait Registry
where
    Self: Send + Sync + 'static,
{
    /// Addresses currently serving `service`.
    ///
    /// An empty list is a valid answer: the service is known but has no
    /// live instance right now.
    async fn resolve_addresses(&self, service: &str) -> Result<Vec<SocketAddr>, RegistryError>;
}

#[async_trait]
impl<R: Registry> Registry for Arc<R> {
    async fn resolve_addresses(&self, service: &str) -> Result<Vec<SocketAddr>, RegistryError> {
        (**self).resolve_addresses(service).await
    }
}

#[derive(Debug, Deserialize)]
struct Definition {
    #[serde(default)]
    services: HashMap<String, Vec<SocketAddr>>,
}

/// In-memory registry with explicitly managed membership.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    services: RwLock<HashMap<String, Vec<SocketAddr>>>,
    version: AtomicU64,
}

impl StaticRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a registry from TOML of the form:
    ///
    /// ```toml
    /// [services]
    /// Echo = ["127.0.0.1:9000", "127.0.0.1:9001"]
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Definition`] if the document is not valid.
    pub fn from_toml_str(content: &str) -> Result<Self, RegistryError> {
        let definition: Definition =
            toml::from_str(content).map_err(|e| RegistryError::Definition(e.to_string()))?;

        Ok(Self {
            services: RwLock::new(definition.services),
            version: AtomicU64::new(0),
        })
    }

    /// Load a registry definition file. See [`StaticRegistry::from_toml_str`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Definition`] if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            RegistryError::Definition(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Add an address to a service. Adding an existing address is a no-op.
    pub fn register(&self, service: &str, addr: SocketAddr) {
        let mut services = self.services.write();
        let addrs = services.entry(service.to_string()).or_default();
        if !addrs.contains(&addr) {
            addrs.push(addr);
            self.version.fetch_add(1, Ordering::AcqRel);
            debug!(service, %addr, "registered address");
        }
    }

    /// Remove an address from a service. Returns whether it was present.
    pub fn deregister(&self, service: &str, addr: SocketAddr) -> bool {
        let mut services = self.services.write();
        let Some(addrs) = services.get_mut(service) else {
            return false;
        };
        let before = addrs.len();
        addrs.retain(|a| *a != addr);
        let removed = addrs.len() != before;
        if removed {
            self.version.fetch_add(1, Ordering::AcqRel);
            debug!(service, %addr, "deregistered address");
        }
        removed
    }

    /// Replace the full address set of a service.
    pub fn set(&self, service: &str, addrs: Vec<SocketAddr>) {
        self.services.write().insert(service.to_string(), addrs);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Monotonic counter bumped on every membership change.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn resolve_addresses(&self, service: &str) -> Result<Vec<SocketAddr>, RegistryError> {
        self.services
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownService(service.to_string()))
    }
}
