//! RPC client implementation.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionTable};
use crate::error::{Error, Result};
use crate::pending::PendingResponse;
use crate::pool::ConnectionPool;
use crate::selector::{self, LoadBalancer};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use srpc_protocol::{CodecRegistry, Message, Request, Response, RpcCodec, Value};
use srpc_registry::Registry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Future of a response to a request sent by [`RpcClient::send`].
pub type ResponseFuture = PendingResponse<Arc<Connection>>;

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Time to wait for the response.
    pub timeout: Option<Duration>,
    /// Serializer id for the request.
    pub serializer: Option<u8>,
    /// Compressor id for the request.
    pub compressor: Option<u8>,
    /// Key routing the call under consistent hashing. Defaults to the
    /// request id.
    pub affinity_key: Option<String>,
}

impl CallOptions {
    /// Wait at most `timeout` for the response.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Serialize the request with the serializer registered under `id`.
    #[must_use]
    pub const fn serializer(mut self, id: u8) -> Self {
        self.serializer = Some(id);
        self
    }

    /// Compress the request with the compressor registered under `id`.
    #[must_use]
    pub const fn compressor(mut self, id: u8) -> Self {
        self.compressor = Some(id);
        self
    }

    /// Route by `key` instead of the request id.
    #[must_use]
    pub fn affinity_key(mut self, key: impl Into<String>) -> Self {
        self.affinity_key = Some(key.into());
        self
    }
}

/// Builder for creating RPC clients.
pub struct ClientBuilder {
    registry: Option<Arc<dyn Registry>>,
    config: ClientConfig,
    codecs: CodecRegistry,
    load_balancer: Option<Arc<dyn LoadBalancer>>,
}

impl ClientBuilder {
    /// Create a new client builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: None,
            config: ClientConfig::default(),
            codecs: CodecRegistry::new(),
            load_balancer: None,
        }
    }

    /// Set the registry used to resolve service addresses.
    #[must_use]
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the serializer and compressor registry.
    #[must_use]
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Use a specific load balancer instead of the configured one.
    #[must_use]
    pub fn load_balancer(mut self, load_balancer: Arc<dyn LoadBalancer>) -> Self {
        self.load_balancer = Some(load_balancer);
        self
    }

    /// Build the RPC client and start its pool health task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if no registry was set or the configuration names an
    /// unknown codec or load balancer.
    pub fn build(self) -> Result<RpcClient> {
        let registry = self
            .registry
            .ok_or_else(|| Error::Config("registry not specified".to_string()))?;

        let serializer = self
            .codecs
            .serializer_id(&self.config.serializer)
            .ok_or_else(|| Error::UnknownCodec(self.config.serializer.clone()))?;
        let compressor = self
            .codecs
            .compressor_id(&self.config.compressor)
            .ok_or_else(|| Error::UnknownCodec(self.config.compressor.clone()))?;

        let load_balancer = match self.load_balancer {
            Some(load_balancer) => load_balancer,
            None => selector::load_balancer(&self.config.load_balancer)?,
        };

        let codec = RpcCodec::new(Arc::new(self.codecs)).with_max_frame_len(self.config.max_frame_len);
        let table = Arc::new(ConnectionTable::new());
        let pool = Arc::new(ConnectionPool::new(
            self.config.pool.clone(),
            codec,
            Arc::clone(&table),
        ));
        let health_task = pool.start();

        info!(
            load_balancer = load_balancer.name(),
            serializer = %self.config.serializer,
            compressor = %self.config.compressor,
            "client started"
        );

        Ok(RpcClient {
            registry,
            load_balancer,
            pool,
            table,
            next_request_id: AtomicU32::new(0),
            serializer,
            compressor,
            config: self.config,
            health_task: Mutex::new(Some(health_task)),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// RPC client for making requests.
pub struct RpcClient {
    registry: Arc<dyn Registry>,
    load_balancer: Arc<dyn LoadBalancer>,
    pool: Arc<ConnectionPool>,
    table: Arc<ConnectionTable>,
    next_request_id: AtomicU32,
    serializer: u8,
    compressor: u8,
    config: ClientConfig,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Send a request without waiting for the response.
    ///
    /// The request is registered as pending only once it has been written.
    /// The write is bounded by the pool's write timeout, or by
    /// `options.timeout` if that is shorter. The returned future resolves to
    /// the matching response; use [`PendingResponse::wait`] to bound the wait.
    ///
    /// # Errors
    ///
    /// Returns an error if no address can be resolved for the service, no
    /// connection can be established, or the request cannot be written in
    /// time.
    #[instrument(skip(self, request, options), fields(service = %request.service, method = %request.method))]
    pub async fn send(&self, request: Request, options: &CallOptions) -> Result<ResponseFuture> {
        let candidates = self.registry.resolve_addresses(&request.service).await?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let routing_key = options
            .affinity_key
            .as_ref()
            .map_or_else(|| request_id.to_be_bytes().to_vec(), |key| key.as_bytes().to_vec());
        let addr = self
            .load_balancer
            .select_address(&request.service, &candidates, &routing_key)?;

        let conn = self.pool.acquire(addr).await?;

        let message = Message::request(request_id, request)
            .with_serializer(options.serializer.unwrap_or(self.serializer))
            .with_compressor(options.compressor.unwrap_or(self.compressor));

        let write_timeout = options
            .timeout
            .map_or(self.pool.write_timeout(), |timeout| {
                timeout.min(self.pool.write_timeout())
            });
        let receiver = conn
            .send_request(&self.table, message, write_timeout)
            .await?;
        debug!(request_id, %addr, connection = conn.id(), "request sent");

        Ok(PendingResponse::new(
            Arc::clone(&self.table),
            request_id,
            receiver,
        ))
    }

    /// Send a request and wait for its response.
    ///
    /// The timeout covers the whole call: resolving, connecting, writing and
    /// waiting for the response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails or no response arrives in time. A
    /// response carrying an error is returned as `Ok`.
    pub async fn request(&self, request: Request, options: &CallOptions) -> Result<Response> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.request_timeout());
        let deadline = Instant::now() + timeout;

        let pending = tokio::time::timeout_at(deadline, self.send(request, options))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        pending
            .wait(deadline.saturating_duration_since(Instant::now()))
            .await
            .map_err(|e| match e {
                Error::Timeout(_) => Error::Timeout(timeout),
                other => other,
            })
    }

    /// Call a remote method and deserialize its result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the server reported an error,
    /// [`Error::ResultType`] if the result does not deserialize as `R`, or
    /// any error of [`RpcClient::request`].
    pub async fn call<R: DeserializeOwned>(&self, request: Request, options: &CallOptions) -> Result<R> {
        let value = self.request(request, options).await?.into_result()?;
        Ok(serde_json::from_value(value)?)
    }

    /// Invoke `service.method` with explicitly typed arguments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the server reported an error, or any
    /// error of [`RpcClient::request`].
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        param_types: Vec<String>,
        args: Vec<Value>,
    ) -> Result<Value> {
        let request = Request {
            service: service.to_string(),
            method: method.to_string(),
            param_types,
            args,
        };
        Ok(self
            .request(request, &CallOptions::default())
            .await?
            .into_result()?)
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.table.len()
    }

    /// Connection pool used by this client.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Close all connections and fail every pending request.
    pub fn shutdown(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
        self.pool.shutdown();
        self.table.clear();
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("load_balancer", &self.load_balancer.name())
            .field("pending_requests", &self.pending_requests())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
