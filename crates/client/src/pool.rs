//! Connection pooling.
//!
//! One [`AddressPool`] per server address, each behind its own lock, so
//! traffic to different addresses never contends. The pool is unbounded and
//! non-blocking: [`ConnectionPool::acquire`] reuses an idle connection or
//! dials a new one and never waits for a free slot, so the socket count
//! follows peak concurrency per address.

use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionTable};
use crate::error::{Error, Result};

use dashmap::DashMap;
use parking_lot::Mutex;
use srpc_protocol::RpcCodec;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connections to a single address.
#[derive(Debug)]
pub struct AddressPool {
    addr: SocketAddr,
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl AddressPool {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connections: Mutex::new(Vec::new()),
        }
    }

    fn checkout(&self) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock();
        connections.retain(|conn| !conn.is_closed());
        connections.iter().find(|conn| conn.try_checkout()).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().clone()
    }

    fn prune(&self) -> usize {
        let mut connections = self.connections.lock();
        let before = connections.len();
        connections.retain(|conn| !conn.is_closed());
        before - connections.len()
    }

    /// Number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|conn| !conn.is_closed())
            .count()
    }

    /// Whether the pool holds no open connection.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of open connections that are not checked out.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|conn| !conn.is_closed() && !conn.is_busy())
            .count()
    }
}

/// Per-address pools of reusable connections.
pub struct ConnectionPool {
    pools: DashMap<SocketAddr, Arc<AddressPool>>,
    codec: RpcCodec,
    config: PoolConfig,
    table: Arc<ConnectionTable>,
    next_connection_id: AtomicU64,
    next_probe_id: AtomicU32,
    shutdown: CancellationToken,
}

impl ConnectionPool {
    /// Create a pool whose connections dispatch responses into `table`.
    #[must_use]
    pub fn new(config: PoolConfig, codec: RpcCodec, table: Arc<ConnectionTable>) -> Self {
        Self {
            pools: DashMap::new(),
            codec,
            config,
            table,
            next_connection_id: AtomicU64::new(0),
            next_probe_id: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the periodic health pass.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.health_check_loop().await;
        })
    }

    /// Check out a connection to `addr`, dialing one if none is idle.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is shut down or dialing fails.
    pub async fn acquire(&self, addr: SocketAddr) -> Result<Arc<Connection>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }

        let pool = Arc::clone(
            self.pools
                .entry(addr)
                .or_insert_with(|| Arc::new(AddressPool::new(addr)))
                .value(),
        );

        if let Some(conn) = pool.checkout() {
            return Ok(conn);
        }

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::connect(
            id,
            addr,
            self.codec.clone(),
            self.config.connect_timeout(),
            Arc::clone(&self.table),
            &self.shutdown,
        )
        .await?;

        pool.connections.lock().push(Arc::clone(&conn));
        Ok(conn)
    }

    /// Return a connection to its idle set.
    pub fn release(&self, conn: &Connection) {
        conn.release();
    }

    /// Pool for `addr`, if any connection was ever made to it.
    #[must_use]
    pub fn address_pool(&self, addr: SocketAddr) -> Option<Arc<AddressPool>> {
        self.pools.get(&addr).map(|pool| Arc::clone(pool.value()))
    }

    async fn health_check_loop(&self) {
        let mut ticker = interval(self.config.health_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.check_health().await,
            }
        }
        debug!("health check loop stopped");
    }

    /// Run one health pass over every connection.
    ///
    /// Idle connections are probed with a heartbeat and closed if the probe
    /// cannot be written. Checked-out connections that have been quiet longer
    /// than the reclaim threshold and carry no pending request are returned
    /// to the idle set, or closed if a response they still owe never came.
    pub async fn check_health(&self) {
        let reclaim_after = self.config.reclaim_after();
        let pools: Vec<_> = self.pools.iter().map(|p| Arc::clone(p.value())).collect();

        for pool in pools {
            for conn in pool.snapshot() {
                if conn.is_closed() {
                    continue;
                }

                if !conn.is_busy() {
                    let probe = self.next_probe_id.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = conn.send_heartbeat(probe, self.config.write_timeout()).await {
                        warn!(id = conn.id(), addr = %pool.addr, error = %e, "heartbeat failed");
                        conn.close();
                    }
                    continue;
                }

                if conn.quiet_for() < reclaim_after
                    || self.table.any_owned_by(|owner| Arc::ptr_eq(owner, &conn))
                {
                    continue;
                }

                if conn.in_flight() == 0 {
                    debug!(id = conn.id(), addr = %pool.addr, "reclaiming abandoned connection");
                    conn.release();
                } else {
                    debug!(
                        id = conn.id(),
                        addr = %pool.addr,
                        in_flight = conn.in_flight(),
                        "closing connection with unanswered requests"
                    );
                    conn.close();
                }
            }

            let pruned = pool.prune();
            if pruned > 0 {
                debug!(addr = %pool.addr, pruned, "pruned closed connections");
            }
        }
    }

    /// Longest a single frame write may take.
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        self.config.write_timeout()
    }

    /// Close every connection and stop the health pass.
    pub fn shutdown(&self) {
        info!("shutting down connection pool");
        self.shutdown.cancel();
        self.pools.clear();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addresses", &self.pools.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingResponse;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use srpc_protocol::{CodecRegistry, Message, MessageType, Payload, Request, Response};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;
    use tracing_test::traced_test;

    const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    fn codec() -> RpcCodec {
        RpcCodec::new(Arc::new(CodecRegistry::new()))
    }

    fn pool(config: PoolConfig) -> (Arc<ConnectionPool>, Arc<ConnectionTable>) {
        let table = Arc::new(ConnectionTable::new());
        let pool = Arc::new(ConnectionPool::new(config, codec(), Arc::clone(&table)));
        (pool, table)
    }

    /// Accepts connections and answers heartbeats; requests are answered
    /// only when `answer` is set.
    async fn spawn_peer(answer: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, codec());
                    while let Some(Ok(Ok(message))) = framed.next().await {
                        let reply = match (&message.message_type, &message.payload) {
                            (MessageType::HeartbeatRequest, _) => message.heartbeat_reply(),
                            (MessageType::Request, Payload::Request(request)) if answer => message
                                .reply(Response::ok(message.request_id, json!(request.method))),
                            _ => continue,
                        };
                        if framed.send(reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_reuses_idle_connection() {
        let addr = spawn_peer(true).await;
        let (pool, table) = pool(PoolConfig::default());

        let conn = pool.acquire(addr).await.unwrap();
        let first_id = conn.id();
        let rx = conn
            .send_request(&table, Message::request(1, Request::new("Echo", "say")), WRITE_TIMEOUT)
            .await
            .unwrap();
        let response = PendingResponse::new(Arc::clone(&table), 1, rx)
            .wait(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.result(), Some(&json!("say")));

        // The reader released the connection after the response.
        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.is_busy() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let again = pool.acquire(addr).await.unwrap();
        assert_eq!(again.id(), first_id);
        assert_eq!(pool.address_pool(addr).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_busy_connection_is_not_shared() {
        let addr = spawn_peer(true).await;
        let (pool, _table) = pool(PoolConfig::default());

        let a = pool.acquire(addr).await.unwrap();
        let b = pool.acquire(addr).await.unwrap();
        assert_ne!(a.id(), b.id());

        pool.release(&a);
        let c = pool.acquire(addr).await.unwrap();
        assert_eq!(c.id(), a.id());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (pool, _table) = pool(PoolConfig::default());
        assert!(matches!(
            pool.acquire(addr).await,
            Err(Error::Connect { .. } | Error::ConnectTimeout(_))
        ));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_health_pass_reclaims_abandoned_connection() {
        let addr = spawn_peer(false).await;
        let (pool, table) = pool(PoolConfig {
            reclaim_after_ms: 0,
            ..PoolConfig::default()
        });

        let conn = pool.acquire(addr).await.unwrap();
        let rx = conn
            .send_request(&table, Message::request(9, Request::new("Echo", "say")), WRITE_TIMEOUT)
            .await
            .unwrap();
        let result = PendingResponse::new(Arc::clone(&table), 9, rx)
            .wait(Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(table.is_empty());

        // The timeout left the connection checked out with a response owed.
        assert!(conn.is_busy());
        pool.check_health().await;
        assert!(conn.is_closed());
        assert!(pool.address_pool(addr).unwrap().is_empty());
        assert!(logs_contain("closing connection with unanswered requests"));
    }

    #[tokio::test]
    async fn test_health_pass_probes_idle_connections() {
        let addr = spawn_peer(true).await;
        let (pool, _table) = pool(PoolConfig::default());

        let conn = pool.acquire(addr).await.unwrap();
        pool.release(&conn);
        pool.check_health().await;
        assert!(!conn.is_closed());

        let checked_out = pool.acquire(addr).await.unwrap();
        assert_eq!(checked_out.id(), conn.id());
        pool.release(&checked_out);
        assert_eq!(pool.address_pool(addr).unwrap().idle(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_requests() {
        let addr = spawn_peer(false).await;
        let (pool, table) = pool(PoolConfig::default());

        let conn = pool.acquire(addr).await.unwrap();
        let rx = conn
            .send_request(&table, Message::request(4, Request::new("Echo", "say")), WRITE_TIMEOUT)
            .await
            .unwrap();
        let pending = PendingResponse::new(Arc::clone(&table), 4, rx);

        pool.shutdown();
        let result = pending.wait(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(matches!(pool.acquire(addr).await, Err(Error::ShutDown)));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_duplicate_response_keeps_live_request_checked_out() {
        // Answers every request with a copy of its reply to the first one.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, codec());
            let mut first: Option<Message> = None;
            while let Some(Ok(Ok(message))) = framed.next().await {
                let reply = first
                    .get_or_insert_with(|| {
                        message.reply(Response::ok(message.request_id, json!("first")))
                    })
                    .clone();
                if framed.send(reply).await.is_err() {
                    break;
                }
            }
        });

        let (pool, table) = pool(PoolConfig::default());
        let conn = pool.acquire(addr).await.unwrap();
        let rx = conn
            .send_request(&table, Message::request(1, Request::new("Echo", "say")), WRITE_TIMEOUT)
            .await
            .unwrap();
        PendingResponse::new(Arc::clone(&table), 1, rx)
            .wait(WRITE_TIMEOUT)
            .await
            .unwrap();

        let again = pool.acquire(addr).await.unwrap();
        assert_eq!(again.id(), conn.id());
        let rx = again
            .send_request(&table, Message::request(2, Request::new("Echo", "say")), WRITE_TIMEOUT)
            .await
            .unwrap();
        let result = PendingResponse::new(Arc::clone(&table), 2, rx)
            .wait(Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        assert!(logs_contain("dropping response to a request not sent here"));
        assert!(again.is_busy());
        assert_eq!(again.in_flight(), 1);
    }
}
