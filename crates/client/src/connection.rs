//! A single pooled client connection.

use crate::error::{Error, Result};
use crate::pending::PendingTable;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use srpc_protocol::{
    Message, MessageType, Payload, RemoteError, RemoteErrorKind, Response, RpcCodec,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Notify, oneshot};
use tokio::time::{Instant, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

type FrameSink = SplitSink<Framed<TcpStream, RpcCodec>, Message>;
type FrameStream = SplitStream<Framed<TcpStream, RpcCodec>>;

/// Table of requests waiting on pooled connections.
pub type ConnectionTable = PendingTable<Arc<Connection>>;

/// A connection to one server address.
///
/// A connection is either checked out (busy) or idle in its pool. Requests
/// are correlated by id, so sharing a connection is safe; the busy flag only
/// steers reuse.
pub struct Connection {
    id: u64,
    addr: SocketAddr,
    sink: tokio::sync::Mutex<FrameSink>,
    /// Ids whose frame is being written but not yet registered.
    writing: Mutex<HashSet<u32>>,
    written: Notify,
    /// Ids written on this connection and not yet answered.
    outstanding: Mutex<HashSet<u32>>,
    busy: AtomicBool,
    last_active: Mutex<Instant>,
    closed: CancellationToken,
}

impl Connection {
    /// Dial `addr` and start dispatching its responses into `table`.
    ///
    /// The new connection starts checked out.
    #[instrument(skip(codec, table, shutdown))]
    pub(crate) async fn connect(
        id: u64,
        addr: SocketAddr,
        codec: RpcCodec,
        connect_timeout: Duration,
        table: Arc<ConnectionTable>,
        shutdown: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout(addr))?
            .map_err(|source| Error::Connect { addr, source })?;
        stream
            .set_nodelay(true)
            .map_err(|source| Error::Connect { addr, source })?;

        let (sink, stream) = Framed::new(stream, codec).split();

        let conn = Arc::new(Self {
            id,
            addr,
            sink: tokio::sync::Mutex::new(sink),
            writing: Mutex::new(HashSet::new()),
            written: Notify::new(),
            outstanding: Mutex::new(HashSet::new()),
            busy: AtomicBool::new(true),
            last_active: Mutex::new(Instant::now()),
            closed: shutdown.child_token(),
        });

        tokio::spawn(Self::read_loop(Arc::clone(&conn), stream, table));

        debug!(id, %addr, "opened connection");
        Ok(conn)
    }

    /// Connection id, unique within the pool.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Remote address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests written and not yet answered.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Whether the connection is checked out.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Time since the last write or received frame.
    #[must_use]
    pub fn quiet_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Check the connection out if it is idle and open.
    pub(crate) fn try_checkout(&self) -> bool {
        !self.is_closed()
            && self
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Return the connection to the idle set.
    pub fn release(&self) {
        if !self.is_closed() {
            self.busy.store(false, Ordering::Release);
        }
    }

    /// Close the connection. Its reader fails every request it carried.
    pub fn close(&self) {
        self.busy.store(false, Ordering::Release);
        self.closed.cancel();
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Write a request and register it in `table` once the write succeeded.
    ///
    /// Registration happens only after the frame is fully written. A response
    /// that races ahead of the registration is held back by the reader until
    /// the write completes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the frame could not be encoded or
    /// written, or [`Error::Timeout`] if the write did not finish within
    /// `write_timeout`. Nothing is registered in either case.
    pub async fn send_request(
        self: &Arc<Self>,
        table: &ConnectionTable,
        message: Message,
        write_timeout: Duration,
    ) -> Result<oneshot::Receiver<Response>> {
        let request_id = message.request_id;
        let mut writing = WriteGuard::new(self, request_id);

        let sent = timeout(write_timeout, async {
            let mut sink = self.sink.lock().await;
            writing.started = true;
            sink.send(message).await
        })
        .await;
        self.touch();
        writing.finished = true;

        match sent {
            Ok(Ok(())) => {
                self.outstanding.lock().insert(request_id);
                Ok(table.insert(request_id, Arc::clone(self)))
            }
            Ok(Err(e)) => {
                if matches!(e, srpc_protocol::Error::Io(_)) {
                    warn!(id = self.id, addr = %self.addr, error = %e, "write failed, closing connection");
                    self.close();
                } else {
                    self.release();
                }
                Err(Error::Transport(e))
            }
            Err(_) => {
                if writing.started {
                    warn!(id = self.id, addr = %self.addr, ?write_timeout, "write stalled, closing connection");
                    self.close();
                } else {
                    self.release();
                }
                Err(Error::Timeout(write_timeout))
            }
        }
    }

    /// Write a heartbeat probe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the probe could not be written, or
    /// [`Error::Timeout`] if the write did not finish within `write_timeout`.
    pub async fn send_heartbeat(&self, probe_id: u32, write_timeout: Duration) -> Result<()> {
        timeout(write_timeout, async {
            self.sink
                .lock()
                .await
                .send(Message::heartbeat(probe_id))
                .await
        })
        .await
        .map_err(|_| Error::Timeout(write_timeout))??;
        Ok(())
    }

    /// Wait until no write for `request_id` is between send and registration.
    async fn await_registration(&self, request_id: u32) {
        loop {
            let written = self.written.notified();
            if !self.writing.lock().contains(&request_id) {
                return;
            }
            written.await;
        }
    }

    async fn on_response(&self, table: &ConnectionTable, request_id: u32, response: Response) {
        self.await_registration(request_id).await;

        let remaining = {
            let mut outstanding = self.outstanding.lock();
            if !outstanding.remove(&request_id) {
                debug!(id = self.id, request_id, "dropping response to a request not sent here");
                return;
            }
            outstanding.len()
        };

        // Idle again before the caller wakes, so its next call can reuse us.
        if remaining == 0 {
            self.release();
        }

        if table.complete(request_id, response).is_none() {
            debug!(
                id = self.id,
                request_id, remaining, "dropping late response"
            );
        }
    }

    async fn read_loop(conn: Arc<Self>, mut stream: FrameStream, table: Arc<ConnectionTable>) {
        loop {
            let inbound = tokio::select! {
                () = conn.closed.cancelled() => break,
                inbound = stream.next() => inbound,
            };

            match inbound {
                Some(Ok(Ok(message))) => {
                    conn.touch();
                    match (message.message_type, message.payload) {
                        (MessageType::Response, Payload::Response(response)) => {
                            conn.on_response(&table, message.request_id, response)
                                .await;
                        }
                        (MessageType::HeartbeatResponse, _) => {
                            trace!(id = conn.id, probe = message.request_id, "heartbeat answered");
                        }
                        (other, _) => {
                            debug!(id = conn.id, message_type = %other, "ignoring unexpected frame");
                        }
                    }
                }
                Some(Ok(Err(frame_error))) => {
                    conn.touch();
                    let request_id = frame_error.header.request_id;
                    warn!(id = conn.id, request_id, error = %frame_error, "undecodable response");
                    let response = Response::err(
                        request_id,
                        RemoteError::new(RemoteErrorKind::BadRequest, frame_error.to_string()),
                    );
                    conn.on_response(&table, request_id, response).await;
                }
                Some(Err(e)) => {
                    warn!(id = conn.id, addr = %conn.addr, error = %e, "protocol error, closing connection");
                    break;
                }
                None => {
                    debug!(id = conn.id, addr = %conn.addr, "connection closed by peer");
                    break;
                }
            }
        }

        conn.close();
        let failed = table.remove_owned_by(|owner| Arc::ptr_eq(owner, &conn));
        if failed > 0 {
            debug!(id = conn.id, failed, "failed requests of closed connection");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("in_flight", &self.in_flight())
            .field("busy", &self.is_busy())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Marks a request id as being written for as long as it lives.
///
/// If the caller gives up before the write finished, a connection that never
/// started writing goes back to the idle set and one that did is closed.
struct WriteGuard<'a> {
    conn: &'a Connection,
    request_id: u32,
    started: bool,
    finished: bool,
}

impl<'a> WriteGuard<'a> {
    fn new(conn: &'a Connection, request_id: u32) -> Self {
        conn.writing.lock().insert(request_id);
        Self {
            conn,
            request_id,
            started: false,
            finished: false,
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if self.started {
                debug!(id = self.conn.id, request_id = self.request_id, "write abandoned, closing connection");
                self.conn.close();
            } else {
                self.conn.release();
            }
        }
        self.conn.writing.lock().remove(&self.request_id);
        self.conn.written.notify_waiters();
    }
}
