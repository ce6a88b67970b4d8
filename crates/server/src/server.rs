//! RPC server implementation.

use crate::config::ServerConfig;
use crate::dispatch::{Admission, Pipeline};
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterChain, TrafficControlFilter};
use crate::service::ServiceRegistry;

use futures::{SinkExt, StreamExt};
use srpc_protocol::{CodecRegistry, Message, MessageType, Payload, RemoteError, RemoteErrorKind, Response, RpcCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// Replies buffered per connection before invocations wait on the writer.
const REPLY_QUEUE: usize = 128;

/// RPC server that listens for incoming connections.
pub struct RpcServer {
    config: ServerConfig,
    services: ServiceRegistry,
    filters: Vec<Arc<dyn Filter>>,
    codecs: CodecRegistry,
}

impl RpcServer {
    /// Create a server for `services`.
    #[must_use]
    pub fn new(config: ServerConfig, services: ServiceRegistry) -> Self {
        Self {
            config,
            services,
            filters: Vec::new(),
            codecs: CodecRegistry::new(),
        }
    }

    /// Append a filter. Filters run in the order they are added, after the
    /// built-in traffic-control filter.
    #[must_use]
    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Replace the serializer and compressor registry.
    #[must_use]
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Bind the listener and start accepting connections in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the address
    /// cannot be bound.
    #[instrument(skip(self), fields(addr = %self.config.bind_addr))]
    pub async fn bind(self) -> Result<ServerHandle> {
        self.config.validate()?;

        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let mut chain = FilterChain::new();
        let traffic_control = if self.config.traffic_control.enabled {
            let filter = Arc::new(TrafficControlFilter::new(
                self.config.traffic_control.permits_per_second,
            )?);
            chain.push(Arc::clone(&filter) as Arc<dyn Filter>);
            Some(filter)
        } else {
            None
        };
        for filter in self.filters {
            chain.push(filter);
        }

        let codecs = Arc::new(self.codecs);
        let pipeline = Arc::new(Pipeline::new(
            chain,
            Arc::new(self.services),
            Arc::clone(&codecs),
        ));
        let codec = RpcCodec::new(codecs).with_max_frame_len(self.config.max_frame_len);
        let workers = Arc::new(Semaphore::new(self.config.max_concurrent_invocations));
        let shutdown = CancellationToken::new();

        info!(%local_addr, filters = ?pipeline.filters(), "RPC server listening");

        let task = tokio::spawn(accept_loop(
            listener,
            pipeline,
            codec,
            workers,
            shutdown.clone(),
        ));

        Ok(ServerHandle {
            local_addr,
            shutdown,
            task: Some(task),
            traffic_control,
        })
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("config", &self.config)
            .field("services", &self.services.len())
            .field("filters", &self.filters.len())
            .finish_non_exhaustive()
    }
}

/// Handle to a running server. Dropping it stops the server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    traffic_control: Option<Arc<TrafficControlFilter>>,
}

impl ServerHandle {
    /// Address the server is listening on.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The built-in traffic-control filter, if enabled.
    #[must_use]
    pub const fn traffic_control(&self) -> Option<&Arc<TrafficControlFilter>> {
        self.traffic_control.as_ref()
    }

    /// Change the admission rate of the traffic-control filter.
    ///
    /// # Errors
    ///
    /// Returns an error if traffic control is disabled or the rate is not
    /// positive.
    pub fn set_rate(&self, permits_per_second: f64) -> Result<()> {
        self.traffic_control
            .as_ref()
            .ok_or(Error::TrafficControlDisabled)?
            .set_rate(permits_per_second)?;
        Ok(())
    }

    /// Stop accepting connections, close open ones and wait for the accept
    /// loop to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "accept loop failed");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    codec: RpcCodec,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        tokio::spawn(serve_connection(
                            stream,
                            peer,
                            Arc::clone(&pipeline),
                            codec.clone(),
                            Arc::clone(&workers),
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
            () = shutdown.cancelled() => {
                info!("server shutdown requested");
                break;
            }
        }
    }
}

/// Read frames from one connection and dispatch them.
///
/// Heartbeats and filter decisions are answered by the reader itself.
/// Admitted requests run as separate tasks that wait for a `workers` permit,
/// so neither a slow method nor a saturated worker pool stalls the reader.
/// Replies funnel through a single writer task.
/// Only a protocol error, server shutdown or the peer going away ends the
/// connection. When the peer stops sending, replies still owed are written
/// before the socket closes; the other two close it at once.
#[instrument(skip_all, fields(%peer))]
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<Pipeline>,
    codec: RpcCodec,
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    debug!("connection opened");

    let (sink, mut frames) = Framed::new(stream, codec).split();
    let (replies, queue) = mpsc::channel(REPLY_QUEUE);
    let closed = shutdown.child_token();
    let writer = tokio::spawn(write_replies(sink, queue, closed.clone()));

    loop {
        let inbound = tokio::select! {
            () = shutdown.cancelled() => break,
            inbound = frames.next() => inbound,
        };

        match inbound {
            Some(Ok(Ok(message))) => match pipeline.admit(peer, message) {
                Admission::Reply(reply) => {
                    if replies.send(reply).await.is_err() {
                        break;
                    }
                }
                Admission::Invoke(invocation) => {
                    let workers = Arc::clone(&workers);
                    let replies = replies.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let permit = tokio::select! {
                            () = shutdown.cancelled() => return,
                            permit = workers.acquire_owned() => permit,
                        };
                        let Ok(permit) = permit else { return };

                        trace!(request_id = invocation.request_id(), "invoking");
                        let reply = invocation.run().await;
                        drop(permit);
                        // The writer is gone only if the connection is.
                        let _ = replies.send(reply).await;
                    });
                }
                Admission::Ignore => {}
            },
            Some(Ok(Err(frame_error))) => {
                if let Some(reply) = pipeline.reject(peer, &frame_error) {
                    if replies.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "protocol error, closing connection");
                closed.cancel();
                break;
            }
            None => {
                debug!("connection closed by peer");
                break;
            }
        }
    }

    drop(replies);
    if let Err(e) = writer.await {
        error!(error = %e, "reply writer failed");
    }
    debug!("connection closed");
}

async fn write_replies(
    mut sink: futures::stream::SplitSink<Framed<TcpStream, RpcCodec>, Message>,
    mut queue: mpsc::Receiver<Message>,
    closed: CancellationToken,
) {
    loop {
        let reply = tokio::select! {
            () = closed.cancelled() => break,
            reply = queue.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
        };

        let (request_id, serializer_id, compressor_id) =
            (reply.request_id, reply.serializer_id, reply.compressor_id);
        let is_response = reply.message_type == MessageType::Response;

        match sink.send(reply).await {
            Ok(()) => {}
            Err(srpc_protocol::Error::Io(e)) => {
                debug!(error = %e, "write failed");
                break;
            }
            // Nothing was written, so the stream is still aligned.
            Err(e) if is_response => {
                warn!(request_id, error = %e, "reply could not be encoded");
                let fallback = Message {
                    message_type: MessageType::Response,
                    serializer_id,
                    compressor_id,
                    request_id,
                    payload: Payload::Response(Response::err(
                        request_id,
                        RemoteError::new(
                            RemoteErrorKind::Invocation,
                            format!("result could not be encoded: {e}"),
                        ),
                    )),
                };
                if sink.send(fallback).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(request_id, error = %e, "failed to write frame");
                break;
            }
        }
    }
}
