//! Per-message server pipeline: heartbeats, filters, then invocation.

use crate::filter::{Call, FilterChain};
use crate::invoker::Invoker;
use crate::service::ServiceRegistry;

use srpc_protocol::{
    COMPRESSOR_OFF, CodecRegistry, FrameError, Message, MessageType, Payload, RemoteError,
    RemoteErrorKind, Request, Response, SERIALIZER_CBOR,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of [`Pipeline::admit`].
#[derive(Debug)]
pub enum Admission {
    /// Write this reply as is.
    Reply(Message),
    /// Run this request on a worker, then write its reply.
    Invoke(Invocation),
    /// Nothing to write.
    Ignore,
}

/// A request that passed the filter chain.
#[derive(Debug)]
pub struct Invocation {
    message: Message,
    request: Request,
    invoker: Invoker,
}

impl Invocation {
    /// Request id of the admitted request.
    #[must_use]
    pub const fn request_id(&self) -> u32 {
        self.message.request_id
    }

    /// Call the target method and build the reply.
    pub async fn run(self) -> Message {
        let request_id = self.message.request_id;
        let response = match self.invoker.invoke(self.request).await {
            Ok(value) => Response::ok(request_id, value),
            Err(error) => Response::err(request_id, error),
        };
        self.message.reply(response)
    }
}

/// Turns decoded inbound messages into the replies to write back.
#[derive(Debug, Clone)]
pub struct Pipeline {
    filters: FilterChain,
    invoker: Invoker,
    codecs: Arc<CodecRegistry>,
}

impl Pipeline {
    /// Build a pipeline over a filter chain and the services it guards.
    #[must_use]
    pub fn new(
        filters: FilterChain,
        services: Arc<ServiceRegistry>,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            filters,
            invoker: Invoker::new(services),
            codecs,
        }
    }

    /// Filters this pipeline runs, in order.
    #[must_use]
    pub const fn filters(&self) -> &FilterChain {
        &self.filters
    }

    /// Decide what to do with one message from `peer`, without invoking
    /// anything.
    ///
    /// Heartbeat probes are answered without running filters. Requests run
    /// through the filter chain; a denied or faulted request is answered
    /// here, an admitted one comes back as an [`Invocation`]. Other message
    /// types get no reply.
    #[must_use]
    pub fn admit(&self, peer: SocketAddr, mut message: Message) -> Admission {
        match message.message_type {
            MessageType::HeartbeatRequest => Admission::Reply(message.heartbeat_reply()),
            MessageType::Request => {
                let request_id = message.request_id;
                let Payload::Request(request) =
                    std::mem::replace(&mut message.payload, Payload::Empty)
                else {
                    let error = RemoteError::new(RemoteErrorKind::BadRequest, "request has no body");
                    return Admission::Reply(message.reply(Response::err(request_id, error)));
                };

                let call = Call {
                    peer,
                    request_id,
                    request: &request,
                };
                if let Err(error) = self.filters.run(&call) {
                    return Admission::Reply(message.reply(Response::err(request_id, error)));
                }

                Admission::Invoke(Invocation {
                    message,
                    request,
                    invoker: self.invoker.clone(),
                })
            }
            other => {
                debug!(%peer, message_type = %other, "ignoring unexpected message");
                Admission::Ignore
            }
        }
    }

    /// Handle one message from `peer` through to its reply.
    ///
    /// Every outcome of a request, failures included, becomes a response
    /// echoing the request's id, serializer and compressor.
    pub async fn dispatch(&self, peer: SocketAddr, message: Message) -> Option<Message> {
        match self.admit(peer, message) {
            Admission::Reply(reply) => Some(reply),
            Admission::Invoke(invocation) => Some(invocation.run().await),
            Admission::Ignore => None,
        }
    }

    /// Answer a request whose body could not be decoded.
    ///
    /// The reply echoes the request id. Serializer and compressor are echoed
    /// when this side understands them and fall back to CBOR without
    /// compression otherwise. Frames that were not requests get no reply.
    #[must_use]
    pub fn reject(&self, peer: SocketAddr, frame_error: &FrameError) -> Option<Message> {
        let header = frame_error.header;
        warn!(%peer, request_id = header.request_id, error = %frame_error, "undecodable frame");

        if header.message_type != MessageType::Request as u8 {
            return None;
        }

        let serializer_id = if self.codecs.serializer(header.serializer_id).is_ok() {
            header.serializer_id
        } else {
            SERIALIZER_CBOR
        };
        let compressor_id = if self.codecs.compressor(header.compressor_id).is_ok() {
            header.compressor_id
        } else {
            COMPRESSOR_OFF
        };

        let error = RemoteError::new(RemoteErrorKind::BadRequest, frame_error.source.to_string());
        Some(Message {
            message_type: MessageType::Response,
            serializer_id,
            compressor_id,
            request_id: header.request_id,
            payload: Payload::Response(Response::err(header.request_id, error)),
        })
    }
}
