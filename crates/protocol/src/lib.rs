//! Wire protocol for the srpc runtime.
//!
//! A frame is a fixed 16-byte big-endian header followed by an optional body:
//!
//! ```text
//! [0-3 magic][4 version][5-8 full_length][9 type][10 serializer][11 compressor][12-15 request_id][16.. body]
//! ```
//!
//! The body is the request or response payload, serialized by the serializer
//! named in the header and optionally compressed. Heartbeat frames carry no
//! body. [`RpcCodec`] performs length-delimited extraction, validation and
//! payload decoding in one pass, so it can be plugged straight into a
//! [`tokio_util::codec::Framed`] transport.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod error;
pub mod framing;
pub mod message;

pub use codec::{
    COMPRESSOR_GZIP, COMPRESSOR_OFF, CborSerializer, CodecRegistry, Compressor, GzipCompressor,
    JsonSerializer, SERIALIZER_CBOR, SERIALIZER_JSON, Serializer,
};
pub use error::{CodecError, Error, FrameError, ProtocolError, Result};
pub use framing::{
    DEFAULT_MAX_FRAME_LEN, FrameHeader, HEADER_LEN, Inbound, MAGIC, RpcCodec, VERSION,
};
pub use message::{
    Message, MessageType, Payload, RemoteError, RemoteErrorKind, Request, Response,
};

// Argument and result values travel as self-describing JSON-model values.
pub use serde_json::Value;
