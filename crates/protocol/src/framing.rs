//! Message framing for the wire protocol.

use crate::codec::CodecRegistry;
use crate::error::{CodecError, Error, FrameError, ProtocolError, Result};
use crate::message::{Message, MessageType, Payload};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Magic number opening every frame.
pub const MAGIC: [u8; 4] = *b"srpc";

/// Protocol version this build speaks.
pub const VERSION: u8 = 1;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 16;

/// Maximum frame size (4MB by default).
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const LENGTH_OFFSET: usize = 5;

/// Result of decoding one complete frame.
///
/// The outer decoder error is connection-fatal; this inner error only affects
/// the frame it describes.
pub type Inbound = std::result::Result<Message, FrameError>;

/// Header fields after magic and version have been validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length, header included.
    pub full_length: usize,
    /// Raw message type byte.
    pub message_type: u8,
    /// Serializer id.
    pub serializer_id: u8,
    /// Compressor id.
    pub compressor_id: u8,
    /// Request id.
    pub request_id: u32,
}

impl FrameHeader {
    /// Parse and validate a header.
    ///
    /// # Errors
    ///
    /// Returns an error on bad magic, incompatible version, or a declared
    /// length outside `HEADER_LEN..=max_frame_len`.
    pub fn parse(mut header: &[u8], max_frame_len: usize) -> std::result::Result<Self, ProtocolError> {
        check_prefix(header)?;
        header.advance(LENGTH_OFFSET);

        let full_length = header.get_u32() as usize;
        if full_length > max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                size: full_length,
                max: max_frame_len,
            });
        }
        if full_length < HEADER_LEN {
            return Err(ProtocolError::FrameTooShort(full_length));
        }

        Ok(Self {
            full_length,
            message_type: header.get_u8(),
            serializer_id: header.get_u8(),
            compressor_id: header.get_u8(),
            request_id: header.get_u32(),
        })
    }

    /// Length of the body following the header.
    #[must_use]
    pub const fn body_len(&self) -> usize {
        self.full_length - HEADER_LEN
    }
}

/// Validate whatever part of magic and version is already buffered.
fn check_prefix(buf: &[u8]) -> std::result::Result<(), ProtocolError> {
    let seen = buf.len().min(MAGIC.len());
    if buf[..seen] != MAGIC[..seen] {
        let mut magic = [0u8; 4];
        magic[..seen].copy_from_slice(&buf[..seen]);
        return Err(ProtocolError::BadMagic(magic));
    }
    if let Some(&version) = buf.get(MAGIC.len()) {
        if version != VERSION {
            return Err(ProtocolError::IncompatibleVersion {
                expected: VERSION,
                actual: version,
            });
        }
    }
    Ok(())
}

/// Codec turning [`Message`]s into frames and back.
///
/// Decoding buffers until a whole frame is available and never decodes a
/// partial one. Oversized frames are rejected from the header alone, before
/// any space for the body is reserved.
#[derive(Debug, Clone)]
pub struct RpcCodec {
    codecs: Arc<CodecRegistry>,
    max_frame_len: usize,
}

impl RpcCodec {
    /// Create a codec using the given serializer/compressor registry.
    #[must_use]
    pub const fn new(codecs: Arc<CodecRegistry>) -> Self {
        Self {
            codecs,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Configured max frame size.
    #[must_use]
    pub const fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn encode_body(&self, message: &Message) -> std::result::Result<Vec<u8>, CodecError> {
        let matches = matches!(
            (message.message_type, &message.payload),
            (MessageType::Request, Payload::Request(_))
                | (MessageType::Response, Payload::Response(_))
                | (
                    MessageType::HeartbeatRequest | MessageType::HeartbeatResponse,
                    Payload::Empty
                )
        );
        if !matches {
            return Err(CodecError::PayloadMismatch(message.message_type.to_string()));
        }
        if message.message_type.is_heartbeat() {
            return Ok(Vec::new());
        }

        let body = self
            .codecs
            .serializer(message.serializer_id)?
            .serialize(&message.payload)?;

        match self.codecs.compressor(message.compressor_id)? {
            Some(compressor) => {
                let compressed = compressor.compress(&body)?;
                trace!(
                    compressor = compressor.name(),
                    before = body.len(),
                    after = compressed.len(),
                    "compressed body"
                );
                Ok(compressed)
            }
            None => Ok(body),
        }
    }

    fn decode_body(
        &self,
        header: &FrameHeader,
        body: &[u8],
    ) -> std::result::Result<Message, CodecError> {
        let message_type = MessageType::try_from(header.message_type)?;

        let payload = if message_type.is_heartbeat() {
            Payload::Empty
        } else {
            let body = match self.codecs.compressor(header.compressor_id)? {
                Some(compressor) => Cow::Owned(compressor.decompress(body, self.max_frame_len)?),
                None => Cow::Borrowed(body),
            };
            self.codecs
                .serializer(header.serializer_id)?
                .deserialize(message_type, &body)?
        };

        Ok(Message {
            message_type,
            serializer_id: header.serializer_id,
            compressor_id: header.compressor_id,
            request_id: header.request_id,
            payload,
        })
    }
}

impl Decoder for RpcCodec {
    type Item = Inbound;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Fail fast on garbage before the header is complete.
        check_prefix(&buf[..])?;

        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = FrameHeader::parse(&buf[..HEADER_LEN], self.max_frame_len)?;

        // Check if we have the full frame
        if buf.len() < header.full_length {
            buf.reserve(header.full_length - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(header.full_length);
        frame.advance(HEADER_LEN);
        let body: Bytes = frame.freeze();

        Ok(Some(
            self.decode_body(&header, &body)
                .map_err(|source| FrameError { header, source }),
        ))
    }
}

impl Encoder<Message> for RpcCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<()> {
        let body = self.encode_body(&message)?;

        let full_length = HEADER_LEN + body.len();
        if full_length > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                size: full_length,
                max: self.max_frame_len,
            }
            .into());
        }

        let start = buf.len();
        buf.reserve(full_length);

        // Write header with a placeholder length
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u32(0);
        buf.put_u8(message.message_type as u8);
        buf.put_u8(message.serializer_id);
        buf.put_u8(message.compressor_id);
        buf.put_u32(message.request_id);

        // Write body
        buf.put_slice(&body);

        // Backpatch the full length
        #[allow(clippy::cast_possible_truncation)]
        let written = (buf.len() - start) as u32;
        let length_at = start + LENGTH_OFFSET;
        buf[length_at..length_at + 4].copy_from_slice(&written.to_be_bytes());

        Ok(())
    }
}
