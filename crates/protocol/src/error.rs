//! Error types for the wire protocol.

use crate::framing::FrameHeader;

use std::io;
use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for encoding and decoding frames.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol-integrity violation. The connection must be aborted.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Payload could not be encoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error leaves the byte stream in an unknown state.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Io(_))
    }
}

/// Protocol-integrity errors. Any of these is connection-fatal.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame does not start with the expected magic number.
    #[error("Unknown magic number: {0:02x?}")]
    BadMagic([u8; 4]),

    /// The frame was produced by an incompatible protocol version.
    #[error("Incompatible version: expected {expected}, got {actual}")]
    IncompatibleVersion {
        /// Version this build speaks.
        expected: u8,
        /// Version found in the frame.
        actual: u8,
    },

    /// Declared frame length exceeds the configured maximum.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Declared frame length is smaller than the fixed header.
    #[error("Frame size {0} is smaller than the header")]
    FrameTooShort(usize),
}

/// Errors raised while turning a payload into body bytes or back.
///
/// These are scoped to a single frame: the byte stream stays aligned on frame
/// boundaries, so subsequent frames decode normally.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// No serializer is registered under this id.
    #[error("Unknown serializer id: {0}")]
    UnknownSerializer(u8),

    /// No compressor is registered under this id.
    #[error("Unknown compressor id: {0}")]
    UnknownCompressor(u8),

    /// Compressor id 0 means "off" and cannot be registered.
    #[error("Compressor id 0 is reserved")]
    ReservedCompressorId,

    /// Message type byte is not one of the known types.
    #[error("Unknown message type: {0:#x}")]
    UnknownMessageType(u8),

    /// The payload variant does not fit the message type.
    #[error("Payload does not match message type {0}")]
    PayloadMismatch(String),

    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// Compression failed.
    #[error("Failed to compress: {0}")]
    CompressionFailed(String),

    /// Decompression failed.
    #[error("Failed to decompress: {0}")]
    DecompressionFailed(String),

    /// Decompressed body would exceed the frame limit.
    #[error("Decompressed body exceeds {max} bytes")]
    DecompressedTooLarge {
        /// Limit that was hit.
        max: usize,
    },
}

/// A complete, correctly delimited frame whose body could not be decoded.
///
/// Carries the parsed header so the receiver can still answer the request id.
#[derive(Debug, Clone, Error)]
#[error("Undecodable frame: {source}")]
pub struct FrameError {
    /// Header of the offending frame.
    pub header: FrameHeader,
    /// What went wrong with the body.
    #[source]
    pub source: CodecError,
}
