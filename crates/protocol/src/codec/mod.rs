//! Pluggable body codecs.
//!
//! Serializers and compressors are looked up by the small integer carried in
//! the frame header. The table is assembled once at startup and shared
//! read-only afterwards.

mod compressor;
mod serializer;

pub use compressor::GzipCompressor;
pub use serializer::{CborSerializer, JsonSerializer};

use crate::error::CodecError;
use crate::message::{MessageType, Payload};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Compressor id meaning "no compression".
pub const COMPRESSOR_OFF: u8 = 0;

/// Compressor id of the built-in gzip compressor.
pub const COMPRESSOR_GZIP: u8 = 1;

/// Serializer id of the built-in CBOR serializer.
pub const SERIALIZER_CBOR: u8 = 1;

/// Serializer id of the built-in JSON serializer.
pub const SERIALIZER_JSON: u8 = 2;

/// Turns payloads into body bytes and back.
pub trait Serializer: Send + Sync + 'static {
    /// Registered name, used in configuration.
    fn name(&self) -> &'static str;

    /// Serialize a request or response payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, CodecError>;

    /// Deserialize a body according to the message type.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid payload for the type.
    fn deserialize(&self, message_type: MessageType, bytes: &[u8]) -> Result<Payload, CodecError>;
}

/// Compresses body bytes.
pub trait Compressor: Send + Sync + 'static {
    /// Registered name, used in configuration.
    fn name(&self) -> &'static str;

    /// Compress a body.
    ///
    /// # Errors
    ///
    /// Returns an error if compression fails.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decompress a body, producing at most `limit` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is corrupt or inflates past `limit`.
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError>;
}

/// Registry of serializers and compressors keyed by wire id.
#[derive(Clone)]
pub struct CodecRegistry {
    serializers: HashMap<u8, Arc<dyn Serializer>>,
    compressors: HashMap<u8, Arc<dyn Compressor>>,
}

impl CodecRegistry {
    /// An empty registry. Compressor id 0 ("off") is always understood.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            serializers: HashMap::new(),
            compressors: HashMap::new(),
        }
    }

    /// Registry with the built-in CBOR, JSON and gzip codecs.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_serializer(SERIALIZER_CBOR, Arc::new(CborSerializer));
        registry.register_serializer(SERIALIZER_JSON, Arc::new(JsonSerializer));
        registry.compressors.insert(COMPRESSOR_GZIP, Arc::new(GzipCompressor));
        registry
    }

    /// Register a serializer, replacing any previous one with the same id.
    pub fn register_serializer(&mut self, id: u8, serializer: Arc<dyn Serializer>) {
        self.serializers.insert(id, serializer);
    }

    /// Register a compressor.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is [`COMPRESSOR_OFF`].
    pub fn register_compressor(
        &mut self,
        id: u8,
        compressor: Arc<dyn Compressor>,
    ) -> Result<(), CodecError> {
        if id == COMPRESSOR_OFF {
            return Err(CodecError::ReservedCompressorId);
        }
        self.compressors.insert(id, compressor);
        Ok(())
    }

    /// Look up a serializer by id.
    ///
    /// # Errors
    ///
    /// Returns an error if no serializer is registered under `id`.
    pub fn serializer(&self, id: u8) -> Result<&dyn Serializer, CodecError> {
        self.serializers
            .get(&id)
            .map(|s| s.as_ref())
            .ok_or(CodecError::UnknownSerializer(id))
    }

    /// Look up a compressor by id. Id 0 yields `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if no compressor is registered under a non-zero `id`.
    pub fn compressor(&self, id: u8) -> Result<Option<&dyn Compressor>, CodecError> {
        if id == COMPRESSOR_OFF {
            return Ok(None);
        }
        self.compressors
            .get(&id)
            .map(|c| Some(c.as_ref()))
            .ok_or(CodecError::UnknownCompressor(id))
    }

    /// Resolve a serializer name to its id.
    #[must_use]
    pub fn serializer_id(&self, name: &str) -> Option<u8> {
        self.serializers
            .iter()
            .find(|(_, s)| s.name() == name)
            .map(|(id, _)| *id)
    }

    /// Resolve a compressor name to its id. `"off"` and `"none"` map to 0.
    #[must_use]
    pub fn compressor_id(&self, name: &str) -> Option<u8> {
        if name == "off" || name == "none" {
            return Some(COMPRESSOR_OFF);
        }
        self.compressors
            .iter()
            .find(|(_, c)| c.name() == name)
            .map(|(id, _)| *id)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut serializers: Vec<_> = self
            .serializers
            .iter()
            .map(|(id, s)| (*id, s.name()))
            .collect();
        serializers.sort_unstable();
        let mut compressors: Vec<_> = self
            .compressors
            .iter()
            .map(|(id, c)| (*id, c.name()))
            .collect();
        compressors.sort_unstable();
        f.debug_struct("CodecRegistry")
            .field("serializers", &serializers)
            .field("compressors", &compressors)
            .finish()
    }
}
