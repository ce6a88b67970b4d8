//! Built-in serializers.

use super::Serializer;
use crate::error::CodecError;
use crate::message::{MessageType, Payload};

/// CBOR serializer backed by `ciborium`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborSerializer;

impl Serializer for CborSerializer {
    fn name(&self) -> &'static str {
        "cbor"
    }

    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        let result = match payload {
            Payload::Empty => return Ok(buf),
            Payload::Request(request) => ciborium::ser::into_writer(request, &mut buf),
            Payload::Response(response) => ciborium::ser::into_writer(response, &mut buf),
        };
        result.map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
        Ok(buf)
    }

    fn deserialize(&self, message_type: MessageType, bytes: &[u8]) -> Result<Payload, CodecError> {
        match message_type {
            MessageType::Request => ciborium::de::from_reader(bytes)
                .map(Payload::Request)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string())),
            MessageType::Response => ciborium::de::from_reader(bytes)
                .map(Payload::Response)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string())),
            MessageType::HeartbeatRequest | MessageType::HeartbeatResponse => Ok(Payload::Empty),
        }
    }
}

/// JSON serializer backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        let result = match payload {
            Payload::Empty => return Ok(Vec::new()),
            Payload::Request(request) => serde_json::to_vec(request),
            Payload::Response(response) => serde_json::to_vec(response),
        };
        result.map_err(|e| CodecError::SerializationFailed(e.to_string()))
    }

    fn deserialize(&self, message_type: MessageType, bytes: &[u8]) -> Result<Payload, CodecError> {
        let result = match message_type {
            MessageType::Request => serde_json::from_slice(bytes).map(Payload::Request),
            MessageType::Response => serde_json::from_slice(bytes).map(Payload::Response),
            MessageType::HeartbeatRequest | MessageType::HeartbeatResponse => {
                return Ok(Payload::Empty);
            }
        };
        result.map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }
}
