//! Protocol messages and their payloads.

use crate::codec::{COMPRESSOR_OFF, SERIALIZER_CBOR};
use crate::error::CodecError;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Type of a protocol message, as carried in header byte 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Method invocation request.
    Request = 1,
    /// Reply to a request.
    Response = 2,
    /// Liveness probe.
    HeartbeatRequest = 3,
    /// Reply to a liveness probe.
    HeartbeatResponse = 4,
}

impl MessageType {
    /// Heartbeat types never carry a body.
    #[must_use]
    pub const fn is_heartbeat(self) -> bool {
        matches!(self, Self::HeartbeatRequest | Self::HeartbeatResponse)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            3 => Ok(Self::HeartbeatRequest),
            4 => Ok(Self::HeartbeatResponse),
            _ => Err(CodecError::UnknownMessageType(value)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "REQUEST",
            Self::Response => "RESPONSE",
            Self::HeartbeatRequest => "HEARTBEAT_REQUEST",
            Self::HeartbeatResponse => "HEARTBEAT_RESPONSE",
        };
        f.write_str(name)
    }
}

/// A method invocation on a remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Target service identifier.
    pub service: String,
    /// Method name on the service.
    pub method: String,
    /// Ordered parameter-type descriptors.
    pub param_types: Vec<String>,
    /// Ordered argument values.
    pub args: Vec<Value>,
}

impl Request {
    /// Create a request with no arguments.
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            param_types: Vec::new(),
            args: Vec::new(),
        }
    }

    /// Append an argument together with its type descriptor.
    #[must_use]
    pub fn arg(mut self, param_type: impl Into<String>, value: impl Into<Value>) -> Self {
        self.param_types.push(param_type.into());
        self.args.push(value.into());
        self
    }
}

/// Category of a failure reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// A filter denied the request.
    Filtered,
    /// A filter raised a fault while deciding.
    FilterFault,
    /// No implementation is registered for the service.
    ServiceNotFound,
    /// The service has no method with that name and signature.
    MethodNotFound,
    /// The invoked method failed.
    Invocation,
    /// The request body could not be decoded.
    BadRequest,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Filtered => "filtered",
            Self::FilterFault => "filter fault",
            Self::ServiceNotFound => "service not found",
            Self::MethodNotFound => "method not found",
            Self::Invocation => "invocation failed",
            Self::BadRequest => "bad request",
        };
        f.write_str(name)
    }
}

/// Error information carried in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Error category.
    pub kind: RemoteErrorKind,
    /// Human-readable error message.
    pub message: String,
    /// Name of the filter involved, for filter outcomes.
    pub filter: Option<String>,
}

impl RemoteError {
    /// Create an error of the given kind.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            filter: None,
        }
    }

    /// The request was denied by the named filter.
    pub fn filtered(filter: impl Into<String>) -> Self {
        let filter = filter.into();
        Self {
            kind: RemoteErrorKind::Filtered,
            message: format!("denied by filter '{filter}'"),
            filter: Some(filter),
        }
    }

    /// The named filter raised a fault.
    pub fn filter_fault(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::FilterFault,
            message: message.into(),
            filter: Some(filter.into()),
        }
    }
}

/// Outcome of a request: a result or an error, never both.
///
/// A unit result is carried as `Value::Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireResponse")]
pub struct Response {
    request_id: u32,
    result: Value,
    error: Option<RemoteError>,
}

/// A response as found on the wire, before exclusivity is checked.
#[derive(Deserialize)]
struct WireResponse {
    request_id: u32,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RemoteError>,
}

impl TryFrom<WireResponse> for Response {
    type Error = String;

    fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
        if wire.error.is_some() && !wire.result.is_null() {
            return Err(format!(
                "response {} carries both a result and an error",
                wire.request_id
            ));
        }
        Ok(Self {
            request_id: wire.request_id,
            result: wire.result,
            error: wire.error,
        })
    }
}

impl Response {
    /// Successful response.
    #[must_use]
    pub const fn ok(request_id: u32, result: Value) -> Self {
        Self {
            request_id,
            result,
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub const fn err(request_id: u32, error: RemoteError) -> Self {
        Self {
            request_id,
            result: Value::Null,
            error: Some(error),
        }
    }

    /// Request id this response correlates with.
    #[must_use]
    pub const fn request_id(&self) -> u32 {
        self.request_id
    }

    /// The result, if the call succeeded.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match self.error {
            Some(_) => None,
            None => Some(&self.result),
        }
    }

    /// The error, if the call failed.
    #[must_use]
    pub const fn error(&self) -> Option<&RemoteError> {
        self.error.as_ref()
    }

    /// Whether the call succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the carried [`RemoteError`] if the call failed.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}

/// Decoded body of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No body (heartbeats).
    Empty,
    /// Request body.
    Request(Request),
    /// Response body.
    Response(Response),
}

/// One protocol message: header fields plus decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message type.
    pub message_type: MessageType,
    /// Serializer used for the body.
    pub serializer_id: u8,
    /// Compressor used for the body, `0` for none.
    pub compressor_id: u8,
    /// Client-assigned correlation id.
    pub request_id: u32,
    /// Decoded body.
    pub payload: Payload,
}

impl Message {
    /// A request message using CBOR and no compression.
    #[must_use]
    pub const fn request(request_id: u32, request: Request) -> Self {
        Self {
            message_type: MessageType::Request,
            serializer_id: SERIALIZER_CBOR,
            compressor_id: COMPRESSOR_OFF,
            request_id,
            payload: Payload::Request(request),
        }
    }

    /// A heartbeat probe.
    #[must_use]
    pub const fn heartbeat(request_id: u32) -> Self {
        Self {
            message_type: MessageType::HeartbeatRequest,
            serializer_id: SERIALIZER_CBOR,
            compressor_id: COMPRESSOR_OFF,
            request_id,
            payload: Payload::Empty,
        }
    }

    /// A response echoing this message's request id, serializer and compressor.
    #[must_use]
    pub const fn reply(&self, response: Response) -> Self {
        Self {
            message_type: MessageType::Response,
            serializer_id: self.serializer_id,
            compressor_id: self.compressor_id,
            request_id: self.request_id,
            payload: Payload::Response(response),
        }
    }

    /// The heartbeat answer to this message.
    #[must_use]
    pub const fn heartbeat_reply(&self) -> Self {
        Self {
            message_type: MessageType::HeartbeatResponse,
            serializer_id: self.serializer_id,
            compressor_id: self.compressor_id,
            request_id: self.request_id,
            payload: Payload::Empty,
        }
    }

    /// Use a different serializer for the body.
    #[must_use]
    pub const fn with_serializer(mut self, serializer_id: u8) -> Self {
        self.serializer_id = serializer_id;
        self
    }

    /// Use a compressor for the body.
    #[must_use]
    pub const fn with_compressor(mut self, compressor_id: u8) -> Self {
        self.compressor_id = compressor_id;
        self
    }
}
