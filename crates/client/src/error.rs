//! Client error type.

use protocol::{CodecError, Command, DecodeError, ProtocolVersion};

/// Errors returned by the client request API.
///
/// Device-side failures of a request that was actually sent are not errors:
/// they come back as the response's `error_code`.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to a device")]
    NotConnected,

    /// The connection went away while the request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("client is shutting down")]
    ShuttingDown,

    #[error("handshake has not completed")]
    HandshakeIncomplete,

    #[error("handshake magic mismatch: expected {expected:?}, got {actual:?}")]
    HandshakeMismatch { expected: String, actual: String },

    #[error("protocol version {0} is not supported")]
    UnsupportedVersion(ProtocolVersion),

    #[error("the program is not stopped")]
    NotStopped,

    #[error("the program is already stopped")]
    AlreadyStopped,

    #[error("invalid thread index {0}")]
    InvalidThreadIndex(i32),

    /// A variable path could not be resolved.
    #[error("{0}")]
    VariableLookup(String),

    /// The device flagged a path as both containing an invalid value and a
    /// missing key, which cannot be resolved to a single answer.
    #[error("device reported both an invalid value and a missing key in the variable path")]
    AmbiguousVariableError,

    /// The device answered, but the answer could not be decoded.
    #[error("response to request {request_id} could not be decoded: {error}")]
    UndecodableResponse { request_id: u32, error: DecodeError },

    #[error("unexpected response body for {0} request")]
    UnexpectedResponse(Command),

    #[error("transport error: {0}")]
    Transport(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
