//! Error types for the codec.

use std::io;

/// Why a buffer could not be decoded into a message.
///
/// Decoding never panics. [`DecodeError::Incomplete`] means "wait for more
/// bytes"; every other variant means the bytes are not a message this codec
/// understands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The buffer ends before the message does.
    #[error("incomplete message, need at least {needed} bytes")]
    Incomplete {
        /// Minimum total number of bytes required to make progress.
        needed: usize,
    },

    /// A null-terminated string ran to the end of the message.
    #[error("unterminated string at offset {offset}")]
    MissingTerminator { offset: usize },

    /// A string was not valid UTF-8.
    #[error("invalid UTF-8 in string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    /// The packet length is smaller than the fixed header.
    #[error("packet length {0} is too small")]
    InvalidPacketLength(u32),

    /// The fields read extend beyond the declared packet length.
    #[error("read {read} bytes but packet length is {packet_length}")]
    Overrun { read: usize, packet_length: usize },

    #[error("unknown command code {0}")]
    UnknownCommand(u32),

    #[error("unknown update type {0}")]
    UnknownUpdateType(u32),

    #[error("unknown step type {0}")]
    UnknownStepType(u8),

    /// A variable carries a value whose encoding is unknown for its type.
    #[error("cannot decode value of variable type {0}")]
    UnsupportedValueType(u8),

    /// The handshake shape does not agree with the version it carries.
    #[error("handshake shape does not match protocol version {0}")]
    HandshakeShapeMismatch(crate::ProtocolVersion),

    /// A response arrived for a request id nobody is waiting for.
    #[error("no pending request with id {0}")]
    UnknownRequestId(u32),
}

impl DecodeError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, DecodeError::Incomplete { .. })
    }
}

/// Errors surfaced by the framed reader/writer.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An I/O error occurred while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A message declares a size larger than the configured maximum.
    #[error("message size {size} exceeds maximum allowed {max}")]
    MessageTooLarge {
        /// The declared message size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// A string to be encoded contains a null byte and cannot be sent as utf8z.
    #[error("string contains an interior null byte: {0:?}")]
    InteriorNul(String),

    /// A message could not be decoded and its length cannot be determined.
    #[error("undecodable message: {0}")]
    Decode(#[from] DecodeError),
}
