//! Framing codecs using tokio-util.
//!
//! [`ClientCodec`] is used on the client side of the control connection: it
//! decodes handshake responses, responses and updates, and encodes the
//! handshake and requests. [`DeviceCodec`] is its mirror image for the
//! device side.
//!
//! The client decoder never fails on a bad message once the handshake is
//! done. Undecodable packets whose length is known are skipped; otherwise the
//! decoder waits for more bytes.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::{Command, UPDATE_REQUEST_ID};
use crate::error::{CodecError, DecodeError};
use crate::handshake::{HandshakeRequest, HandshakeResponse};
use crate::requests::{REQUEST_HEADER_SIZE, Request};
use crate::responses::{LEGACY_RESPONSE_HEADER_SIZE, Response, V3_RESPONSE_HEADER_SIZE};
use crate::updates::Update;
use crate::version::{FramingMode, ProtocolVersion};

/// Default maximum message size (16 MB).
const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Lookup from an outstanding request id to the command it was sent with.
///
/// Responses do not name their command, so the decoder asks whoever tracks
/// in-flight requests.
pub trait PendingLookup: Send + Sync {
    fn command_for(&self, request_id: u32) -> Option<Command>;
}

/// A lookup that knows about no requests. Every response is treated as stale.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPending;

impl PendingLookup for NoPending {
    fn command_for(&self, _request_id: u32) -> Option<Command> {
        None
    }
}

/// Messages received by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Handshake(HandshakeResponse),
    Response(Response),
    Update(Update),
    /// A response to an outstanding request that could not be decoded. Its
    /// bytes have been dropped; the request should be failed.
    Undecodable {
        request_id: u32,
        error: DecodeError,
    },
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Handshake(HandshakeRequest),
    Request(Request),
}

impl From<Request> for Outgoing {
    fn from(value: Request) -> Self {
        Outgoing::Request(value)
    }
}

/// Client-side codec.
#[derive(Clone)]
pub struct ClientCodec {
    /// Set from the handshake response, which must be the first message.
    version: Option<ProtocolVersion>,
    pending: Arc<dyn PendingLookup>,
    max_message_size: usize,
}

impl fmt::Debug for ClientCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCodec")
            .field("version", &self.version)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

impl ClientCodec {
    pub fn new(pending: Arc<dyn PendingLookup>) -> Self {
        Self {
            version: None,
            pending,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Create a new codec with a custom maximum message size.
    ///
    /// Packets declaring a larger size are rejected with
    /// [`CodecError::MessageTooLarge`].
    pub fn with_max_size(pending: Arc<dyn PendingLookup>, max_message_size: usize) -> Self {
        Self {
            max_message_size,
            ..Self::new(pending)
        }
    }

    /// Protocol version negotiated by the handshake, once it has been read.
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    fn decode_handshake(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Incoming>, CodecError> {
        match HandshakeResponse::decode(src) {
            Ok((handshake, consumed)) => {
                src.advance(consumed);
                tracing::debug!(version = %handshake.protocol_version, "decoded handshake response");
                self.version = Some(handshake.protocol_version);
                Ok(Some(Incoming::Handshake(handshake)))
            }
            Err(e) if e.is_incomplete() => Ok(None),
            // nothing can be framed without a handshake
            Err(e) => Err(CodecError::Decode(e)),
        }
    }

    /// Decode one message, returning `None` in place of a stale response
    /// that was dropped.
    fn decode_message(
        &self,
        src: &[u8],
        version: ProtocolVersion,
    ) -> Result<(Option<Incoming>, usize), DecodeError> {
        let framing = version.framing();
        let (request_id, packet_length) = match framing {
            FramingMode::V3 => {
                if src.len() < V3_RESPONSE_HEADER_SIZE {
                    return Err(DecodeError::Incomplete {
                        needed: V3_RESPONSE_HEADER_SIZE,
                    });
                }
                (read_u32_at(src, 4), Some(read_u32_at(src, 0) as usize))
            }
            FramingMode::Legacy => {
                if src.len() < LEGACY_RESPONSE_HEADER_SIZE {
                    return Err(DecodeError::Incomplete {
                        needed: LEGACY_RESPONSE_HEADER_SIZE,
                    });
                }
                (read_u32_at(src, 0), None)
            }
        };

        if request_id == UPDATE_REQUEST_ID {
            let (update, consumed) = Update::decode(src, version)?;
            return Ok((Some(Incoming::Update(update)), consumed));
        }

        if let Some(command) = self.pending.command_for(request_id) {
            return match Response::decode(src, command, version) {
                Ok((response, consumed)) => Ok((Some(Incoming::Response(response)), consumed)),
                Err(e) if e.is_incomplete() => Err(e),
                Err(error) => {
                    let consumed = match packet_length {
                        Some(len) if len >= V3_RESPONSE_HEADER_SIZE => {
                            if src.len() < len {
                                return Err(DecodeError::Incomplete { needed: len });
                            }
                            len
                        }
                        // no usable length, same as a stale legacy response
                        _ => src.len(),
                    };
                    tracing::warn!(request_id, %error, skipped = consumed, "dropping undecodable response");
                    Ok((Some(Incoming::Undecodable { request_id, error }), consumed))
                }
            };
        }

        match packet_length {
            Some(len) if len >= V3_RESPONSE_HEADER_SIZE => {
                if src.len() < len {
                    return Err(DecodeError::Incomplete { needed: len });
                }
                tracing::warn!(request_id, len, "dropping response to unknown request");
                Ok((None, len))
            }
            Some(len) => Err(DecodeError::InvalidPacketLength(len as u32)),
            None => {
                tracing::warn!(
                    request_id,
                    discarded = src.len(),
                    "dropping stale legacy response and everything buffered after it"
                );
                Ok((None, src.len()))
            }
        }
    }
}

fn read_u32_at(src: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

impl Decoder for ClientCodec {
    type Item = Incoming;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }
            let Some(version) = self.version else {
                return self.decode_handshake(src);
            };

            if version.has_packet_length() && src.len() >= 4 {
                let declared = read_u32_at(src, 0) as usize;
                if declared > self.max_message_size {
                    return Err(CodecError::MessageTooLarge {
                        size: declared,
                        max: self.max_message_size,
                    });
                }
            }

            match self.decode_message(src, version) {
                Ok((message, consumed)) => {
                    src.advance(consumed);
                    match message {
                        Some(message) => return Ok(Some(message)),
                        None => continue,
                    }
                }
                Err(DecodeError::Incomplete { needed }) => {
                    src.reserve(needed.saturating_sub(src.len()));
                    return Ok(None);
                }
                Err(e) => {
                    if let Some(len) = skippable_length(src, version) {
                        tracing::warn!(error = %e, skipped = len, "skipping undecodable packet");
                        src.advance(len);
                        continue;
                    }
                    tracing::warn!(error = %e, buffered = src.len(), "cannot frame message, waiting for more data");
                    return Ok(None);
                }
            }
        }
    }
}

/// Length of the packet at the front of `src`, if it is known and fully
/// buffered.
fn skippable_length(src: &[u8], version: ProtocolVersion) -> Option<usize> {
    if !version.has_packet_length() || src.len() < 4 {
        return None;
    }
    let len = read_u32_at(src, 0) as usize;
    (len >= V3_RESPONSE_HEADER_SIZE && len <= src.len()).then_some(len)
}

impl Encoder<Outgoing> for ClientCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Outgoing, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = match &item {
            Outgoing::Handshake(handshake) => handshake.encode()?,
            Outgoing::Request(request) => request.encode()?,
        };
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

/// Messages received by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceIncoming {
    Handshake(HandshakeRequest),
    Request(Request),
}

/// Messages sent by the device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutgoing {
    Handshake(HandshakeResponse),
    Response(Response),
    Update(Update),
}

/// Device-side codec speaking one fixed protocol version.
#[derive(Debug, Clone)]
pub struct DeviceCodec {
    version: ProtocolVersion,
    handshake_received: bool,
    max_message_size: usize,
}

impl DeviceCodec {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            handshake_received: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }
}

impl Decoder for DeviceCodec {
    type Item = DeviceIncoming;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }
            if !self.handshake_received {
                return match HandshakeRequest::decode(src) {
                    Ok((handshake, consumed)) => {
                        src.advance(consumed);
                        self.handshake_received = true;
                        Ok(Some(DeviceIncoming::Handshake(handshake)))
                    }
                    Err(e) if e.is_incomplete() => Ok(None),
                    Err(e) => Err(CodecError::Decode(e)),
                };
            }

            if src.len() >= 4 {
                let declared = read_u32_at(src, 0) as usize;
                if declared > self.max_message_size {
                    return Err(CodecError::MessageTooLarge {
                        size: declared,
                        max: self.max_message_size,
                    });
                }
            }

            match Request::decode(src) {
                Ok((request, consumed)) => {
                    src.advance(consumed);
                    return Ok(Some(DeviceIncoming::Request(request)));
                }
                Err(DecodeError::Incomplete { needed }) => {
                    src.reserve(needed.saturating_sub(src.len()));
                    return Ok(None);
                }
                Err(e) => {
                    let len = read_u32_at(src, 0) as usize;
                    if len < REQUEST_HEADER_SIZE || len > src.len() {
                        return Err(CodecError::Decode(e));
                    }
                    tracing::warn!(error = %e, skipped = len, "skipping undecodable request");
                    src.advance(len);
                }
            }
        }
    }
}

impl Encoder<DeviceOutgoing> for DeviceCodec {
    type Error = CodecError;

    fn encode(&mut self, item: DeviceOutgoing, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = match &item {
            DeviceOutgoing::Handshake(handshake) => handshake.encode()?,
            DeviceOutgoing::Response(response) => response.encode(self.version)?,
            DeviceOutgoing::Update(update) => update.encode(self.version)?,
        };
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}
