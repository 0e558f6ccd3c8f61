//! Handshake messages.
//!
//! The handshake is the only exchange that happens before the protocol
//! version is known, so it is decoded by trying both shapes the device may
//! have used.

use bytes::BytesMut;

use crate::error::{CodecError, DecodeError};
use crate::version::ProtocolVersion;
use crate::wire::{WireReader, WireWriter};

/// Size of the v3 trailer that `remainingPacketLength` must at least cover.
const V3_TRAILER_MIN: u32 = 8;

/// Sent by the client immediately after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub magic: String,
}

impl HandshakeRequest {
    pub fn new() -> Self {
        Self {
            magic: crate::DEBUGGER_MAGIC.to_string(),
        }
    }

    pub fn encode(&self) -> Result<BytesMut, CodecError> {
        let mut w = WireWriter::new();
        w.put_utf8z(&self.magic)?;
        Ok(w.finish())
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut r = WireReader::open(buf);
        let magic = r.read_utf8z()?;
        Ok((Self { magic }, r.offset()))
    }
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// The device's answer to the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub magic: String,
    pub protocol_version: ProtocolVersion,
    /// Build timestamp of the device protocol, in milliseconds since the epoch.
    /// Only sent by v3 devices.
    pub revision_timestamp: Option<i64>,
}

impl HandshakeResponse {
    /// Encode in the shape implied by the protocol version.
    pub fn encode(&self) -> Result<BytesMut, CodecError> {
        let mut w = WireWriter::new();
        w.put_utf8z(&self.magic)?;
        w.put_u32(self.protocol_version.major);
        w.put_u32(self.protocol_version.minor);
        w.put_u32(self.protocol_version.patch);
        if self.protocol_version.has_packet_length() {
            w.put_u32(V3_TRAILER_MIN);
            w.put_i64(self.revision_timestamp.unwrap_or_default());
        }
        Ok(w.finish())
    }

    /// Decode a handshake response, trying the v3 shape before the legacy one.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        match Self::decode_v3(buf) {
            Ok(decoded) => Ok(decoded),
            Err(v3_err) => match Self::decode_legacy(buf) {
                Ok(decoded) => Ok(decoded),
                // a v3 message that simply hasn't fully arrived yet
                Err(_) if v3_err.is_incomplete() => Err(v3_err),
                Err(legacy_err) => Err(legacy_err),
            },
        }
    }

    fn read_common(r: &mut WireReader<'_>) -> Result<(String, ProtocolVersion), DecodeError> {
        let magic = r.read_utf8z()?;
        let major = r.read_u32()?;
        let minor = r.read_u32()?;
        let patch = r.read_u32()?;
        Ok((magic, ProtocolVersion::new(major, minor, patch)))
    }

    fn decode_v3(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut r = WireReader::open(buf);
        let (magic, protocol_version) = Self::read_common(&mut r)?;
        if !protocol_version.has_packet_length() {
            return Err(DecodeError::HandshakeShapeMismatch(protocol_version));
        }

        let remaining = r.read_u32()?;
        if remaining < V3_TRAILER_MIN {
            return Err(DecodeError::InvalidPacketLength(remaining));
        }
        let end = r.offset() + remaining as usize;
        if buf.len() < end {
            return Err(DecodeError::Incomplete { needed: end });
        }
        let revision_timestamp = r.read_i64()?;

        // anything after the timestamp belongs to a newer revision; skip it
        Ok((
            Self {
                magic,
                protocol_version,
                revision_timestamp: Some(revision_timestamp),
            },
            end,
        ))
    }

    fn decode_legacy(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut r = WireReader::open(buf);
        let (magic, protocol_version) = Self::read_common(&mut r)?;
        if protocol_version.has_packet_length() {
            return Err(DecodeError::HandshakeShapeMismatch(protocol_version));
        }
        Ok((
            Self {
                magic,
                protocol_version,
                revision_timestamp: None,
            },
            r.offset(),
        ))
    }
}
