//! Primitive little-endian field readers and writers.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{CodecError, DecodeError};

/// Cursor over a received buffer.
///
/// A reader is either *bounded* (it covers one complete packet whose length
/// is known) or *open* (legacy framing, where the end of the buffer may just
/// be the end of what has arrived so far). Running off the end of a bounded
/// reader is a malformed message; running off an open reader means more bytes
/// are needed.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    offset: usize,
    bounded: bool,
}

impl<'a> WireReader<'a> {
    /// Reader over bytes that may continue beyond the end of `buf`.
    pub fn open(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            bounded: false,
        }
    }

    /// Reader over exactly one complete packet.
    pub fn bounded(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            bounded: true,
        }
    }

    /// Number of bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_bounded(&self) -> bool {
        self.bounded
    }

    fn shortfall(&self, wanted: usize) -> DecodeError {
        if self.bounded {
            DecodeError::Overrun {
                read: self.offset + wanted,
                packet_length: self.buf.len(),
            }
        } else {
            DecodeError::Incomplete {
                needed: self.offset + wanted,
            }
        }
    }

    fn need(&self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(self.shortfall(n));
        }
        Ok(&self.buf[self.offset..self.offset + n])
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let mut bytes = self.need(1)?;
        self.offset += 1;
        Ok(bytes.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let mut bytes = self.need(4)?;
        self.offset += 4;
        Ok(bytes.get_u32_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let mut bytes = self.need(4)?;
        self.offset += 4;
        Ok(bytes.get_i32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let mut bytes = self.need(8)?;
        self.offset += 8;
        Ok(bytes.get_i64_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        let mut bytes = self.need(4)?;
        self.offset += 4;
        Ok(bytes.get_f32_le())
    }

    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        let mut bytes = self.need(8)?;
        self.offset += 8;
        Ok(bytes.get_f64_le())
    }

    /// Read a null-terminated UTF-8 string.
    pub fn read_utf8z(&mut self) -> Result<String, DecodeError> {
        let start = self.offset;
        let rest = &self.buf[start..];
        let Some(len) = rest.iter().position(|b| *b == 0) else {
            return Err(if self.bounded {
                DecodeError::MissingTerminator { offset: start }
            } else {
                DecodeError::Incomplete {
                    needed: self.buf.len() + 1,
                }
            });
        };
        let s = std::str::from_utf8(&rest[..len])
            .map_err(|_| DecodeError::InvalidUtf8 { offset: start })?
            .to_string();
        self.offset += len + 1;
        Ok(s)
    }

    /// Read a `u32` count followed by that many strings.
    pub fn read_utf8z_list(&mut self) -> Result<Vec<String>, DecodeError> {
        let count = self.read_u32()?;
        // count comes off the wire, so never trust it for preallocation
        let mut out = Vec::new();
        for _ in 0..count {
            out.push(self.read_utf8z()?);
        }
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.need(n)?;
        self.offset += n;
        Ok(())
    }
}

/// Builder for an outgoing message.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
    length_prefixed: bool,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a message whose first field is its own total length.
    ///
    /// The placeholder is patched by [`WireWriter::finish`].
    pub fn with_packet_length() -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(0);
        Self {
            buf,
            length_prefixed: true,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    pub fn put_utf8z(&mut self, s: &str) -> Result<(), CodecError> {
        if s.as_bytes().contains(&0) {
            return Err(CodecError::InteriorNul(s.to_string()));
        }
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    pub fn put_utf8z_list(&mut self, items: &[String]) -> Result<(), CodecError> {
        self.put_u32(items.len() as u32);
        for item in items {
            self.put_utf8z(item)?;
        }
        Ok(())
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Finish the message, patching the packet length if there is one.
    pub fn finish(mut self) -> BytesMut {
        if self.length_prefixed {
            let len = self.buf.len() as u32;
            self.buf[..4].copy_from_slice(&len.to_le_bytes());
        }
        self.buf
    }
}
