//! Unsolicited notifications pushed by the device.
//!
//! Every update carries request id 0.

use bytes::BytesMut;

use crate::constants::{ErrorCode, StopReason, UPDATE_REQUEST_ID, UpdateType};
use crate::error::{CodecError, DecodeError};
use crate::version::{FramingMode, ProtocolVersion};
use crate::wire::{WireReader, WireWriter};

/// Header size of a v3 update: packet length, request id, error code, update type.
pub const V3_UPDATE_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub error_code: ErrorCode,
    pub body: UpdateBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateBody {
    IoPortOpened(IoPortOpened),
    AllThreadsStopped(AllThreadsStopped),
    ThreadAttached(ThreadAttached),
    BreakpointError(BreakpointError),
    CompileError(CompileError),
    BreakpointVerified(BreakpointVerified),
}

impl UpdateBody {
    pub fn update_type(&self) -> UpdateType {
        match self {
            UpdateBody::IoPortOpened(_) => UpdateType::IoPortOpened,
            UpdateBody::AllThreadsStopped(_) => UpdateType::AllThreadsStopped,
            UpdateBody::ThreadAttached(_) => UpdateType::ThreadAttached,
            UpdateBody::BreakpointError(_) => UpdateType::BreakpointError,
            UpdateBody::CompileError(_) => UpdateType::CompileError,
            UpdateBody::BreakpointVerified(_) => UpdateType::BreakpointVerified,
        }
    }
}

/// The device opened the IO port; program output is served on `port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoPortOpened {
    pub port: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllThreadsStopped {
    pub primary_thread_index: i32,
    pub stop_reason: StopReason,
    pub stop_reason_detail: String,
}

/// A single thread stopped (or attached) while others keep running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAttached {
    pub thread_index: i32,
    pub stop_reason: StopReason,
    pub stop_reason_detail: String,
}

/// A conditional breakpoint's condition failed to compile or evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BreakpointError {
    pub flags: u32,
    pub breakpoint_id: u32,
    pub compile_errors: Vec<String>,
    pub runtime_errors: Vec<String>,
    pub other_errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompileError {
    pub flags: u32,
    pub error_message: String,
    pub file_path: String,
    pub line_number: u32,
    pub library_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BreakpointVerified {
    pub flags: u32,
    pub breakpoint_ids: Vec<u32>,
}

impl Update {
    pub fn new(body: UpdateBody) -> Self {
        Self {
            error_code: ErrorCode::Ok,
            body,
        }
    }

    pub fn update_type(&self) -> UpdateType {
        self.body.update_type()
    }

    pub fn encode(&self, version: ProtocolVersion) -> Result<BytesMut, CodecError> {
        let mut w = match version.framing() {
            FramingMode::V3 => WireWriter::with_packet_length(),
            FramingMode::Legacy => WireWriter::new(),
        };
        w.put_u32(UPDATE_REQUEST_ID);
        w.put_u32(self.error_code.into());
        w.put_u32(self.update_type().code());

        match &self.body {
            UpdateBody::IoPortOpened(io) => w.put_u32(io.port),
            UpdateBody::AllThreadsStopped(stopped) => {
                w.put_i32(stopped.primary_thread_index);
                w.put_u8(stopped.stop_reason.into());
                w.put_utf8z(&stopped.stop_reason_detail)?;
            }
            UpdateBody::ThreadAttached(attached) => {
                w.put_i32(attached.thread_index);
                w.put_u8(attached.stop_reason.into());
                w.put_utf8z(&attached.stop_reason_detail)?;
            }
            UpdateBody::BreakpointError(err) => {
                w.put_u32(err.flags);
                w.put_u32(err.breakpoint_id);
                w.put_utf8z_list(&err.compile_errors)?;
                w.put_utf8z_list(&err.runtime_errors)?;
                w.put_utf8z_list(&err.other_errors)?;
            }
            UpdateBody::CompileError(err) => {
                w.put_u32(err.flags);
                w.put_utf8z(&err.error_message)?;
                w.put_utf8z(&err.file_path)?;
                w.put_u32(err.line_number);
                w.put_utf8z(&err.library_name)?;
            }
            UpdateBody::BreakpointVerified(verified) => {
                w.put_u32(verified.flags);
                w.put_u32(verified.breakpoint_ids.len() as u32);
                for id in &verified.breakpoint_ids {
                    w.put_u32(*id);
                }
            }
        }

        Ok(w.finish())
    }

    pub fn decode(buf: &[u8], version: ProtocolVersion) -> Result<(Self, usize), DecodeError> {
        match version.framing() {
            FramingMode::V3 => {
                let packet_length = WireReader::open(buf).read_u32()?;
                if (packet_length as usize) < V3_UPDATE_HEADER_SIZE {
                    return Err(DecodeError::InvalidPacketLength(packet_length));
                }
                let len = packet_length as usize;
                if buf.len() < len {
                    return Err(DecodeError::Incomplete { needed: len });
                }
                let mut r = WireReader::bounded(&buf[..len]);
                r.skip(4)?;
                let update = Self::decode_fields(&mut r)?;
                Ok((update, len))
            }
            FramingMode::Legacy => {
                let mut r = WireReader::open(buf);
                let update = Self::decode_fields(&mut r)?;
                Ok((update, r.offset()))
            }
        }
    }

    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        // the request id is always zero; routing already relied on it
        r.read_u32()?;
        let error_code = ErrorCode::from(r.read_u32()?);
        let raw_type = r.read_u32()?;
        let update_type =
            UpdateType::from_u32(raw_type).ok_or(DecodeError::UnknownUpdateType(raw_type))?;

        let body = match update_type {
            UpdateType::Undefined => return Err(DecodeError::UnknownUpdateType(raw_type)),
            UpdateType::IoPortOpened => UpdateBody::IoPortOpened(IoPortOpened {
                port: r.read_u32()?,
            }),
            UpdateType::AllThreadsStopped => UpdateBody::AllThreadsStopped(AllThreadsStopped {
                primary_thread_index: r.read_i32()?,
                stop_reason: StopReason::from(r.read_u8()?),
                stop_reason_detail: r.read_utf8z()?,
            }),
            UpdateType::ThreadAttached => UpdateBody::ThreadAttached(ThreadAttached {
                thread_index: r.read_i32()?,
                stop_reason: StopReason::from(r.read_u8()?),
                stop_reason_detail: r.read_utf8z()?,
            }),
            UpdateType::BreakpointError => UpdateBody::BreakpointError(BreakpointError {
                flags: r.read_u32()?,
                breakpoint_id: r.read_u32()?,
                compile_errors: r.read_utf8z_list()?,
                runtime_errors: r.read_utf8z_list()?,
                other_errors: r.read_utf8z_list()?,
            }),
            UpdateType::CompileError => UpdateBody::CompileError(CompileError {
                flags: r.read_u32()?,
                error_message: r.read_utf8z()?,
                file_path: r.read_utf8z()?,
                line_number: r.read_u32()?,
                library_name: r.read_utf8z()?,
            }),
            UpdateType::BreakpointVerified => {
                let flags = r.read_u32()?;
                let count = r.read_u32()?;
                let mut breakpoint_ids = Vec::new();
                for _ in 0..count {
                    breakpoint_ids.push(r.read_u32()?);
                }
                UpdateBody::BreakpointVerified(BreakpointVerified {
                    flags,
                    breakpoint_ids,
                })
            }
        };

        Ok(Update { error_code, body })
    }
}
