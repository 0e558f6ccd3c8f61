//! Responses sent by the device.
//!
//! A response does not carry the command it answers, so decoding requires the
//! command of the matching pending request.

use bytes::BytesMut;

use crate::constants::{
    Command, ErrorCode, StopReason, THREAD_FLAG_IS_PRIMARY, VariableType, error_flags,
    variable_flags,
};
use crate::error::{CodecError, DecodeError};
use crate::version::{FramingMode, ProtocolVersion};
use crate::wire::{WireReader, WireWriter};

/// Header size of a v3 response: packet length, request id, error code.
pub const V3_RESPONSE_HEADER_SIZE: usize = 12;
/// Header size of a legacy response: request id, error code.
pub const LEGACY_RESPONSE_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request_id: u32,
    pub error_code: ErrorCode,
    /// Detail on a failed request. Only sent by 3.1.0+ devices.
    pub error_data: Option<ErrorData>,
    pub body: ResponseBody,
}

/// Structured detail attached to an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorData {
    /// Index of the first path segment whose value was `invalid`.
    pub invalid_path_index: Option<i32>,
    /// Index of the first path segment that was not found.
    pub missing_key_index: Option<i32>,
}

impl ErrorData {
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.invalid_path_index.is_some() {
            flags |= error_flags::INVALID_VALUE_IN_PATH;
        }
        if self.missing_key_index.is_some() {
            flags |= error_flags::MISSING_KEY_IN_PATH;
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Commands with no payload, and every non-OK response.
    Empty,
    Threads(ThreadsResponse),
    StackTrace(StackTraceResponse),
    Variables(VariablesResponse),
    Execute(ExecuteResponse),
    /// Answer to any of the breakpoint commands.
    Breakpoints(BreakpointsResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadsResponse {
    pub threads: Vec<ThreadInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadInfo {
    pub is_primary: bool,
    pub stop_reason: StopReason,
    pub stop_reason_detail: String,
    pub line_number: u32,
    pub function_name: String,
    pub file_path: String,
    pub code_snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackTraceResponse {
    /// Innermost frame first.
    pub entries: Vec<StackFrameInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackFrameInfo {
    pub line_number: u32,
    pub function_name: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VariablesResponse {
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: Option<String>,
    pub variable_type: VariableType,
    pub is_child_key: bool,
    pub is_const: bool,
    pub is_keys_case_sensitive: bool,
    pub ref_count: Option<u32>,
    /// Present on containers: the type of their keys and how many elements
    /// they hold.
    pub container: Option<ContainerInfo>,
    pub value: Option<VariableValue>,
}

impl Variable {
    pub fn new(name: impl Into<String>, variable_type: VariableType) -> Self {
        Self {
            name: Some(name.into()),
            variable_type,
            is_child_key: false,
            is_const: false,
            is_keys_case_sensitive: false,
            ref_count: None,
            container: None,
            value: None,
        }
    }

    pub fn with_value(mut self, value: VariableValue) -> Self {
        self.value = Some(value);
        self
    }

    pub fn is_container(&self) -> bool {
        self.container.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerInfo {
    pub key_type: VariableType,
    pub element_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    String(String),
    Boolean(bool),
    Integer(i32),
    LongInteger(i64),
    Float(f32),
    Double(f64),
}

impl std::fmt::Display for VariableValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VariableValue::String(s) => f.write_str(s),
            VariableValue::Boolean(b) => write!(f, "{b}"),
            VariableValue::Integer(i) => write!(f, "{i}"),
            VariableValue::LongInteger(i) => write!(f, "{i}"),
            VariableValue::Float(x) => write!(f, "{x}"),
            VariableValue::Double(x) => write!(f, "{x}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecuteResponse {
    pub execute_success: bool,
    pub runtime_stop_code: u8,
    pub compile_errors: Vec<String>,
    pub runtime_errors: Vec<String>,
    pub other_errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BreakpointsResponse {
    pub breakpoints: Vec<BreakpointInfo>,
}

/// Device-side state of one breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointInfo {
    pub breakpoint_id: u32,
    pub error_code: ErrorCode,
    /// Only present when `error_code` is OK.
    pub ignore_count: Option<u32>,
}

impl Response {
    pub fn ok(request_id: u32, body: ResponseBody) -> Self {
        Self {
            request_id,
            error_code: ErrorCode::Ok,
            error_data: None,
            body,
        }
    }

    pub fn error(request_id: u32, error_code: ErrorCode) -> Self {
        Self {
            request_id,
            error_code,
            error_data: None,
            body: ResponseBody::Empty,
        }
    }

    pub fn with_error_data(mut self, error_data: ErrorData) -> Self {
        self.error_data = Some(error_data);
        self
    }

    pub fn encode(&self, version: ProtocolVersion) -> Result<BytesMut, CodecError> {
        let framing = version.framing();
        let mut w = match framing {
            FramingMode::V3 => WireWriter::with_packet_length(),
            FramingMode::Legacy => WireWriter::new(),
        };
        w.put_u32(self.request_id);
        w.put_u32(self.error_code.into());

        if !self.error_code.is_ok() {
            let error_data = self
                .error_data
                .as_ref()
                .filter(|_| version.supports_error_data());
            if let Some(data) = error_data {
                w.put_u32(data.flags());
                if let Some(idx) = data.invalid_path_index {
                    w.put_i32(idx);
                }
                if let Some(idx) = data.missing_key_index {
                    w.put_i32(idx);
                }
            }
            return Ok(w.finish());
        }

        match &self.body {
            ResponseBody::Empty => {}
            ResponseBody::Threads(threads) => {
                w.put_u32(threads.threads.len() as u32);
                for t in &threads.threads {
                    w.put_u8(if t.is_primary { THREAD_FLAG_IS_PRIMARY } else { 0 });
                    w.put_u8(t.stop_reason.into());
                    w.put_utf8z(&t.stop_reason_detail)?;
                    w.put_u32(t.line_number);
                    w.put_utf8z(&t.function_name)?;
                    w.put_utf8z(&t.file_path)?;
                    w.put_utf8z(&t.code_snippet)?;
                }
            }
            ResponseBody::StackTrace(trace) => {
                w.put_u32(trace.entries.len() as u32);
                let mut write_frame = |frame: &StackFrameInfo| -> Result<(), CodecError> {
                    w.put_u32(frame.line_number);
                    w.put_utf8z(&frame.function_name)?;
                    w.put_utf8z(&frame.file_path)
                };
                match framing {
                    FramingMode::V3 => trace.entries.iter().try_for_each(&mut write_frame)?,
                    FramingMode::Legacy => {
                        trace.entries.iter().rev().try_for_each(&mut write_frame)?
                    }
                }
            }
            ResponseBody::Variables(vars) => {
                w.put_u32(vars.variables.len() as u32);
                for var in &vars.variables {
                    encode_variable(&mut w, var)?;
                }
            }
            ResponseBody::Execute(exec) => {
                w.put_bool(exec.execute_success);
                w.put_u8(exec.runtime_stop_code);
                w.put_utf8z_list(&exec.compile_errors)?;
                w.put_utf8z_list(&exec.runtime_errors)?;
                w.put_utf8z_list(&exec.other_errors)?;
            }
            ResponseBody::Breakpoints(bps) => {
                w.put_u32(bps.breakpoints.len() as u32);
                for bp in &bps.breakpoints {
                    w.put_u32(bp.breakpoint_id);
                    w.put_u32(bp.error_code.into());
                    if bp.error_code.is_ok() {
                        w.put_u32(bp.ignore_count.unwrap_or(0));
                    }
                }
            }
        }

        Ok(w.finish())
    }

    /// Decode a response to `command` from the front of `buf`.
    pub fn decode(
        buf: &[u8],
        command: Command,
        version: ProtocolVersion,
    ) -> Result<(Self, usize), DecodeError> {
        match version.framing() {
            FramingMode::V3 => {
                let packet_length = WireReader::open(buf).read_u32()?;
                if (packet_length as usize) < V3_RESPONSE_HEADER_SIZE {
                    return Err(DecodeError::InvalidPacketLength(packet_length));
                }
                let len = packet_length as usize;
                if buf.len() < len {
                    return Err(DecodeError::Incomplete { needed: len });
                }
                let mut r = WireReader::bounded(&buf[..len]);
                r.skip(4)?;
                let response = Self::decode_fields(&mut r, command, version)?;
                // trailing fields from a newer device are skipped
                Ok((response, len))
            }
            FramingMode::Legacy => {
                let mut r = WireReader::open(buf);
                let response = Self::decode_fields(&mut r, command, version)?;
                Ok((response, r.offset()))
            }
        }
    }

    fn decode_fields(
        r: &mut WireReader<'_>,
        command: Command,
        version: ProtocolVersion,
    ) -> Result<Self, DecodeError> {
        let request_id = r.read_u32()?;
        let error_code = ErrorCode::from(r.read_u32()?);

        if !error_code.is_ok() {
            let error_data = if version.supports_error_data() && r.is_bounded() && r.remaining() >= 4
            {
                let flags = r.read_u32()?;
                let mut data = ErrorData::default();
                if flags & error_flags::INVALID_VALUE_IN_PATH != 0 {
                    data.invalid_path_index = Some(r.read_i32()?);
                }
                if flags & error_flags::MISSING_KEY_IN_PATH != 0 {
                    data.missing_key_index = Some(r.read_i32()?);
                }
                Some(data)
            } else {
                None
            };
            return Ok(Response {
                request_id,
                error_code,
                error_data,
                body: ResponseBody::Empty,
            });
        }

        let body = match command {
            Command::Stop | Command::Continue | Command::Step | Command::ExitChannel => {
                ResponseBody::Empty
            }
            Command::Threads => {
                let count = r.read_u32()?;
                let mut threads = Vec::new();
                for _ in 0..count {
                    let flags = r.read_u8()?;
                    threads.push(ThreadInfo {
                        is_primary: flags & THREAD_FLAG_IS_PRIMARY != 0,
                        stop_reason: StopReason::from(r.read_u8()?),
                        stop_reason_detail: r.read_utf8z()?,
                        line_number: r.read_u32()?,
                        function_name: r.read_utf8z()?,
                        file_path: r.read_utf8z()?,
                        code_snippet: r.read_utf8z()?,
                    });
                }
                ResponseBody::Threads(ThreadsResponse { threads })
            }
            Command::StackTrace => {
                let count = r.read_u32()?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    entries.push(StackFrameInfo {
                        line_number: r.read_u32()?,
                        function_name: r.read_utf8z()?,
                        file_path: r.read_utf8z()?,
                    });
                }
                // legacy devices send the outermost frame first
                if version.framing() == FramingMode::Legacy {
                    entries.reverse();
                }
                ResponseBody::StackTrace(StackTraceResponse { entries })
            }
            Command::Variables => {
                let count = r.read_u32()?;
                let mut variables = Vec::new();
                for _ in 0..count {
                    let (variable, aligned) = decode_variable(r)?;
                    variables.push(variable);
                    if !aligned {
                        break;
                    }
                }
                ResponseBody::Variables(VariablesResponse { variables })
            }
            Command::Execute => ResponseBody::Execute(ExecuteResponse {
                execute_success: r.read_bool()?,
                runtime_stop_code: r.read_u8()?,
                compile_errors: r.read_utf8z_list()?,
                runtime_errors: r.read_utf8z_list()?,
                other_errors: r.read_utf8z_list()?,
            }),
            Command::AddBreakpoints
            | Command::AddConditionalBreakpoints
            | Command::ListBreakpoints
            | Command::RemoveBreakpoints => {
                let count = r.read_u32()?;
                let mut breakpoints = Vec::new();
                for _ in 0..count {
                    let breakpoint_id = r.read_u32()?;
                    let error_code = ErrorCode::from(r.read_u32()?);
                    let ignore_count = if error_code.is_ok() {
                        Some(r.read_u32()?)
                    } else {
                        None
                    };
                    breakpoints.push(BreakpointInfo {
                        breakpoint_id,
                        error_code,
                        ignore_count,
                    });
                }
                ResponseBody::Breakpoints(BreakpointsResponse { breakpoints })
            }
        };

        Ok(Response {
            request_id,
            error_code,
            error_data: None,
            body,
        })
    }
}

fn encode_variable(w: &mut WireWriter, var: &Variable) -> Result<(), CodecError> {
    let mut flags = 0;
    if var.is_child_key {
        flags |= variable_flags::IS_CHILD_KEY;
    }
    if var.is_const {
        flags |= variable_flags::IS_CONST;
    }
    if var.container.is_some() {
        flags |= variable_flags::IS_CONTAINER;
    }
    if var.name.is_some() {
        flags |= variable_flags::IS_NAME_HERE;
    }
    if var.ref_count.is_some() {
        flags |= variable_flags::IS_REF_COUNTED;
    }
    if var.value.is_some() {
        flags |= variable_flags::IS_VALUE_HERE;
    }
    if var.is_keys_case_sensitive {
        flags |= variable_flags::IS_KEYS_CASE_SENSITIVE;
    }

    w.put_u8(flags);
    w.put_u8(var.variable_type.into());
    if let Some(name) = &var.name {
        w.put_utf8z(name)?;
    }
    if let Some(ref_count) = var.ref_count {
        w.put_u32(ref_count);
    }
    if let Some(container) = &var.container {
        w.put_u8(container.key_type.into());
        w.put_u32(container.element_count);
    }
    match &var.value {
        None => {}
        Some(VariableValue::String(s)) => w.put_utf8z(s)?,
        Some(VariableValue::Boolean(b)) => w.put_bool(*b),
        Some(VariableValue::Integer(i)) => w.put_i32(*i),
        Some(VariableValue::LongInteger(i)) => w.put_i64(*i),
        Some(VariableValue::Float(x)) => w.put_f32(*x),
        Some(VariableValue::Double(x)) => w.put_f64(*x),
    }
    Ok(())
}

/// Decode one variable. The flag is false when the reader could not step
/// over the variable's value, so no further variables can be read.
fn decode_variable(r: &mut WireReader<'_>) -> Result<(Variable, bool), DecodeError> {
    let flags = r.read_u8()?;
    let variable_type = VariableType::from(r.read_u8()?);
    let has = |flag: u8| flags & flag != 0;

    let name = if has(variable_flags::IS_NAME_HERE) {
        Some(r.read_utf8z()?)
    } else {
        None
    };
    let ref_count = if has(variable_flags::IS_REF_COUNTED) {
        Some(r.read_u32()?)
    } else {
        None
    };
    let container = if has(variable_flags::IS_CONTAINER) {
        Some(ContainerInfo {
            key_type: VariableType::from(r.read_u8()?),
            element_count: r.read_u32()?,
        })
    } else {
        None
    };
    let (value, aligned) = if has(variable_flags::IS_VALUE_HERE) {
        match decode_value(r, variable_type) {
            Ok(value) => (value, true),
            // the packet length still frames the message
            Err(DecodeError::UnsupportedValueType(code)) if r.is_bounded() => {
                tracing::warn!(code, "unknown variable type, dropping the remaining variables");
                (None, false)
            }
            Err(e) => return Err(e),
        }
    } else {
        (None, true)
    };

    let variable = Variable {
        name,
        variable_type,
        is_child_key: has(variable_flags::IS_CHILD_KEY),
        is_const: has(variable_flags::IS_CONST),
        is_keys_case_sensitive: has(variable_flags::IS_KEYS_CASE_SENSITIVE),
        ref_count,
        container,
        value,
    };
    Ok((variable, aligned))
}

fn decode_value(
    r: &mut WireReader<'_>,
    variable_type: VariableType,
) -> Result<Option<VariableValue>, DecodeError> {
    let value = match variable_type {
        VariableType::String
        | VariableType::Function
        | VariableType::Subroutine
        | VariableType::Object
        | VariableType::Interface
        | VariableType::SubtypedObject => VariableValue::String(r.read_utf8z()?),
        VariableType::Boolean => VariableValue::Boolean(r.read_bool()?),
        VariableType::Integer => VariableValue::Integer(r.read_i32()?),
        VariableType::LongInteger => VariableValue::LongInteger(r.read_i64()?),
        VariableType::Float => VariableValue::Float(r.read_f32()?),
        VariableType::Double => VariableValue::Double(r.read_f64()?),
        VariableType::AssociativeArray
        | VariableType::Array
        | VariableType::List
        | VariableType::Invalid
        | VariableType::Uninitialized
        | VariableType::Unknown => return Ok(None),
        VariableType::Unrecognized(code) => return Err(DecodeError::UnsupportedValueType(code)),
    };
    Ok(Some(value))
}
