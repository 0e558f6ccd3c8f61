//! Requests sent from the client to the device.

use bytes::BytesMut;

use crate::constants::{Command, StepType, variable_request_flags};
use crate::error::{CodecError, DecodeError};
use crate::wire::{WireReader, WireWriter};

/// Size of the fixed request header: packet length, request id, command code.
pub const REQUEST_HEADER_SIZE: usize = 12;

/// A request together with its correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_id: u32,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Stop,
    Continue,
    Threads,
    ListBreakpoints,
    ExitChannel,
    Step(StepRequest),
    StackTrace(StackTraceRequest),
    Variables(VariablesRequest),
    Execute(ExecuteRequest),
    AddBreakpoints(AddBreakpointsRequest),
    AddConditionalBreakpoints(AddConditionalBreakpointsRequest),
    RemoveBreakpoints(RemoveBreakpointsRequest),
}

impl RequestBody {
    pub fn command(&self) -> Command {
        match self {
            RequestBody::Stop => Command::Stop,
            RequestBody::Continue => Command::Continue,
            RequestBody::Threads => Command::Threads,
            RequestBody::ListBreakpoints => Command::ListBreakpoints,
            RequestBody::ExitChannel => Command::ExitChannel,
            RequestBody::Step(_) => Command::Step,
            RequestBody::StackTrace(_) => Command::StackTrace,
            RequestBody::Variables(_) => Command::Variables,
            RequestBody::Execute(_) => Command::Execute,
            RequestBody::AddBreakpoints(_) => Command::AddBreakpoints,
            RequestBody::AddConditionalBreakpoints(_) => Command::AddConditionalBreakpoints,
            RequestBody::RemoveBreakpoints(_) => Command::RemoveBreakpoints,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequest {
    pub thread_index: u32,
    pub step_type: StepType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceRequest {
    pub thread_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VariablesRequest {
    pub get_child_keys: bool,
    pub thread_index: u32,
    pub stack_frame_index: u32,
    pub variable_path: Vec<String>,
    /// One entry per path segment, `true` meaning the device should match the
    /// segment case-insensitively. `None` when the device does not support
    /// case-sensitivity options.
    pub force_case_insensitive: Option<Vec<bool>>,
}

impl VariablesRequest {
    /// Build a request from user-supplied path segments.
    ///
    /// Segments wrapped in double quotes are matched case-sensitively and
    /// sent without their quotes. Case options are only encoded when
    /// `case_sensitivity_options` is set.
    pub fn from_user_path<S: AsRef<str>>(
        path: &[S],
        case_sensitivity_options: bool,
    ) -> VariablesRequest {
        let (variable_path, insensitive): (Vec<String>, Vec<bool>) = path
            .iter()
            .map(|segment| parse_path_segment(segment.as_ref()))
            .unzip();
        VariablesRequest {
            variable_path,
            force_case_insensitive: case_sensitivity_options.then_some(insensitive),
            ..Default::default()
        }
    }
}

/// Split a path segment into its name and whether it is matched
/// case-insensitively.
pub fn parse_path_segment(segment: &str) -> (String, bool) {
    match segment
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) => (inner.to_string(), false),
        None => (segment.to_string(), true),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub thread_index: u32,
    pub stack_frame_index: u32,
    pub source_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointLocation {
    pub file_path: String,
    pub line_number: u32,
    pub ignore_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddBreakpointsRequest {
    pub breakpoints: Vec<BreakpointLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalBreakpointLocation {
    pub file_path: String,
    pub line_number: u32,
    pub ignore_count: u32,
    pub condition_expression: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddConditionalBreakpointsRequest {
    /// Reserved by the device; always zero today.
    pub flags: u32,
    pub breakpoints: Vec<ConditionalBreakpointLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoveBreakpointsRequest {
    pub breakpoint_ids: Vec<u32>,
}

impl Request {
    pub fn new(request_id: u32, body: RequestBody) -> Self {
        Self { request_id, body }
    }

    pub fn command(&self) -> Command {
        self.body.command()
    }

    /// Encode the request. Requests always carry a packet length.
    pub fn encode(&self) -> Result<BytesMut, CodecError> {
        let mut w = WireWriter::with_packet_length();
        w.put_u32(self.request_id);
        w.put_u32(self.command().code());

        match &self.body {
            RequestBody::Stop
            | RequestBody::Continue
            | RequestBody::Threads
            | RequestBody::ListBreakpoints
            | RequestBody::ExitChannel => {}
            RequestBody::Step(step) => {
                w.put_u32(step.thread_index);
                w.put_u8(step.step_type.code());
            }
            RequestBody::StackTrace(st) => {
                w.put_u32(st.thread_index);
            }
            RequestBody::Variables(vars) => {
                let mut flags = 0;
                if vars.get_child_keys {
                    flags |= variable_request_flags::GET_CHILD_KEYS;
                }
                if vars.force_case_insensitive.is_some() {
                    flags |= variable_request_flags::CASE_SENSITIVITY_OPTIONS;
                }
                w.put_u8(flags);
                w.put_u32(vars.thread_index);
                w.put_u32(vars.stack_frame_index);
                w.put_utf8z_list(&vars.variable_path)?;
                if let Some(options) = &vars.force_case_insensitive {
                    for i in 0..vars.variable_path.len() {
                        w.put_bool(options.get(i).copied().unwrap_or(false));
                    }
                }
            }
            RequestBody::Execute(exec) => {
                w.put_u32(exec.thread_index);
                w.put_u32(exec.stack_frame_index);
                w.put_utf8z(&exec.source_code)?;
            }
            RequestBody::AddBreakpoints(add) => {
                w.put_u32(add.breakpoints.len() as u32);
                for bp in &add.breakpoints {
                    w.put_utf8z(&bp.file_path)?;
                    w.put_u32(bp.line_number);
                    w.put_u32(bp.ignore_count);
                }
            }
            RequestBody::AddConditionalBreakpoints(add) => {
                w.put_u32(add.flags);
                w.put_u32(add.breakpoints.len() as u32);
                for bp in &add.breakpoints {
                    w.put_utf8z(&bp.file_path)?;
                    w.put_u32(bp.line_number);
                    w.put_u32(bp.ignore_count);
                    w.put_utf8z(&bp.condition_expression)?;
                }
            }
            RequestBody::RemoveBreakpoints(remove) => {
                w.put_u32(remove.breakpoint_ids.len() as u32);
                for id in &remove.breakpoint_ids {
                    w.put_u32(*id);
                }
            }
        }

        Ok(w.finish())
    }

    /// Decode one request from the front of `buf`.
    ///
    /// Returns the request and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let packet_length = WireReader::open(buf).read_u32()?;
        if (packet_length as usize) < REQUEST_HEADER_SIZE {
            return Err(DecodeError::InvalidPacketLength(packet_length));
        }
        let len = packet_length as usize;
        if buf.len() < len {
            return Err(DecodeError::Incomplete { needed: len });
        }

        let mut r = WireReader::bounded(&buf[..len]);
        r.skip(4)?;
        let request_id = r.read_u32()?;
        let code = r.read_u32()?;
        let command = Command::from_u32(code).ok_or(DecodeError::UnknownCommand(code))?;

        let body = match command {
            Command::Stop => RequestBody::Stop,
            Command::Continue => RequestBody::Continue,
            Command::Threads => RequestBody::Threads,
            Command::ListBreakpoints => RequestBody::ListBreakpoints,
            Command::ExitChannel => RequestBody::ExitChannel,
            Command::Step => {
                let thread_index = r.read_u32()?;
                let raw = r.read_u8()?;
                let step_type = StepType::from_u8(raw).ok_or(DecodeError::UnknownStepType(raw))?;
                RequestBody::Step(StepRequest {
                    thread_index,
                    step_type,
                })
            }
            Command::StackTrace => RequestBody::StackTrace(StackTraceRequest {
                thread_index: r.read_u32()?,
            }),
            Command::Variables => {
                let flags = r.read_u8()?;
                let thread_index = r.read_u32()?;
                let stack_frame_index = r.read_u32()?;
                let variable_path = r.read_utf8z_list()?;
                let force_case_insensitive =
                    if flags & variable_request_flags::CASE_SENSITIVITY_OPTIONS != 0 {
                        let mut options = Vec::with_capacity(variable_path.len());
                        for _ in 0..variable_path.len() {
                            options.push(r.read_bool()?);
                        }
                        Some(options)
                    } else {
                        None
                    };
                RequestBody::Variables(VariablesRequest {
                    get_child_keys: flags & variable_request_flags::GET_CHILD_KEYS != 0,
                    thread_index,
                    stack_frame_index,
                    variable_path,
                    force_case_insensitive,
                })
            }
            Command::Execute => RequestBody::Execute(ExecuteRequest {
                thread_index: r.read_u32()?,
                stack_frame_index: r.read_u32()?,
                source_code: r.read_utf8z()?,
            }),
            Command::AddBreakpoints => {
                let count = r.read_u32()?;
                let mut breakpoints = Vec::new();
                for _ in 0..count {
                    breakpoints.push(BreakpointLocation {
                        file_path: r.read_utf8z()?,
                        line_number: r.read_u32()?,
                        ignore_count: r.read_u32()?,
                    });
                }
                RequestBody::AddBreakpoints(AddBreakpointsRequest { breakpoints })
            }
            Command::AddConditionalBreakpoints => {
                let flags = r.read_u32()?;
                let count = r.read_u32()?;
                let mut breakpoints = Vec::new();
                for _ in 0..count {
                    breakpoints.push(ConditionalBreakpointLocation {
                        file_path: r.read_utf8z()?,
                        line_number: r.read_u32()?,
                        ignore_count: r.read_u32()?,
                        condition_expression: r.read_utf8z()?,
                    });
                }
                RequestBody::AddConditionalBreakpoints(AddConditionalBreakpointsRequest {
                    flags,
                    breakpoints,
                })
            }
            Command::RemoveBreakpoints => {
                let count = r.read_u32()?;
                let mut breakpoint_ids = Vec::new();
                for _ in 0..count {
                    breakpoint_ids.push(r.read_u32()?);
                }
                RequestBody::RemoveBreakpoints(RemoveBreakpointsRequest { breakpoint_ids })
            }
        };

        Ok((Request { request_id, body }, len))
    }
}
