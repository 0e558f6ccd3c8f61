//! Protocol constants.
//!
//! Every numeric value in this module is part of the device's published wire
//! numbering and must not be changed.

use std::fmt;

/// Magic string exchanged during the handshake.
pub const DEBUGGER_MAGIC: &str = "bsdebug";

/// Request id reserved for the handshake so it can share the correlation path.
pub const HANDSHAKE_REQUEST_ID: u32 = u32::MAX;

/// Request id carried by every update.
pub const UPDATE_REQUEST_ID: u32 = 0;

/// Default TCP port of the device debug control socket.
pub const DEFAULT_CONTROL_PORT: u16 = 8081;

/// Request command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Stop = 1,
    Continue = 2,
    Threads = 3,
    StackTrace = 4,
    Variables = 5,
    Step = 6,
    AddBreakpoints = 7,
    ListBreakpoints = 8,
    RemoveBreakpoints = 9,
    Execute = 10,
    AddConditionalBreakpoints = 11,
    ExitChannel = 122,
}

impl Command {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Command::Stop),
            2 => Some(Command::Continue),
            3 => Some(Command::Threads),
            4 => Some(Command::StackTrace),
            5 => Some(Command::Variables),
            6 => Some(Command::Step),
            7 => Some(Command::AddBreakpoints),
            8 => Some(Command::ListBreakpoints),
            9 => Some(Command::RemoveBreakpoints),
            10 => Some(Command::Execute),
            11 => Some(Command::AddConditionalBreakpoints),
            122 => Some(Command::ExitChannel),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Response error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    #[default]
    Ok,
    OtherErr,
    UndefinedCommand,
    CantContinue,
    NotStopped,
    InvalidArgs,
    ThreadDetached,
    ExecutionTimeout,
    /// A code this client does not know about.
    Unknown(u32),
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}

impl From<u32> for ErrorCode {
    fn from(v: u32) -> Self {
        match v {
            0 => ErrorCode::Ok,
            1 => ErrorCode::OtherErr,
            2 => ErrorCode::UndefinedCommand,
            3 => ErrorCode::CantContinue,
            4 => ErrorCode::NotStopped,
            5 => ErrorCode::InvalidArgs,
            6 => ErrorCode::ThreadDetached,
            7 => ErrorCode::ExecutionTimeout,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(v: ErrorCode) -> Self {
        match v {
            ErrorCode::Ok => 0,
            ErrorCode::OtherErr => 1,
            ErrorCode::UndefinedCommand => 2,
            ErrorCode::CantContinue => 3,
            ErrorCode::NotStopped => 4,
            ErrorCode::InvalidArgs => 5,
            ErrorCode::ThreadDetached => 6,
            ErrorCode::ExecutionTimeout => 7,
            ErrorCode::Unknown(other) => other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Ok => f.write_str("OK"),
            ErrorCode::OtherErr => f.write_str("OTHER_ERR"),
            ErrorCode::UndefinedCommand => f.write_str("UNDEFINED_COMMAND"),
            ErrorCode::CantContinue => f.write_str("CANT_CONTINUE"),
            ErrorCode::NotStopped => f.write_str("NOT_STOPPED"),
            ErrorCode::InvalidArgs => f.write_str("INVALID_ARGS"),
            ErrorCode::ThreadDetached => f.write_str("THREAD_DETACHED"),
            ErrorCode::ExecutionTimeout => f.write_str("EXECUTION_TIMEOUT"),
            ErrorCode::Unknown(code) => write!(f, "UNKNOWN({code})"),
        }
    }
}

/// Bit flags carried in the structured error data of a response.
pub mod error_flags {
    pub const INVALID_VALUE_IN_PATH: u32 = 0x0001;
    pub const MISSING_KEY_IN_PATH: u32 = 0x0002;
}

/// Why a thread stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StopReason {
    #[default]
    Undefined,
    NotStopped,
    NormalExit,
    StopStatement,
    Break,
    RuntimeError,
    Unknown(u8),
}

impl StopReason {
    /// Stop reasons that put the session into the stopped state.
    pub fn suspends(self) -> bool {
        matches!(
            self,
            StopReason::RuntimeError | StopReason::Break | StopReason::StopStatement
        )
    }
}

impl From<u8> for StopReason {
    fn from(v: u8) -> Self {
        match v {
            0 => StopReason::Undefined,
            1 => StopReason::NotStopped,
            2 => StopReason::NormalExit,
            3 => StopReason::StopStatement,
            4 => StopReason::Break,
            5 => StopReason::RuntimeError,
            other => StopReason::Unknown(other),
        }
    }
}

impl From<StopReason> for u8 {
    fn from(v: StopReason) -> Self {
        match v {
            StopReason::Undefined => 0,
            StopReason::NotStopped => 1,
            StopReason::NormalExit => 2,
            StopReason::StopStatement => 3,
            StopReason::Break => 4,
            StopReason::RuntimeError => 5,
            StopReason::Unknown(other) => other,
        }
    }
}

/// Kind of step requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepType {
    None,
    /// Step into.
    Line,
    Out,
    Over,
}

impl StepType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(StepType::None),
            1 => Some(StepType::Line),
            2 => Some(StepType::Out),
            3 => Some(StepType::Over),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            StepType::None => 0,
            StepType::Line => 1,
            StepType::Out => 2,
            StepType::Over => 3,
        }
    }
}

/// Update type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateType {
    Undefined,
    IoPortOpened,
    AllThreadsStopped,
    ThreadAttached,
    BreakpointError,
    CompileError,
    BreakpointVerified,
}

impl UpdateType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(UpdateType::Undefined),
            1 => Some(UpdateType::IoPortOpened),
            2 => Some(UpdateType::AllThreadsStopped),
            3 => Some(UpdateType::ThreadAttached),
            4 => Some(UpdateType::BreakpointError),
            5 => Some(UpdateType::CompileError),
            6 => Some(UpdateType::BreakpointVerified),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            UpdateType::Undefined => 0,
            UpdateType::IoPortOpened => 1,
            UpdateType::AllThreadsStopped => 2,
            UpdateType::ThreadAttached => 3,
            UpdateType::BreakpointError => 4,
            UpdateType::CompileError => 5,
            UpdateType::BreakpointVerified => 6,
        }
    }
}

/// Type of a variable as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableType {
    AssociativeArray,
    Array,
    Boolean,
    Double,
    Float,
    Function,
    Integer,
    Interface,
    Invalid,
    List,
    LongInteger,
    Object,
    String,
    Subroutine,
    SubtypedObject,
    Uninitialized,
    Unknown,
    /// A type code this client does not know about.
    Unrecognized(u8),
}

impl VariableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::AssociativeArray => "AssociativeArray",
            VariableType::Array => "Array",
            VariableType::Boolean => "Boolean",
            VariableType::Double => "Double",
            VariableType::Float => "Float",
            VariableType::Function => "Function",
            VariableType::Integer => "Integer",
            VariableType::Interface => "Interface",
            VariableType::Invalid => "Invalid",
            VariableType::List => "List",
            VariableType::LongInteger => "LongInteger",
            VariableType::Object => "Object",
            VariableType::String => "String",
            VariableType::Subroutine => "Subroutine",
            VariableType::SubtypedObject => "SubtypedObject",
            VariableType::Uninitialized => "Uninitialized",
            VariableType::Unknown | VariableType::Unrecognized(_) => "Unknown",
        }
    }
}

impl From<u8> for VariableType {
    fn from(v: u8) -> Self {
        match v {
            1 => VariableType::AssociativeArray,
            2 => VariableType::Array,
            3 => VariableType::Boolean,
            4 => VariableType::Double,
            5 => VariableType::Float,
            6 => VariableType::Function,
            7 => VariableType::Integer,
            8 => VariableType::Interface,
            9 => VariableType::Invalid,
            10 => VariableType::List,
            11 => VariableType::LongInteger,
            12 => VariableType::Object,
            13 => VariableType::String,
            14 => VariableType::Subroutine,
            15 => VariableType::SubtypedObject,
            16 => VariableType::Uninitialized,
            17 => VariableType::Unknown,
            other => VariableType::Unrecognized(other),
        }
    }
}

impl From<VariableType> for u8 {
    fn from(v: VariableType) -> Self {
        match v {
            VariableType::AssociativeArray => 1,
            VariableType::Array => 2,
            VariableType::Boolean => 3,
            VariableType::Double => 4,
            VariableType::Float => 5,
            VariableType::Function => 6,
            VariableType::Integer => 7,
            VariableType::Interface => 8,
            VariableType::Invalid => 9,
            VariableType::List => 10,
            VariableType::LongInteger => 11,
            VariableType::Object => 12,
            VariableType::String => 13,
            VariableType::Subroutine => 14,
            VariableType::SubtypedObject => 15,
            VariableType::Uninitialized => 16,
            VariableType::Unknown => 17,
            VariableType::Unrecognized(other) => other,
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags sent with a variables request.
pub mod variable_request_flags {
    pub const GET_CHILD_KEYS: u8 = 0x01;
    pub const CASE_SENSITIVITY_OPTIONS: u8 = 0x02;
}

/// Flags describing a variable in a variables response.
pub mod variable_flags {
    pub const IS_CHILD_KEY: u8 = 0x01;
    pub const IS_CONST: u8 = 0x02;
    pub const IS_CONTAINER: u8 = 0x04;
    pub const IS_NAME_HERE: u8 = 0x08;
    pub const IS_REF_COUNTED: u8 = 0x10;
    pub const IS_VALUE_HERE: u8 = 0x20;
    pub const IS_KEYS_CASE_SENSITIVE: u8 = 0x40;
}

/// Flag set on a thread that caused the current stop.
pub const THREAD_FLAG_IS_PRIMARY: u8 = 0x01;
