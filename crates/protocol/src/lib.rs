//! Binary debug protocol codec.
//!
//! This crate implements the wire format of the device debug protocol: a
//! little-endian request/response/update protocol carried over a persistent
//! socket, whose framing changed at protocol version 3.0.0.
//!
//! # Architecture
//!
//! - [`Request`], [`Response`], [`Update`] and the handshake types encode and
//!   decode single messages as pure functions over byte slices
//! - [`ClientCodec`] and [`DeviceCodec`] implement tokio-util's `Encoder` and
//!   `Decoder`, accumulating partial reads and framing messages
//! - [`DeviceReader`] and [`DeviceWriter`] wrap the framed halves as a
//!   `Stream` and a `Sink`
//!
//! # Usage
//!
//! ```ignore
//! use futures::StreamExt;
//! use protocol::{HandshakeRequest, Incoming, Outgoing};
//!
//! let (mut reader, mut writer) = protocol::connect("192.168.1.20:8081", pending).await?;
//! writer.send(Outgoing::Handshake(HandshakeRequest::new())).await?;
//!
//! while let Some(msg) = reader.next().await {
//!     match msg? {
//!         Incoming::Handshake(h) => { /* verify magic and version */ }
//!         Incoming::Response(r) => { /* resolve pending request */ }
//!         Incoming::Update(u) => { /* dispatch */ }
//!         Incoming::Undecodable { request_id, .. } => { /* fail the request */ }
//!     }
//! }
//! ```
//!
//! # Scope
//!
//! Only wire concerns live here. Request correlation, execution state and
//! breakpoint bookkeeping belong in the `client` crate.

mod codec;
mod constants;
mod error;
mod handshake;
mod reader;
mod requests;
mod responses;
mod transport;
mod updates;
mod version;
mod wire;
mod writer;

pub mod testing;

pub use codec::{
    ClientCodec, DeviceCodec, DeviceIncoming, DeviceOutgoing, Incoming, NoPending, Outgoing,
    PendingLookup,
};
pub use constants::{
    Command, DEBUGGER_MAGIC, DEFAULT_CONTROL_PORT, ErrorCode, HANDSHAKE_REQUEST_ID, StepType,
    StopReason, THREAD_FLAG_IS_PRIMARY, UPDATE_REQUEST_ID, UpdateType, VariableType, error_flags,
    variable_flags, variable_request_flags,
};
pub use error::{CodecError, DecodeError};
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use reader::DeviceReader;
pub use requests::{
    AddBreakpointsRequest, AddConditionalBreakpointsRequest, BreakpointLocation,
    ConditionalBreakpointLocation, ExecuteRequest, RemoveBreakpointsRequest, Request, RequestBody,
    StackTraceRequest, StepRequest, VariablesRequest, parse_path_segment,
};
pub use responses::{
    BreakpointInfo, BreakpointsResponse, ContainerInfo, ErrorData, ExecuteResponse, Response,
    ResponseBody, StackFrameInfo, StackTraceResponse, ThreadInfo, ThreadsResponse, Variable,
    VariableValue, VariablesResponse,
};
pub use transport::{DeviceTransport, split, split_device};
pub use updates::{
    AllThreadsStopped, BreakpointError, BreakpointVerified, CompileError, IoPortOpened,
    ThreadAttached, Update, UpdateBody,
};
pub use version::{
    FramingMode, ParseVersionError, ProtocolVersion, SUPPORTED_MAX, SUPPORTED_MIN,
    VersionSupport,
};
pub use writer::DeviceWriter;

use std::io;
use std::sync::Arc;

use tokio::net::{TcpStream, ToSocketAddrs};

/// Connect to a device's control port and return a reader/writer pair.
pub async fn connect(
    addr: impl ToSocketAddrs,
    pending: Arc<dyn PendingLookup>,
) -> io::Result<(
    DeviceReader<tokio::net::tcp::OwnedReadHalf>,
    DeviceWriter<tokio::net::tcp::OwnedWriteHalf>,
)> {
    let stream = TcpStream::connect(addr).await?;
    Ok(split(stream, pending))
}
