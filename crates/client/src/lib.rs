//! Client side of the device debug protocol.
//!
//! [`DebugProtocolClient`] owns the control connection: it performs the
//! handshake, correlates responses with requests, tracks whether the program
//! is stopped, reads program output from the IO port and keeps the device's
//! breakpoints in step with the ones set locally.
//!
//! ```ignore
//! let mut client = DebugProtocolClient::new(ClientConfig::load_default()?);
//! let mut events = client.subscribe();
//! client.connect().await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::Suspend { thread_index, .. } = event {
//!         let frames = client.stack_trace(thread_index).await?;
//!     }
//! }
//! ```
mod breakpoints;
mod client;
mod config;
mod error;
mod events;
mod io_port;
mod pending_requests;
mod plugins;
mod state;
mod variables;

pub use breakpoints::{
    Breakpoint, BreakpointDiff, BreakpointManager, BreakpointRequests, BreakpointTarget,
    DeviceBreakpoint, DeviceLocation, PassthroughLocator, SourceBreakpoint, SourceLocator,
    SyncReport, SyncStatus,
};
pub use client::DebugProtocolClient;
pub use config::ClientConfig;
pub use error::ClientError;
pub use events::{ClientEvent, EventBus, EventKind, EventReceiver};
pub use plugins::{ClientPlugin, HookPoint, PluginManager};
pub use state::{ExecutionState, SessionState, ShutdownReason};
pub use variables::{INVALID_VALUE, NOT_DEFINED_VALUE};
