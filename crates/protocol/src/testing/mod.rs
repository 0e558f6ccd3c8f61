//! Testing utilities for the protocol layer.
//!
//! - [`MemoryTransport`]: in-memory transport pair for connecting a client to
//!   a device endpoint without a socket

mod memory;

pub use memory::MemoryTransport;
