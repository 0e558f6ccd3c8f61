//! Device side of the debug protocol.
//!
//! [`DeviceServer`] answers the handshake, decodes requests and writes
//! responses and updates the way a device does. It stands in for a real
//! device in tests and for local experiments with the client.
mod config;
mod error;
mod plugins;
mod server;

pub use config::ServerConfig;
pub use error::ServerError;
pub use plugins::ServerPlugin;
pub use server::{DeviceListener, DeviceServer, IoChannel, IoPort};
