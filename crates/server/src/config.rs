use protocol::{DEBUGGER_MAGIC, ProtocolVersion};

/// How the device answers the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub protocol_version: ProtocolVersion,
    pub magic: String,
    /// Firmware build time in milliseconds, sent from 3.0.0 onward.
    pub revision_timestamp: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V3_2_0,
            magic: DEBUGGER_MAGIC.to_string(),
            revision_timestamp: 0,
        }
    }
}

impl ServerConfig {
    pub fn with_version(protocol_version: ProtocolVersion) -> Self {
        Self {
            protocol_version,
            ..Self::default()
        }
    }
}
