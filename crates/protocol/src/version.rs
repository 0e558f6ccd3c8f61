//! Protocol versions and the features they gate.

use std::fmt;
use std::str::FromStr;

/// A semantic protocol version negotiated during the handshake.
///
/// Field order matters: the derived ordering compares major, then minor,
/// then patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const V3_0_0: ProtocolVersion = ProtocolVersion::new(3, 0, 0);
    pub const V3_1_0: ProtocolVersion = ProtocolVersion::new(3, 1, 0);
    pub const V3_2_0: ProtocolVersion = ProtocolVersion::new(3, 2, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Wire shape used by messages of this version.
    pub fn framing(&self) -> FramingMode {
        if *self >= Self::V3_0_0 {
            FramingMode::V3
        } else {
            FramingMode::Legacy
        }
    }

    pub fn has_packet_length(&self) -> bool {
        self.framing() == FramingMode::V3
    }

    pub fn supports_error_data(&self) -> bool {
        *self >= Self::V3_1_0
    }

    pub fn supports_conditional_breakpoints(&self) -> bool {
        *self >= Self::V3_1_0
    }

    pub fn supports_case_sensitivity_options(&self) -> bool {
        *self >= Self::V3_1_0
    }

    pub fn supports_component_library_breakpoints(&self) -> bool {
        *self >= Self::V3_1_0
    }

    /// Whether the `isPrimary` thread flag can be trusted.
    pub fn has_reliable_primary_flag(&self) -> bool {
        *self >= Self::V3_1_0
    }

    pub fn supports_breakpoint_verification(&self) -> bool {
        *self >= Self::V3_2_0
    }

    pub fn supports_breakpoint_registration_while_running(&self) -> bool {
        *self >= Self::V3_2_0
    }

    /// Classify this version against the range the client was built for.
    pub fn support(&self) -> VersionSupport {
        if *self >= SUPPORTED_MIN && *self <= SUPPORTED_MAX {
            VersionSupport::Supported
        } else if *self > SUPPORTED_MAX {
            VersionSupport::Untested
        } else {
            VersionSupport::Unsupported
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error returned when parsing a version string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid protocol version '{0}'")]
pub struct ParseVersionError(String);

impl FromStr for ProtocolVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = || -> Result<u32, ParseVersionError> {
            parts
                .next()
                .unwrap_or("0")
                .parse()
                .map_err(|_| ParseVersionError(s.to_string()))
        };
        Ok(Self::new(next()?, next()?, next()?))
    }
}

/// Lowest version the client supports.
pub const SUPPORTED_MIN: ProtocolVersion = ProtocolVersion::new(1, 0, 0);
/// Highest version the client has been tested against.
pub const SUPPORTED_MAX: ProtocolVersion = ProtocolVersion::V3_2_0;

/// Which of the two wire shapes a message uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramingMode {
    /// Pre-3.0.0: no packet length on responses or updates.
    Legacy,
    /// 3.0.0 and later: every message starts with its packet length.
    V3,
}

/// Result of comparing the device version to the supported range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSupport {
    Supported,
    /// Newer than anything tested. Advisory only.
    Untested,
    /// Outside the range the client can talk to. Fatal.
    Unsupported,
}
