//! Client configuration.
//!
//! Configuration is read from a TOML file. Every field has a default, so an
//! empty or missing file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::WrapErr;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Address of the device.
    pub host: String,
    pub control_port: u16,
    /// Delay between attempts to open the control socket.
    pub connect_retry_interval_ms: u64,
    /// How long to wait for the device to acknowledge `ExitChannel`.
    pub exit_channel_timeout_ms: u64,
    /// How long to wait for each socket to close during shutdown.
    pub socket_close_timeout_ms: u64,
    /// Send the handshake as soon as the control socket is open.
    pub auto_handshake: bool,
    /// Report the first stop of the session. When false the client continues
    /// past it automatically.
    pub stop_on_entry: bool,
    /// Connect to the IO port when the device opens it and forward program
    /// output as events.
    pub io_output: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            control_port: protocol::DEFAULT_CONTROL_PORT,
            connect_retry_interval_ms: 200,
            exit_channel_timeout_ms: 1_000,
            socket_close_timeout_ms: 500,
            auto_handshake: true,
            stop_on_entry: true,
            io_output: true,
        }
    }
}

impl ClientConfig {
    /// Default location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("devdbg").join("config.toml"))
    }

    /// Load configuration from `path`.
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&contents).wrap_err_with(|| format!("parsing {}", path.display()))
    }

    /// Load configuration from the default location, falling back to the
    /// defaults when there is no file.
    pub fn load_default() -> eyre::Result<Self> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(path),
            Some(path) => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            None => {
                tracing::warn!("cannot determine config directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_toml(contents: &str) -> eyre::Result<Self> {
        toml::from_str(contents).wrap_err("invalid configuration")
    }

    pub fn control_address(&self) -> (String, u16) {
        (self.host.clone(), self.control_port)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    pub fn exit_channel_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_channel_timeout_ms)
    }

    pub fn socket_close_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_close_timeout_ms)
    }
}
