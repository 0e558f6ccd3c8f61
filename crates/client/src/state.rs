//! Session and execution state.

use std::fmt;

/// Lifecycle of the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    HandshakePending,
    /// Handshake verified; see [`ExecutionState::is_stopped`] for whether the
    /// program is stopped or running.
    Ready,
    ShuttingDown,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::ShuttingDown | SessionState::Closed)
    }
}

/// Where the program is stopped, if it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionState {
    pub is_stopped: bool,
    /// Thread that caused the most recent stop. Negative when unknown.
    pub primary_thread_index: i32,
    pub stack_frame_index: u32,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            is_stopped: false,
            primary_thread_index: -1,
            stack_frame_index: 0,
        }
    }
}

impl ExecutionState {
    pub(crate) fn stop(&mut self, thread_index: i32, reset_frame: bool) {
        self.is_stopped = true;
        self.primary_thread_index = thread_index;
        if reset_frame {
            self.stack_frame_index = 0;
        }
    }
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Requested by the user of the client.
    UserRequest,
    /// The control connection closed or failed.
    AppExit,
    HandshakeMismatch,
    UnsupportedVersion,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UserRequest => f.write_str("user-request"),
            ShutdownReason::AppExit => f.write_str("app-exit"),
            ShutdownReason::HandshakeMismatch => f.write_str("handshake-mismatch"),
            ShutdownReason::UnsupportedVersion => f.write_str("unsupported-version"),
        }
    }
}
