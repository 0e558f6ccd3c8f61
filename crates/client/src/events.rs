//! Events emitted by the client.

use std::sync::{Arc, Mutex, PoisonError};

use protocol::{BreakpointError, CompileError, ProtocolVersion, StopReason, VersionSupport};
use tokio::sync::{mpsc, oneshot};

use crate::breakpoints::Breakpoint;
use crate::state::ShutdownReason;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The control socket is open.
    Connected,
    /// The handshake response arrived; `false` means the magic did not match.
    HandshakeVerified(bool),
    ProtocolVersion {
        version: ProtocolVersion,
        support: VersionSupport,
        /// Advice for the user when the version is not fully supported.
        message: Option<String>,
    },
    Suspend {
        thread_index: i32,
        stop_reason: StopReason,
        detail: String,
    },
    RuntimeError {
        thread_index: i32,
        detail: String,
    },
    Continue,
    /// A step request was refused by the device.
    CannotContinue,
    BreakpointsVerified(Vec<Breakpoint>),
    /// Breakpoints whose removal the device refused, restored locally.
    BreakpointsResurrected(Vec<Breakpoint>),
    BreakpointError(BreakpointError),
    CompileError(CompileError),
    /// One line of program output from the IO port.
    IoOutput(String),
    Close(ShutdownReason),
}

/// Discriminant of [`ClientEvent`], used to wait for a particular event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    HandshakeVerified,
    ProtocolVersion,
    Suspend,
    RuntimeError,
    Continue,
    CannotContinue,
    BreakpointsVerified,
    BreakpointsResurrected,
    BreakpointError,
    CompileError,
    IoOutput,
    Close,
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Connected => EventKind::Connected,
            ClientEvent::HandshakeVerified(_) => EventKind::HandshakeVerified,
            ClientEvent::ProtocolVersion { .. } => EventKind::ProtocolVersion,
            ClientEvent::Suspend { .. } => EventKind::Suspend,
            ClientEvent::RuntimeError { .. } => EventKind::RuntimeError,
            ClientEvent::Continue => EventKind::Continue,
            ClientEvent::CannotContinue => EventKind::CannotContinue,
            ClientEvent::BreakpointsVerified(_) => EventKind::BreakpointsVerified,
            ClientEvent::BreakpointsResurrected(_) => EventKind::BreakpointsResurrected,
            ClientEvent::BreakpointError(_) => EventKind::BreakpointError,
            ClientEvent::CompileError(_) => EventKind::CompileError,
            ClientEvent::IoOutput(_) => EventKind::IoOutput,
            ClientEvent::Close(_) => EventKind::Close,
        }
    }
}

#[derive(Default)]
struct Subscribers {
    streams: Vec<mpsc::UnboundedSender<ClientEvent>>,
    once: Vec<(EventKind, oneshot::Sender<ClientEvent>)>,
}

/// Fan-out of client events to any number of receivers.
///
/// Receivers unsubscribe by being dropped.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ClientEvent) {
        tracing::debug!(?event, "emitting event");
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        subs.streams.retain(|tx| tx.send(event.clone()).is_ok());

        let kind = event.kind();
        let (matching, rest): (Vec<_>, Vec<_>) = subs
            .once
            .drain(..)
            .filter(|(_, tx)| !tx.is_closed())
            .partition(|(k, _)| *k == kind);
        subs.once = rest;
        for (_, tx) in matching {
            let _ = tx.send(event.clone());
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .streams
            .push(tx);
        EventReceiver { rx }
    }

    /// Resolve with the next event of `kind`.
    pub fn once(&self, kind: EventKind) -> oneshot::Receiver<ClientEvent> {
        let (tx, rx) = oneshot::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .once
            .push((kind, tx));
        rx
    }
}

/// Async event receiver that wraps tokio mpsc
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl EventReceiver {
    /// Receive next event asynchronously
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }

    /// Receive events until one matches `pred`, discarding the others.
    pub async fn wait_for<F>(&mut self, pred: F) -> Option<ClientEvent>
    where
        F: Fn(&ClientEvent) -> bool,
    {
        while let Some(event) = self.rx.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Convert to a Stream for use with StreamExt
    pub fn into_stream(self) -> impl futures::Stream<Item = ClientEvent> {
        tokio_stream::wrappers::UnboundedReceiverStream::new(self.rx)
    }
}
