//! Tracking pending requests and matching responses
//!
//! When a request is sent it is added to the pending map before any byte is
//! written. When a response arrives it is matched by request id and sent to
//! the waiting caller. The codec consults the same map to learn which command
//! a response answers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use protocol::{Command, HandshakeResponse, PendingLookup, Response};
use tokio::sync::oneshot;

use crate::error::ClientError;

/// What a pending request resolves with.
#[derive(Debug)]
pub(crate) enum Reply {
    Handshake(HandshakeResponse),
    Response(Response),
}

pub(crate) type ReplySender = oneshot::Sender<Result<Reply, ClientError>>;

struct PendingRequest {
    /// `None` for the handshake, which is not a command.
    command: Option<Command>,
    sent_at: Instant,
    tx: ReplySender,
}

/// Tracker for in-flight requests, keyed by request id.
#[derive(Default)]
pub(crate) struct PendingRequests {
    pending: Mutex<HashMap<u32, PendingRequest>>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, request_id: u32, command: Option<Command>, tx: ReplySender) {
        self.lock().insert(
            request_id,
            PendingRequest {
                command,
                sent_at: Instant::now(),
                tx,
            },
        );
    }

    /// Hand `reply` to whoever is waiting for `request_id`.
    ///
    /// Returns false when nobody is waiting.
    pub(crate) fn resolve(&self, request_id: u32, reply: Reply) -> bool {
        let Some(pending) = self.lock().remove(&request_id) else {
            tracing::warn!(request_id, "no pending request for reply");
            return false;
        };
        tracing::debug!(
            request_id,
            command = ?pending.command,
            elapsed = ?pending.sent_at.elapsed(),
            "request resolved"
        );
        let _ = pending.tx.send(Ok(reply));
        true
    }

    /// Fail the request waiting for `request_id` with `error`.
    pub(crate) fn reject(&self, request_id: u32, error: ClientError) -> bool {
        let Some(pending) = self.lock().remove(&request_id) else {
            tracing::warn!(request_id, "no pending request to fail");
            return false;
        };
        tracing::debug!(request_id, command = ?pending.command, %error, "request failed");
        let _ = pending.tx.send(Err(error));
        true
    }

    pub(crate) fn remove(&self, request_id: u32) -> bool {
        self.lock().remove(&request_id).is_some()
    }

    /// Fail every outstanding request with `ConnectionClosed`.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending requests");
        }
        for (_, pending) in drained {
            let _ = pending.tx.send(Err(ClientError::ConnectionClosed));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

impl PendingLookup for PendingRequests {
    fn command_for(&self, request_id: u32) -> Option<Command> {
        self.lock().get(&request_id).and_then(|p| p.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{ErrorCode, ResponseBody};

    #[tokio::test]
    async fn resolves_by_request_id() {
        let pending = PendingRequests::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.insert(1, Some(Command::Threads), tx1);
        pending.insert(2, Some(Command::Stop), tx2);

        assert_eq!(pending.command_for(2), Some(Command::Stop));
        assert!(pending.resolve(2, Reply::Response(Response::ok(2, ResponseBody::Empty))));
        assert!(!pending.resolve(2, Reply::Response(Response::ok(2, ResponseBody::Empty))));

        match rx2.await.unwrap().unwrap() {
            Reply::Response(r) => assert_eq!(r.request_id, 2),
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(pending.len(), 1);

        pending.fail_all();
        assert!(matches!(
            rx1.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn removed_requests_are_stale() {
        let pending = PendingRequests::new();
        let (tx, _rx) = oneshot::channel();
        pending.insert(7, Some(Command::Variables), tx);
        assert!(pending.remove(7));
        assert_eq!(pending.command_for(7), None);
        assert!(!pending.resolve(7, Reply::Response(Response::error(7, ErrorCode::InvalidArgs))));
    }
}
