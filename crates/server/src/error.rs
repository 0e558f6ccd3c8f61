use protocol::{CodecError, Command};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The client closed the control connection.
    #[error("client disconnected")]
    Disconnected,

    #[error("expected {expected}, received {received}")]
    UnexpectedMessage {
        expected: &'static str,
        received: String,
    },

    #[error("expected a {expected} request, received {received}")]
    UnexpectedCommand { expected: Command, received: Command },
}
