use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SiphonError {
    #[error("Unsupported transport: {0:?}")]
    UnsupportedTransport(String),

    #[error("Failed to dial {label}: {source}")]
    Dial {
        label: String,
        #[source]
        source: io::Error,
    },

    #[error("Protocol mismatch: peer speaks {0:?}")]
    ProtocolMismatch(String),

    #[error("Unexpected handshake role: {0:?}")]
    UnexpectedRole(String),

    #[error("Handshake I/O error: {0}")]
    HandshakeIo(#[source] serde_json::Error),

    #[error("Peer closed the connection during handshake")]
    HandshakeClosed,

    #[error("Redirect chain exceeded {0} hops")]
    RedirectLimit(usize),

    #[error("Session I/O error: {0}")]
    SessionIo(#[source] io::Error),

    #[error("Cannot attach: input is not a terminal")]
    NotATerminal,

    #[error("Terminal error: {0}")]
    TerminalError(String),

    #[error("Failed to listen on {label}: {source}")]
    Listen {
        label: String,
        #[source]
        source: io::Error,
    },

    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("PTY error: {0}")]
    PtyError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SiphonError>;

impl From<nix::Error> for SiphonError {
    fn from(err: nix::Error) -> Self {
        SiphonError::PtyError(err.to_string())
    }
}

impl SiphonError {
    /// True for failures that only concern one connection attempt.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            SiphonError::Dial { .. }
                | SiphonError::ProtocolMismatch(_)
                | SiphonError::UnexpectedRole(_)
                | SiphonError::HandshakeIo(_)
                | SiphonError::HandshakeClosed
                | SiphonError::RedirectLimit(_)
        )
    }
}
