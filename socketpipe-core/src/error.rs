//! Error taxonomy
//!
//! Shared across the pipe kernel and the socket-facing crate. Every error a
//! pipe, segment buffer, or connection loop can surface to application code
//! is a variant here.

use std::io;
use thiserror::Error;

/// Main error type for socketpipe operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The remote peer reset the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The connection was aborted locally (dispose, cancellation).
    #[error("connection aborted")]
    ConnectionAborted,

    /// Generic wrapped I/O error; also used for anything not otherwise
    /// classified.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Misuse of the API: a second `get_memory`/`read_async` issued before
    /// the matching `advance`/`advance_to`, or an operation on a sealed
    /// pipe.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A constructor argument or position fell outside its valid range.
    #[error("argument out of range: {0}")]
    ArgumentOutOfRange(String),

    /// A marshaller was asked to consume an entire buffer but left
    /// residual, undecoded bytes.
    #[error("incomplete decoding: {0} residual byte(s)")]
    IncompleteDecodingFrame(usize),
}

/// Result type alias for socketpipe operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn argument_out_of_range(msg: impl Into<String>) -> Self {
        Self::ArgumentOutOfRange(msg.into())
    }

    /// Classify a raw socket I/O error the way the receive/send loops do
    /// (spec §4.5 error policy), distinguishing a peer-initiated reset from
    /// a locally observed abort.
    #[must_use]
    pub fn from_socket_error(err: io::Error, externally_aborted: bool) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset => Self::ConnectionReset,
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::InvalidInput
                if !externally_aborted =>
            {
                Self::ConnectionAborted
            }
            _ => Self::Io(err),
        }
    }

    /// Whether this error is one a send-loop in server context is allowed
    /// to swallow and continue past (spec §4.6 step 6).
    #[must_use]
    pub const fn is_ignorable_server_send_error(&self) -> bool {
        matches!(self, Self::ConnectionReset | Self::ConnectionAborted)
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::ConnectionReset => Self::ConnectionReset,
            Self::ConnectionAborted => Self::ConnectionAborted,
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::InvalidOperation(s) => Self::InvalidOperation(s.clone()),
            Self::ArgumentOutOfRange(s) => Self::ArgumentOutOfRange(s.clone()),
            Self::IncompleteDecodingFrame(n) => Self::IncompleteDecodingFrame(*n),
        }
    }
}
