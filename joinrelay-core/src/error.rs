//! Relay error types
//!
//! Error handling for the join-graph engine.

use std::io;
use thiserror::Error;

/// Main error type for relay engine operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// IO error while adopting, reading, or writing a socket.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// `join`/`unjoin` called with arguments the graph rejects outright.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The context's reactor thread has already been torn down.
    #[error("context is not running")]
    NotRunning,

    /// A user-supplied transform panicked mid-pump.
    #[error("transform panicked: {0}")]
    TransformPanicked(String),

    /// Programmer error: double-stop of a `JoinStream`, or an operation
    /// on a socket the graph does not know about.
    #[error("graph misuse: {0}")]
    GraphMisuse(String),
}

/// Result type alias for relay engine operations.
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Create an invalid-argument error with a message.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a graph-misuse error with a message.
    pub fn graph_misuse(msg: impl Into<String>) -> Self {
        Self::GraphMisuse(msg.into())
    }

    /// True for errors the reactor should simply retry past: would-block
    /// and interrupted reads/writes never change graph state.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// True for errors that should set `close_ready` on the socket that
    /// produced them (reset, broken pipe, and similar).
    #[must_use]
    pub fn is_fatal_to_socket(&self) -> bool {
        matches!(self, Self::Io(_)) && !self.is_transient()
    }
}

/// Classify a raw `io::Error` from a non-blocking syscall without
/// constructing a `RelayError`, for call sites in the hot pump path
/// that want to branch without allocating.
#[must_use]
pub fn io_error_is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
