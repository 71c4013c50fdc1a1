//! Error types for avlink.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Channel-level, framing-level, and
//! configuration errors are all captured here.

/// The error type for all avlink operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port, TCP socket, IR gateway).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error raised while interpreting an inbound message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out while establishing a connection.
    #[error("timeout waiting for response")]
    Timeout,

    /// An invalid configuration value or payload.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The channel has not been connected, or was closed.
    #[error("not connected")]
    NotConnected,

    /// The connection to the device was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An HTTP request could not be issued or completed.
    #[error("http error: {0}")]
    Http(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a data-path I/O error to the matching variant.
    ///
    /// Reset, abort, and broken-pipe errors mean the peer is gone and are
    /// reported as [`Error::ConnectionLost`]; everything else stays [`Error::Io`].
    pub fn from_io(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::ConnectionAborted => Error::ConnectionLost,
            _ => Error::Io(e),
        }
    }
}
