//! Server error types.

use std::io;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket, file, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Wire-format error (framing, field decoding).
    #[error("protocol error: {0}")]
    Protocol(#[from] tonewire_protocol::ProtocolError),

    /// The peer violated the dispatch contract (bad header, unknown
    /// command); the connection is closed in response.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] tonewire_dispatch::DispatchError),

    /// Socket path already in use.
    #[error("socket path already in use: {path}")]
    SocketInUse { path: String },

    /// Socket path parent directory does not exist.
    #[error("socket path parent directory does not exist: {path}")]
    SocketPathInvalid { path: String },

    /// Server shutdown requested.
    #[error("server shutdown requested")]
    Shutdown,
}

impl ServerError {
    /// Creates a socket in use error.
    pub fn socket_in_use(path: impl Into<String>) -> Self {
        Self::SocketInUse { path: path.into() }
    }

    /// Creates a socket path invalid error.
    pub fn socket_path_invalid(path: impl Into<String>) -> Self {
        Self::SocketPathInvalid { path: path.into() }
    }
}
