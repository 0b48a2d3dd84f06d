//! Client error types.

use std::io;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection to the server failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// IO error on the transport.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Wire-format error in a reply payload.
    #[error("protocol error: {0}")]
    Protocol(#[from] tonewire_protocol::ProtocolError),

    /// The server answered with an error reply.
    #[error("server error reply: code {code}")]
    Reply { code: u32 },

    /// The request timed out waiting for a reply.
    #[error("request timed out")]
    Timeout,

    /// The connection closed with the request still outstanding.
    #[error("connection closed")]
    Closed,
}
