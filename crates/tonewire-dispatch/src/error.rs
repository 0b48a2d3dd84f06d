//! Dispatch error types.

use thiserror::Error;
use tonewire_protocol::ProtocolError;

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors reported by [`Dispatcher::run`](crate::Dispatcher::run).
///
/// Every variant is local to the single packet being processed; the
/// engine's registry and table are left untouched. The caller is expected
/// to answer with a protocol-error reply and/or drop the connection.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The command/tag header could not be decoded.
    #[error("malformed packet header: {0}")]
    MalformedHeader(#[source] ProtocolError),

    /// The command code lies outside the dispatch table.
    #[error("command code {command} out of table range")]
    UnknownCommand { command: u32 },

    /// The command code is in range but no handler is bound to it.
    #[error("no handler bound for command {command}")]
    UnhandledCommand { command: u32 },

    /// A handler failed to decode its request payload.
    #[error("bad request payload: {0}")]
    Payload(#[from] ProtocolError),
}
