//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A field extends past the end of the payload.
    #[error("truncated field: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    /// A field carries a different type marker than the one requested.
    #[error("type mismatch: expected marker '{}', found '{}'", *expected as char, *found as char)]
    TypeMismatch { expected: u8, found: u8 },

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 in string field: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Packet exceeds the maximum allowed size.
    #[error("packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: u32, max: u32 },

    /// A frame with a zero-length payload.
    #[error("empty packet")]
    EmptyPacket,

    /// A frame ended before its declared length.
    #[error("incomplete frame: expected {expected} bytes, got {received}")]
    IncompleteFrame { expected: usize, received: usize },

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
