//! Command codes and the message header.
//!
//! Every packet starts with two u32 fields: the command code and the tag.
//! Two codes are reserved sentinels marking the packet as a reply to an
//! earlier request; every other code names a request kind. The tag is an
//! opaque correlation key chosen by whoever sent the request.

use crate::error::ProtocolResult;
use crate::packet::Packet;
use crate::tagfield::{TagReader, TagWriter};

/// Sentinel: this packet is an error reply. Payload starts with an
/// [`error_code`] field.
pub const COMMAND_ERROR: u32 = 0;
/// Sentinel: this packet is a successful reply.
pub const COMMAND_REPLY: u32 = 1;

/// Authenticate the connection (cookie bytes).
pub const COMMAND_AUTH: u32 = 2;
/// Set the client application name (string).
pub const COMMAND_SET_CLIENT_NAME: u32 = 3;
/// Liveness probe; replied to with an empty payload.
pub const COMMAND_PING: u32 = 4;
/// Query server counters.
pub const COMMAND_STAT: u32 = 5;
/// Look up a sink by name.
pub const COMMAND_LOOKUP_SINK: u32 = 6;

/// One past the highest assigned command code; the natural size for a
/// full dispatch table.
pub const COMMAND_MAX: u32 = 7;

/// Error codes carried in the first field of an error reply.
pub mod error_code {
    /// Access denied.
    pub const ACCESS: u32 = 1;
    /// Operation not supported by this server.
    pub const NOT_SUPPORTED: u32 = 2;
    /// The peer violated the protocol.
    pub const PROTOCOL: u32 = 3;
    /// No such entity (sink, source, client).
    pub const NO_ENTITY: u32 = 4;
    /// The request timed out.
    pub const TIMEOUT: u32 = 5;
}

/// Decoded packet header: command code and correlation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Command code, or one of the reply sentinels.
    pub command: u32,
    /// Correlation tag, passed through unmodified on the request path.
    pub tag: u32,
}

impl MessageHeader {
    /// Reads the header from the start of a payload.
    pub fn read(reader: &mut TagReader<'_>) -> ProtocolResult<Self> {
        let command = reader.get_u32()?;
        let tag = reader.get_u32()?;
        Ok(Self { command, tag })
    }

    /// Appends the header to a payload.
    pub fn write(&self, writer: &mut TagWriter) {
        writer.put_u32(self.command);
        writer.put_u32(self.tag);
    }

    /// Returns true if the command is one of the reply sentinels.
    pub fn is_reply(&self) -> bool {
        matches!(self.command, COMMAND_ERROR | COMMAND_REPLY)
    }
}

/// Starts a request packet for `command` correlated by `tag`.
pub fn request(command: u32, tag: u32) -> TagWriter {
    let mut w = TagWriter::new();
    MessageHeader { command, tag }.write(&mut w);
    w
}

/// Starts a successful reply packet for `tag`.
pub fn reply_to(tag: u32) -> TagWriter {
    request(COMMAND_REPLY, tag)
}

/// Builds a complete error reply packet for `tag`.
pub fn error_to(tag: u32, code: u32) -> Packet {
    let mut w = request(COMMAND_ERROR, tag);
    w.put_u32(code);
    w.into_packet()
}
