//! Wire format for the tonewire audio control protocol.
//!
//! This crate defines the byte-level layer shared by the client and the
//! server:
//!
//! - Tagged-field payloads ([`TagWriter`] / [`TagReader`]): flat sequences
//!   of type-marked values.
//! - Packet framing ([`Packet`], [`encode_frame`], [`decode_frame`]):
//!   4-byte big-endian length prefix in front of each payload.
//! - The message header ([`MessageHeader`]): a command code and an opaque
//!   correlation tag, always the first two fields of a payload.
//!
//! # Example
//!
//! ```rust
//! use tonewire_protocol::{command, MessageHeader};
//!
//! let packet = command::request(command::COMMAND_PING, 42).into_packet();
//! let mut r = packet.reader();
//! let header = MessageHeader::read(&mut r).unwrap();
//! assert_eq!(header.tag, 42);
//! assert!(!header.is_reply());
//! ```

pub mod command;
mod error;
mod packet;
mod tagfield;

pub use command::MessageHeader;

/// Protocol version negotiated during auth.
pub const PROTOCOL_VERSION: u32 = 1;

pub use error::{ProtocolError, ProtocolResult};
pub use packet::{
    FrameReader, FrameWriter, MAX_PACKET_SIZE, Packet, decode_frame, encode_frame, read_frame,
    write_frame,
};
pub use tagfield::{TagReader, TagWriter};
