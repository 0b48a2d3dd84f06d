//! Tagged-field payload codec.
//!
//! A payload is a flat sequence of fields, each introduced by a one-byte
//! type marker:
//!
//! ```text
//! 'L' u32   4 bytes big-endian
//! 'R' u64   8 bytes big-endian
//! 't' str   u16 BE byte length, then UTF-8 bytes
//! 'x' bytes u32 BE byte length, then raw bytes
//! '1' bool  true (no value bytes)
//! '0' bool  false (no value bytes)
//! ```
//!
//! Readers consume fields strictly in order; a wrong marker or a field
//! running past the end of the payload is a [`ProtocolError`], never a
//! panic.

use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::Packet;

/// Type marker for a u32 field.
pub const TAG_U32: u8 = b'L';
/// Type marker for a u64 field.
pub const TAG_U64: u8 = b'R';
/// Type marker for a string field.
pub const TAG_STRING: u8 = b't';
/// Type marker for a raw byte field.
pub const TAG_BYTES: u8 = b'x';
/// Type marker for boolean true.
pub const TAG_TRUE: u8 = b'1';
/// Type marker for boolean false.
pub const TAG_FALSE: u8 = b'0';

/// Appends tagged fields to a payload buffer.
///
/// Writes are infallible; size limits are enforced at framing time.
///
/// # Example
///
/// ```rust
/// use tonewire_protocol::{TagReader, TagWriter};
///
/// let mut w = TagWriter::new();
/// w.put_u32(42);
/// w.put_string("default-sink");
/// let packet = w.into_packet();
///
/// let mut r = packet.reader();
/// assert_eq!(r.get_u32().unwrap(), 42);
/// assert_eq!(r.get_string().unwrap(), "default-sink");
/// ```
#[derive(Debug, Default)]
pub struct TagWriter {
    buf: Vec<u8>,
}

impl TagWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a u32 field.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.push(TAG_U32);
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a u64 field.
    pub fn put_u64(&mut self, value: u64) {
        self.buf.push(TAG_U64);
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a string field.
    ///
    /// Strings longer than `u16::MAX` bytes are truncated at the limit on
    /// a character boundary.
    pub fn put_string(&mut self, value: &str) {
        let mut bytes = value.as_bytes();
        if bytes.len() > u16::MAX as usize {
            let mut end = u16::MAX as usize;
            while !value.is_char_boundary(end) {
                end -= 1;
            }
            bytes = &bytes[..end];
        }
        self.buf.push(TAG_STRING);
        self.buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(bytes);
    }

    /// Appends a raw byte field.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.push(TAG_BYTES);
        self.buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(value);
    }

    /// Appends a boolean field.
    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(if value { TAG_TRUE } else { TAG_FALSE });
    }

    /// Returns the number of payload bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finishes the payload and wraps it in a [`Packet`].
    pub fn into_packet(self) -> Packet {
        Packet::from_vec(self.buf)
    }
}

/// Sequential reader over a tagged-field payload.
#[derive(Debug, Clone)]
pub struct TagReader<'a> {
    data: &'a [u8],
}

impl<'a> TagReader<'a> {
    /// Creates a reader over a payload slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Returns the bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        self.data
    }

    /// Returns true if every field has been consumed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> ProtocolResult<&'a [u8]> {
        if self.data.len() < n {
            return Err(ProtocolError::Truncated {
                needed: n,
                remaining: self.data.len(),
            });
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn expect_marker(&mut self, expected: u8) -> ProtocolResult<()> {
        let found = self.take(1)?[0];
        if found != expected {
            return Err(ProtocolError::TypeMismatch { expected, found });
        }
        Ok(())
    }

    /// Reads a u32 field.
    pub fn get_u32(&mut self) -> ProtocolResult<u32> {
        self.expect_marker(TAG_U32)?;
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Reads a u64 field.
    pub fn get_u64(&mut self) -> ProtocolResult<u64> {
        self.expect_marker(TAG_U64)?;
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_be_bytes(bytes))
    }

    /// Reads a string field.
    pub fn get_string(&mut self) -> ProtocolResult<&'a str> {
        self.expect_marker(TAG_STRING)?;
        let raw = self.take(2)?;
        let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)?)
    }

    /// Reads a raw byte field.
    pub fn get_bytes(&mut self) -> ProtocolResult<&'a [u8]> {
        self.expect_marker(TAG_BYTES)?;
        let raw = self.take(4)?;
        let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        self.take(len)
    }

    /// Reads a boolean field.
    pub fn get_bool(&mut self) -> ProtocolResult<bool> {
        let found = self.take(1)?[0];
        match found {
            TAG_TRUE => Ok(true),
            TAG_FALSE => Ok(false),
            found => Err(ProtocolError::TypeMismatch {
                expected: TAG_TRUE,
                found,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_reader_all_field_types() {
        let mut w = TagWriter::new();
        w.put_u32(1234);
        w.put_u64(u64::MAX);
        w.put_string("hello");
        w.put_bytes(&[0xde, 0xad, 0xbe, 0xef]);
        w.put_bool(true);
        w.put_bool(false);
        let packet = w.into_packet();

        let mut r = packet.reader();
        assert_eq!(r.get_u32().unwrap(), 1234);
        assert_eq!(r.get_u64().unwrap(), u64::MAX);
        assert_eq!(r.get_string().unwrap(), "hello");
        assert_eq!(r.get_bytes().unwrap(), &[0xde, 0xad, 0xbe, 0xef]);
        assert!(r.get_bool().unwrap());
        assert!(!r.get_bool().unwrap());
        assert!(r.is_empty());
    }

    #[test]
    fn type_mismatch_reports_markers() {
        let mut w = TagWriter::new();
        w.put_string("not a number");
        let packet = w.into_packet();

        let mut r = packet.reader();
        match r.get_u32() {
            Err(ProtocolError::TypeMismatch { expected, found }) => {
                assert_eq!(expected, TAG_U32);
                assert_eq!(found, TAG_STRING);
            }
            other => panic!("expected type mismatch, got {:?}", other),
        }
    }

    #[test]
    fn truncated_field() {
        // A u32 marker with only two value bytes behind it.
        let data = [TAG_U32, 0x00, 0x01];
        let mut r = TagReader::new(&data);
        assert!(matches!(
            r.get_u32(),
            Err(ProtocolError::Truncated {
                needed: 4,
                remaining: 2
            })
        ));
    }

    #[test]
    fn empty_payload_reads_fail() {
        let mut r = TagReader::new(&[]);
        assert!(matches!(
            r.get_u32(),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(r.is_empty());
    }

    #[test]
    fn string_invalid_utf8() {
        let data = [TAG_STRING, 0x00, 0x02, 0xff, 0xfe];
        let mut r = TagReader::new(&data);
        assert!(matches!(r.get_string(), Err(ProtocolError::InvalidUtf8(_))));
    }

    #[test]
    fn empty_string_and_bytes() {
        let mut w = TagWriter::new();
        w.put_string("");
        w.put_bytes(&[]);
        let packet = w.into_packet();

        let mut r = packet.reader();
        assert_eq!(r.get_string().unwrap(), "");
        assert_eq!(r.get_bytes().unwrap(), &[] as &[u8]);
    }
}
