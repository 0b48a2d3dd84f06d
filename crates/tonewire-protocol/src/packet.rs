//! Packet framing.
//!
//! A [`Packet`] owns one decoded payload (header fields plus body). On a
//! byte stream, packets are framed with a 4-byte big-endian length prefix:
//!
//! ```text
//! +----------------+-------------------+
//! | length (4 BE)  |  tagged payload   |
//! +----------------+-------------------+
//! ```

use std::io::{Read, Write};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::tagfield::TagReader;

/// Maximum packet payload size (1 MiB).
pub const MAX_PACKET_SIZE: u32 = 1024 * 1024;

/// One wire packet: an owned tagged-field payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
}

impl Packet {
    /// Wraps a payload buffer in a packet.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Returns the payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a field reader positioned at the start of the payload.
    pub fn reader(&self) -> TagReader<'_> {
        TagReader::new(&self.data)
    }
}

/// Encodes a packet to bytes with length prefix.
///
/// Returns the complete framed packet ready for transmission.
pub fn encode_frame(packet: &Packet) -> ProtocolResult<Vec<u8>> {
    let len = packet.len() as u32;
    if len > MAX_PACKET_SIZE {
        return Err(ProtocolError::PacketTooLarge {
            size: len,
            max: MAX_PACKET_SIZE,
        });
    }

    let mut buffer = Vec::with_capacity(4 + packet.len());
    buffer.extend_from_slice(&len.to_be_bytes());
    buffer.extend_from_slice(packet.data());
    Ok(buffer)
}

/// Decodes a packet from a complete framed buffer (length prefix + payload).
pub fn decode_frame(data: &[u8]) -> ProtocolResult<Packet> {
    if data.len() < 4 {
        return Err(ProtocolError::IncompleteFrame {
            expected: 4,
            received: data.len(),
        });
    }

    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if len > MAX_PACKET_SIZE as usize {
        return Err(ProtocolError::PacketTooLarge {
            size: len as u32,
            max: MAX_PACKET_SIZE,
        });
    }

    if len == 0 {
        return Err(ProtocolError::EmptyPacket);
    }

    if data.len() < 4 + len {
        return Err(ProtocolError::IncompleteFrame {
            expected: 4 + len,
            received: data.len(),
        });
    }

    Ok(Packet::from_vec(data[4..4 + len].to_vec()))
}

/// Reads one framed packet from an async byte stream.
///
/// Returns `Ok(None)` on clean EOF before any bytes of a frame; EOF in
/// the middle of a frame is an error. Both sides of the protocol share
/// this helper so length-cap and empty-frame violations map to the same
/// [`ProtocolError`] variants everywhere.
pub async fn read_frame<R>(reader: &mut R) -> ProtocolResult<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PACKET_SIZE as usize {
        return Err(ProtocolError::PacketTooLarge {
            size: len as u32,
            max: MAX_PACKET_SIZE,
        });
    }
    if len == 0 {
        return Err(ProtocolError::EmptyPacket);
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Packet::from_vec(payload)))
}

/// Writes one framed packet to an async byte stream and flushes it.
pub async fn write_frame<W>(writer: &mut W, packet: &Packet) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = encode_frame(packet)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads framed packets from a byte stream.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: Read> FrameReader<R> {
    /// Creates a new FrameReader wrapping the given reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads a single framed packet.
    ///
    /// Returns `Ok(None)` if the stream is at EOF before any bytes.
    pub fn read_packet(&mut self) -> ProtocolResult<Option<Packet>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_PACKET_SIZE as usize {
            return Err(ProtocolError::PacketTooLarge {
                size: len as u32,
                max: MAX_PACKET_SIZE,
            });
        }

        if len == 0 {
            return Err(ProtocolError::EmptyPacket);
        }

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        Ok(Some(Packet::from_vec(payload)))
    }

    /// Unwraps this FrameReader, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes framed packets to a byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    /// Creates a new FrameWriter wrapping the given writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a single framed packet.
    pub fn write_packet(&mut self, packet: &Packet) -> ProtocolResult<()> {
        let data = encode_frame(packet)?;
        self.writer.write_all(&data)?;
        Ok(())
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> ProtocolResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Unwraps this FrameWriter, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
