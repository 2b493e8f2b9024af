//! Stream framing.
//!
//! Transports hand over bytes in whatever chunks they like. `StreamDecoder`
//! buffers them and yields whole packets in arrival order.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ProtocolError, Result};

use super::v4::Packet;

/// Incremental packet decoder.
#[derive(Debug)]
pub struct StreamDecoder {
    buf: BytesMut,
    max_packet_size: usize,
}

impl StreamDecoder {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_packet_size,
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete packet.
    ///
    /// `Ok(None)` means the buffered bytes end mid-frame. After an error the
    /// stream is unusable and the caller must drop the connection.
    pub fn next_packet(&mut self) -> std::result::Result<Option<Packet>, ProtocolError> {
        match Packet::decode(&self.buf, self.max_packet_size)? {
            Some((packet, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop buffered bytes, e.g. when a new connection starts.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Read a single packet from an async reader.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut StreamDecoder,
) -> Result<Packet> {
    loop {
        if let Some(packet) = decoder.next_packet()? {
            return Ok(packet);
        }

        let mut tmp = [0u8; 4096];
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed("end of stream".to_string()));
        }
        decoder.feed(&tmp[..n]);
    }
}

/// Write a single packet to an async writer.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
    max_size: usize,
) -> Result<()> {
    let size = packet.size()?;
    if size > max_size {
        return Err(Error::PacketTooLarge { size, max: max_size });
    }
    let mut buf = BytesMut::with_capacity(size);
    packet.encode(&mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
