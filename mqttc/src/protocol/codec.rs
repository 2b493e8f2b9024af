//! MQTT packet encoding/decoding utilities.
//!
//! Low-level helpers for MQTT protocol primitives: the remaining-length
//! variable integer, big-endian u16 and length-prefixed strings.

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::types::PacketType;

/// Largest value the remaining-length field can carry (four bytes).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Result type for codec helpers.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Read a variable-length integer (remaining length encoding).
///
/// Returns `Ok(None)` if the buffer ends before the last byte.
/// A continuation bit on the fourth byte is malformed.
pub fn read_variable_int(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        value += (byte & 0x7F) as usize * multiplier;

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }

        if i == 3 {
            return Err(ProtocolError::MalformedRemainingLength);
        }

        multiplier *= 128;
    }

    Ok(None)
}

/// Write a variable-length integer.
///
/// Returns the number of bytes written.
pub fn write_variable_int(buf: &mut BytesMut, mut value: usize) -> Result<usize> {
    if value > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PacketTooLarge { size: value, max: MAX_REMAINING_LENGTH });
    }

    let mut written = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;

        if value > 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);
        written += 1;

        if value == 0 {
            return Ok(written);
        }
    }
}

/// Calculate the number of bytes needed for a variable-length integer.
pub const fn variable_int_len(value: usize) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Write a UTF-8 string (2-byte length prefix + data).
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    write_binary(buf, s.as_bytes())
}

/// Write binary data (2-byte length prefix + data).
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    if data.len() > u16::MAX as usize {
        return Err(ProtocolError::FieldTooLong(data.len()));
    }
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

/// Parsed fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: usize,
    /// Bytes taken by the type byte plus the remaining-length field.
    pub header_length: usize,
}

impl FixedHeader {
    /// Total frame length (header plus remaining length).
    pub fn frame_length(&self) -> usize {
        self.header_length + self.remaining_length
    }
}

/// Parse a fixed header from buffer.
///
/// `Ok(None)` means more bytes are needed to finish the header.
pub fn read_fixed_header(buf: &[u8]) -> Result<Option<FixedHeader>> {
    let Some(&first_byte) = buf.first() else {
        return Ok(None);
    };

    let packet_type_byte = first_byte >> 4;
    let flags = first_byte & 0x0F;

    let packet_type = PacketType::from_u8(packet_type_byte)
        .ok_or(ProtocolError::InvalidPacketType(packet_type_byte))?;

    if let Some(required) = packet_type.required_flags() {
        if flags != required {
            return Err(ProtocolError::InvalidFlags { packet_type: packet_type_byte, flags });
        }
    }

    let Some((remaining_length, var_len)) = read_variable_int(&buf[1..])? else {
        return Ok(None);
    };

    Ok(Some(FixedHeader {
        packet_type,
        flags,
        remaining_length,
        header_length: 1 + var_len,
    }))
}

/// Write a fixed header to buffer.
pub fn write_fixed_header(
    buf: &mut BytesMut,
    packet_type: PacketType,
    flags: u8,
    remaining_length: usize,
) -> Result<usize> {
    buf.put_u8(((packet_type as u8) << 4) | (flags & 0x0F));
    let var_len = write_variable_int(buf, remaining_length)?;
    Ok(1 + var_len)
}

/// Cursor over the variable header and payload of one complete frame.
///
/// Running short inside a complete frame means the length fields disagree,
/// so every read failure is an `InconsistentLength` error.
pub struct Body<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Body<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(ProtocolError::InconsistentLength(field))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self, field: &'static str) -> Result<u16> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_binary(&mut self, field: &'static str) -> Result<&'a [u8]> {
        let len = self.read_u16(field)? as usize;
        self.take(len, field)
    }

    pub fn read_string(&mut self, field: &'static str) -> Result<&'a str> {
        let bytes = self.read_binary(field)?;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Everything not read yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Fail unless every byte was consumed.
    pub fn finish(&self, field: &'static str) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::InconsistentLength(field))
        }
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::InconsistentLength(field));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}
