//! RDB decoder.

use super::{opcode, SnapshotEntry, SnapshotError, MAGIC, STRING_TYPE};
use bytes::Bytes;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A decoded length prefix.
enum Length {
    /// A plain length
    Len(u64),
    /// A special string encoding (`0xC0 | n`)
    Special(u8),
}

/// Cursor over the raw snapshot bytes.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], SnapshotError> {
        if self.remaining() < n {
            return Err(SnapshotError::UnexpectedEof(what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], SnapshotError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, SnapshotError> {
        Ok(self.take(1, what)?[0])
    }

    fn length(&mut self) -> Result<Length, SnapshotError> {
        let first = self.u8("length")?;
        match first >> 6 {
            0b00 => Ok(Length::Len(u64::from(first & 0x3F))),
            0b01 => {
                let second = self.u8("length")?;
                Ok(Length::Len((u64::from(first & 0x3F) << 8) | u64::from(second)))
            }
            0b10 => match first {
                0x80 => Ok(Length::Len(u64::from(u32::from_be_bytes(
                    self.array("length")?,
                )))),
                0x81 => Ok(Length::Len(u64::from_be_bytes(self.array("length")?))),
                other => Err(SnapshotError::InvalidLength(other)),
            },
            _ => Ok(Length::Special(first & 0x3F)),
        }
    }

    /// Reads a length that must be a plain number (db index, table sizes).
    fn length_number(&mut self) -> Result<u64, SnapshotError> {
        match self.length()? {
            Length::Len(n) => Ok(n),
            Length::Special(kind) => Err(SnapshotError::InvalidLength(0xC0 | kind)),
        }
    }

    fn string(&mut self, what: &'static str) -> Result<Bytes, SnapshotError> {
        let integer = match self.length()? {
            Length::Len(n) => {
                let n = usize::try_from(n).map_err(|_| SnapshotError::UnexpectedEof(what))?;
                return Ok(Bytes::copy_from_slice(self.take(n, what)?));
            }
            Length::Special(0) => i64::from(i8::from_le_bytes(self.array(what)?)),
            Length::Special(1) => i64::from(i16::from_le_bytes(self.array(what)?)),
            Length::Special(2) => i64::from(i32::from_le_bytes(self.array(what)?)),
            Length::Special(kind) => return Err(SnapshotError::UnsupportedEncoding(0xC0 | kind)),
        };
        Ok(Bytes::from(integer.to_string()))
    }

    fn header(&mut self) -> Result<(), SnapshotError> {
        let magic = self.take(MAGIC.len(), "header").map_err(|_| SnapshotError::InvalidMagic)?;
        if magic != MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let version = self.take(4, "header").map_err(|_| SnapshotError::InvalidMagic)?;
        if !version.iter().all(u8::is_ascii_digit) {
            return Err(SnapshotError::InvalidMagic);
        }
        Ok(())
    }

    fn key_value(
        &mut self,
        value_type: u8,
        expires_at: Option<SystemTime>,
    ) -> Result<SnapshotEntry, SnapshotError> {
        if value_type != STRING_TYPE {
            return Err(SnapshotError::UnsupportedValueType(value_type));
        }
        let key = self.string("key")?;
        let value = self.string("value")?;
        Ok(SnapshotEntry {
            key,
            value,
            expires_at,
        })
    }
}

/// Decodes a complete snapshot into its key-value entries.
pub fn decode(data: &[u8]) -> Result<Vec<SnapshotEntry>, SnapshotError> {
    let mut reader = Reader::new(data);
    reader.header()?;

    let mut entries = Vec::new();
    loop {
        match reader.u8("opcode")? {
            opcode::AUX => {
                reader.string("aux key")?;
                reader.string("aux value")?;
            }
            opcode::SELECTDB => {
                reader.length_number()?;
            }
            opcode::RESIZEDB => {
                reader.length_number()?;
                reader.length_number()?;
            }
            opcode::EXPIRETIME_MS => {
                let ms = u64::from_le_bytes(reader.array("expiry")?);
                let expires_at = UNIX_EPOCH + Duration::from_millis(ms);
                let value_type = reader.u8("value type")?;
                entries.push(reader.key_value(value_type, Some(expires_at))?);
            }
            opcode::EXPIRETIME => {
                let secs = u32::from_le_bytes(reader.array("expiry")?);
                let expires_at = UNIX_EPOCH + Duration::from_secs(u64::from(secs));
                let value_type = reader.u8("value type")?;
                entries.push(reader.key_value(value_type, Some(expires_at))?);
            }
            opcode::EOF => {
                // Older versions omit the checksum; it is never verified.
                if reader.remaining() >= 8 {
                    reader.take(8, "checksum")?;
                }
                return Ok(entries);
            }
            value_type => entries.push(reader.key_value(value_type, None)?),
        }
    }
}
