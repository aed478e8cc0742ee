//! RDB encoder.

use super::{opcode, SnapshotEntry, MAGIC, STRING_TYPE, VERSION};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::UNIX_EPOCH;

/// Encodes entries as a single-database snapshot.
///
/// Expiries are written with millisecond precision. The checksum is left as
/// zero, which readers treat as "not computed".
pub fn export(entries: &[SnapshotEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + entries.len() * 32);

    buf.put_slice(MAGIC);
    buf.put_slice(VERSION);
    put_aux(&mut buf, b"redis-ver", b"7.2.0");
    put_aux(&mut buf, b"redis-bits", b"64");

    buf.put_u8(opcode::SELECTDB);
    put_length(&mut buf, 0);

    let expiring = entries.iter().filter(|e| e.expires_at.is_some()).count();
    buf.put_u8(opcode::RESIZEDB);
    put_length(&mut buf, entries.len() as u64);
    put_length(&mut buf, expiring as u64);

    for entry in entries {
        if let Some(expires_at) = entry.expires_at {
            let ms = expires_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            buf.put_u8(opcode::EXPIRETIME_MS);
            buf.put_u64_le(ms);
        }
        buf.put_u8(STRING_TYPE);
        put_string(&mut buf, &entry.key);
        put_string(&mut buf, &entry.value);
    }

    buf.put_u8(opcode::EOF);
    buf.put_u64_le(0);
    buf.freeze()
}

fn put_aux(buf: &mut BytesMut, key: &[u8], value: &[u8]) {
    buf.put_u8(opcode::AUX);
    put_string(buf, key);
    put_string(buf, value);
}

fn put_string(buf: &mut BytesMut, s: &[u8]) {
    put_length(buf, s.len() as u64);
    buf.put_slice(s);
}

fn put_length(buf: &mut BytesMut, len: u64) {
    if len < 1 << 6 {
        buf.put_u8(len as u8);
    } else if len < 1 << 14 {
        buf.put_u8(0x40 | (len >> 8) as u8);
        buf.put_u8((len & 0xFF) as u8);
    } else if len <= u64::from(u32::MAX) {
        buf.put_u8(0x80);
        buf.put_u32(len as u32);
    } else {
        buf.put_u8(0x81);
        buf.put_u64(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::decode;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_empty_export_layout() {
        let bytes = export(&[]);
        assert!(bytes.starts_with(b"REDIS0011"));
        assert!(bytes.ends_with(&[opcode::EOF, 0, 0, 0, 0, 0, 0, 0, 0]));
        assert!(decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_export_then_decode_preserves_expiry_ms() {
        let expires_at = UNIX_EPOCH + Duration::from_millis(1_956_528_000_123);
        let entries = vec![
            SnapshotEntry {
                key: "plain".into(),
                value: "v".into(),
                expires_at: None,
            },
            SnapshotEntry {
                key: "timed".into(),
                value: "w".into(),
                expires_at: Some(expires_at),
            },
        ];

        let decoded = decode(&export(&entries)).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_length_encodings() {
        for len in [0usize, 63, 64, 16_383, 16_384, 70_000] {
            let entry = SnapshotEntry {
                key: "k".into(),
                value: "x".repeat(len).into(),
                expires_at: None,
            };
            let decoded = decode(&export(std::slice::from_ref(&entry))).unwrap();
            assert_eq!(decoded[0].value.len(), len);
        }
    }

    #[test]
    fn test_expiry_before_epoch_clamps() {
        let entry = SnapshotEntry {
            key: "k".into(),
            value: "v".into(),
            expires_at: Some(UNIX_EPOCH - Duration::from_secs(5)),
        };
        let decoded = decode(&export(&[entry])).unwrap();
        assert_eq!(decoded[0].expires_at, Some(UNIX_EPOCH));
        assert!(decoded[0].expires_at.unwrap() < SystemTime::now());
    }
}
