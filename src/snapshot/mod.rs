//! Snapshot (RDB) Codec
//!
//! Snapshots are read once at startup to pre-populate the store, and produced
//! on every `PSYNC` to seed a new replica.
//!
//! ## File Layout
//!
//! ```text
//! "REDIS" <4-digit version>
//! 0xFA <aux key> <aux value>          (any number)
//! 0xFE <db number>                    (database selector)
//! 0xFB <table size> <expires size>    (resize hint)
//! [0xFC <u64 LE ms> | 0xFD <u32 LE s>] <type 0x00> <key> <value>
//! ...
//! 0xFF <8-byte checksum>
//! ```
//!
//! Lengths use the RDB variable-length encoding; strings may also be stored
//! as 8/16/32-bit integers. LZF-compressed strings and non-string value
//! types are rejected.

pub mod decoder;
pub mod encoder;

pub use decoder::decode;
pub use encoder::export;

use crate::storage::{Entry, StorageEngine};
use bytes::Bytes;
use std::path::Path;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info};

/// Opcodes of the RDB format.
pub mod opcode {
    pub const AUX: u8 = 0xFA;
    pub const RESIZEDB: u8 = 0xFB;
    pub const EXPIRETIME_MS: u8 = 0xFC;
    pub const EXPIRETIME: u8 = 0xFD;
    pub const SELECTDB: u8 = 0xFE;
    pub const EOF: u8 = 0xFF;
}

/// Value type byte for plain strings, the only type RelayKV stores.
pub const STRING_TYPE: u8 = 0x00;

/// Magic bytes at the start of every snapshot.
pub const MAGIC: &[u8] = b"REDIS";

/// Version written by [`export`].
pub const VERSION: &[u8] = b"0011";

/// One key decoded from, or destined for, a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub expires_at: Option<SystemTime>,
}

impl From<(Bytes, Entry)> for SnapshotEntry {
    fn from((key, entry): (Bytes, Entry)) -> Self {
        Self {
            key,
            value: entry.value,
            expires_at: entry.expires_at,
        }
    }
}

/// Errors raised while reading a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The data does not start with `REDIS` and a 4-digit version
    #[error("invalid snapshot header")]
    InvalidMagic,

    /// The data ended in the middle of a section
    #[error("unexpected end of snapshot while reading {0}")]
    UnexpectedEof(&'static str),

    /// A length prefix used a reserved encoding
    #[error("invalid length encoding: {0:#04x}")]
    InvalidLength(u8),

    /// A string used an encoding this codec does not support (LZF)
    #[error("unsupported string encoding: {0:#04x}")]
    UnsupportedEncoding(u8),

    /// A value type other than plain string
    #[error("unsupported value type: {0:#04x}")]
    UnsupportedValueType(u8),
}

/// Reads and decodes the snapshot at `path`.
pub fn load(path: &Path) -> Result<Vec<SnapshotEntry>, SnapshotError> {
    let data = std::fs::read(path)?;
    decode(&data)
}

/// Loads the snapshot at `path` into `engine`.
///
/// A missing file leaves the store empty. Entries already past their expiry
/// are skipped.
///
/// # Returns
///
/// The number of keys loaded.
pub fn load_into(engine: &StorageEngine, path: &Path) -> Result<usize, SnapshotError> {
    if !path.exists() {
        info!(path = %path.display(), "No snapshot found, starting empty");
        return Ok(0);
    }

    let entries = load(path)?;
    let loaded = restore(engine, entries);
    info!(path = %path.display(), keys = loaded, "Snapshot loaded");
    Ok(loaded)
}

/// Inserts decoded entries into the store, skipping expired ones.
pub fn restore(engine: &StorageEngine, entries: Vec<SnapshotEntry>) -> usize {
    let now = SystemTime::now();
    let mut loaded = 0;

    for entry in entries {
        if entry.expires_at.is_some_and(|exp| exp <= now) {
            debug!(key = ?entry.key, "Skipping expired snapshot entry");
            continue;
        }
        engine.set_with_expiry(entry.key, entry.value, entry.expires_at);
        loaded += 1;
    }

    loaded
}

/// Encodes the live contents of the store as a snapshot.
pub fn capture(engine: &StorageEngine) -> Bytes {
    let entries: Vec<SnapshotEntry> = engine
        .entries()
        .into_iter()
        .map(SnapshotEntry::from)
        .collect();
    export(&entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("relaykv-{}-{}.rdb", name, std::process::id()))
    }

    #[test]
    fn test_capture_then_restore() {
        let source = StorageEngine::new();
        source.set("foo", "bar", 0);
        source.set("session", "abc", 60_000);

        let bytes = capture(&source);

        let target = StorageEngine::new();
        let loaded = restore(&target, decode(&bytes).unwrap());
        assert_eq!(loaded, 2);
        assert_eq!(target.get("foo").unwrap(), "bar");
        assert_eq!(target.get("session").unwrap(), "abc");
    }

    #[test]
    fn test_restore_skips_expired() {
        let engine = StorageEngine::new();
        let entries = vec![
            SnapshotEntry {
                key: "live".into(),
                value: "1".into(),
                expires_at: Some(SystemTime::now() + Duration::from_secs(60)),
            },
            SnapshotEntry {
                key: "dead".into(),
                value: "2".into(),
                expires_at: Some(UNIX_EPOCH + Duration::from_secs(1)),
            },
        ];

        assert_eq!(restore(&engine, entries), 1);
        assert!(engine.get("dead").is_err());
        assert_eq!(engine.get("live").unwrap(), "1");
    }

    #[test]
    fn test_capture_keeps_binary_values() {
        let source = StorageEngine::new();
        source.set(Bytes::from_static(b"\x00key"), Bytes::from_static(b"\xff\xfe"), 0);

        let target = StorageEngine::new();
        restore(&target, decode(&capture(&source)).unwrap());
        assert_eq!(target.get(b"\x00key").unwrap(), Bytes::from_static(b"\xff\xfe"));
    }

    #[test]
    fn test_load_into_missing_file_is_empty() {
        let engine = StorageEngine::new();
        let path = temp_path("missing");
        let _ = std::fs::remove_file(&path);

        assert_eq!(load_into(&engine, &path).unwrap(), 0);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_load_into_from_file() {
        let source = StorageEngine::new();
        source.set("a", "1", 0);
        source.set("b", "2", 0);

        let path = temp_path("roundtrip");
        std::fs::write(&path, capture(&source)).unwrap();

        let engine = StorageEngine::new();
        assert_eq!(load_into(&engine, &path).unwrap(), 2);
        assert_eq!(engine.get("b").unwrap(), "2");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_into_rejects_garbage() {
        let path = temp_path("garbage");
        std::fs::write(&path, b"not a snapshot").unwrap();

        let engine = StorageEngine::new();
        assert!(matches!(
            load_into(&engine, &path),
            Err(SnapshotError::InvalidMagic)
        ));

        std::fs::remove_file(&path).unwrap();
    }
}
