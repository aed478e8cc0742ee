//! Thread-Safe Storage Engine with Expiry Support
//!
//! This module implements the key-value store behind every connection.
//!
//! ## Design Decisions
//!
//! 1. **One RwLock**: all keys live in a single map. Reads overlap, writes and
//!    lazy deletions are exclusive.
//! 2. **Lazy Expiry**: an expired entry is logically absent and is removed by
//!    the next `get` that observes it. There is no background sweep.
//! 3. **Absolute Expiry**: entries carry a wall-clock deadline so they can be
//!    written to and read from snapshots unchanged.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │            StorageEngine              │
//! │  ┌─────────────────────────────────┐  │
//! │  │  RwLock<HashMap<Bytes, Entry>>  │  │
//! │  └─────────────────────────────────┘  │
//! │  get/set/expired counters (atomics)   │
//! └───────────────────────────────────────┘
//! ```

use crate::storage::pattern::GlobPattern;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Errors returned by store lookups.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The key is absent, or was present but expired.
    #[error("key not found: {0}")]
    KeyNotFound(String),
}

impl StorageError {
    fn not_found(key: &[u8]) -> Self {
        StorageError::KeyNotFound(String::from_utf8_lossy(key).into_owned())
    }
}

/// Represents a stored value with an optional expiry time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The actual value stored
    pub value: Bytes,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<SystemTime>,
}

impl Entry {
    /// Creates a new entry without expiry.
    pub fn new(value: Bytes) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    /// Creates a new entry expiring `ttl` from now.
    pub fn with_ttl(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(SystemTime::now() + ttl),
        }
    }

    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    #[inline]
    fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }
}

/// Store statistics, reported by `INFO`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of entries in the map (expired-but-unread included)
    pub keys: u64,
    /// Total GET operations
    pub get_ops: u64,
    /// Total SET operations
    pub set_ops: u64,
    /// Total DEL operations
    pub del_ops: u64,
    /// Total entries removed because they expired
    pub expired: u64,
}

/// The key-value store.
///
/// Designed to be wrapped in an `Arc` and shared by every connection task.
///
/// # Example
///
/// ```
/// use relaykv::storage::StorageEngine;
///
/// let engine = StorageEngine::new();
/// engine.set("name", "Ariz", 0);
/// assert_eq!(engine.get("name").unwrap(), "Ariz");
///
/// engine.set("raw", &b"\xff\xfe"[..], 0);
/// assert_eq!(&engine.get("raw").unwrap()[..], b"\xff\xfe");
///
/// engine.set("session", "token123", 60_000);
/// assert!(engine.get("missing").is_err());
/// ```
#[derive(Debug, Default)]
pub struct StorageEngine {
    data: RwLock<HashMap<Bytes, Entry>>,
    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
}

impl StorageEngine {
    /// Creates an empty storage engine.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Bytes, Entry>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Bytes, Entry>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets a key, overwriting any existing entry.
    ///
    /// `ttl_ms == 0` stores the key without expiry; otherwise the key expires
    /// `ttl_ms` milliseconds from now.
    ///
    /// # Returns
    ///
    /// Returns `true` if a new key was created, `false` if an existing key was updated.
    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>, ttl_ms: u64) -> bool {
        let entry = if ttl_ms == 0 {
            Entry::new(value.into())
        } else {
            Entry::with_ttl(value.into(), Duration::from_millis(ttl_ms))
        };
        self.insert(key.into(), entry)
    }

    /// Sets a key with an absolute expiry (or none).
    pub fn set_with_expiry(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expires_at: Option<SystemTime>,
    ) -> bool {
        self.insert(
            key.into(),
            Entry {
                value: value.into(),
                expires_at,
            },
        )
    }

    fn insert(&self, key: Bytes, entry: Entry) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        self.write().insert(key, entry).is_none()
    }

    /// Gets the value for a key.
    ///
    /// Fails with [`StorageError::KeyNotFound`] if the key doesn't exist or has
    /// expired. An expired entry is removed as a side effect.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Bytes, StorageError> {
        let key = key.as_ref();
        self.get_count.fetch_add(1, Ordering::Relaxed);

        // Fast path: shared lock for present, live keys
        {
            let data = self.read();
            match data.get(key) {
                Some(entry) if !entry.is_expired() => return Ok(entry.value.clone()),
                Some(_) => {}
                None => return Err(StorageError::not_found(key)),
            }
        }

        // Expired: take the write lock and re-check, a writer may have raced us
        let mut data = self.write();
        match data.get(key) {
            Some(entry) if entry.is_expired() => {
                data.remove(key);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                Err(StorageError::not_found(key))
            }
            Some(entry) => Ok(entry.value.clone()),
            None => Err(StorageError::not_found(key)),
        }
    }

    /// Deletes a key.
    ///
    /// # Returns
    ///
    /// Returns `true` if the key was present.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);
        self.write().remove(key.as_ref()).is_some()
    }

    /// Returns the keys stored right now, in arbitrary order.
    ///
    /// Entries already past their expiry are skipped but not removed; only
    /// `get` evicts.
    pub fn keys(&self) -> Vec<Bytes> {
        let now = SystemTime::now();
        self.read()
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Returns the live keys matching a glob pattern (`*`, `?`, `[...]`).
    pub fn keys_matching(&self, pattern: impl AsRef<[u8]>) -> Vec<Bytes> {
        let pattern = GlobPattern::new(pattern);
        let mut keys = self.keys();
        keys.retain(|key| pattern.matches(key));
        keys
    }

    /// Returns a copy of every live entry, for snapshot export.
    pub fn entries(&self) -> Vec<(Bytes, Entry)> {
        let now = SystemTime::now();
        self.read()
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Returns the number of entries in the map, expired-but-unread included.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns store statistics.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.len() as u64,
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }
}
