//! Storage Engine Module
//!
//! A thread-safe key-value map with per-key optional expiration.
//!
//! ## Features
//!
//! - **RwLock**: multiple concurrent readers, exclusive writers
//! - **TTL Support**: keys can carry an absolute expiry time
//! - **Lazy Expiry**: expired keys are removed by the read that finds them
//! - **Glob Matching**: `KEYS` patterns with `*`, `?` and character classes
//!
//! ## Example
//!
//! ```
//! use relaykv::storage::StorageEngine;
//! use std::sync::Arc;
//!
//! let engine = Arc::new(StorageEngine::new());
//!
//! engine.set("name", "Ariz", 0);
//! assert_eq!(engine.get("name").unwrap(), "Ariz");
//!
//! // Expires one hour from now
//! engine.set("session", "token123", 3_600_000);
//! ```

pub mod engine;
pub mod pattern;

pub use engine::{Entry, StorageEngine, StorageError, StorageStats};
pub use pattern::GlobPattern;
