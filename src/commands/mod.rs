//! Command Handler Module
//!
//! The command processing layer. It receives parsed commands, executes them
//! against the storage engine and the replication state, and returns an
//! [`Outcome`] telling the connection what to write.
//!
//! ## Architecture
//!
//! ```text
//! Peer Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ Command Parser  │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Resolve Verb │
//! │  - Validate     │
//! │  - Execute      │
//! │  - Propagate    │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ StorageEngine   │     │ ReplicationState │
//! └─────────────────┘     └──────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - Data: `GET`, `SET [PX]`, `KEYS`
//! - Server: `PING`, `ECHO`, `INFO`, `CONFIG GET`
//! - Replication: `REPLCONF`, `PSYNC`, `WAIT`

pub mod handler;

pub use handler::{CommandError, CommandHandler, LinkKind, Outcome, Session, Verb};
