//! # RelayKV - A Replicated In-Memory Key-Value Server
//!
//! RelayKV speaks the Redis serialization protocol (RESP) and keeps string
//! values in memory with optional per-key expiry. One process is started as
//! a leader; others attach to it as replicas, receive a snapshot, and then
//! apply every write the leader forwards.
//!
//! ## Features
//!
//! - **Redis-Compatible**: RESP framing and the familiar command names
//! - **Replication**: leader/replica handshake, write propagation, offsets,
//!   and `WAIT` for acknowledgements
//! - **Snapshots**: RDB files read at startup and produced for `PSYNC`
//! - **TTL Support**: lazy expiry on read
//! - **Async I/O**: built on Tokio, one task per connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              RelayKV                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │                            │                  │                         │
//! │                            │        ┌─────────┴──────────┐              │
//! │                            │        ▼                    ▼              │
//! │  ┌─────────────┐           │  ┌─────────────┐   ┌──────────────────┐    │
//! │  │  Command    │<──────────┘  │StorageEngine│   │ ReplicationState │    │
//! │  │  Parser     │              │  (RwLock)   │   │ offset, replicas │    │
//! │  └─────────────┘              └──────┬──────┘   └────────┬─────────┘    │
//! │                                      │                   │              │
//! │                               ┌──────┴──────┐            ▼              │
//! │                               │  Snapshot   │      replica sockets      │
//! │                               │  (RDB)      │                           │
//! │                               └─────────────┘                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use relaykv::{CommandHandler, Config, ConnectionStats, ReplicationState, StorageEngine};
//! use relaykv::connection::handle_connection;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Arc::new(Config::default());
//!     let stats = Arc::new(ConnectionStats::new());
//!     let handler = CommandHandler::new(
//!         Arc::new(StorageEngine::new()),
//!         Arc::new(ReplicationState::master()),
//!         Arc::clone(&config),
//!         Arc::clone(&stats),
//!     );
//!
//!     let listener = TcpListener::bind(config.bind_address()).await.unwrap();
//!     loop {
//!         let (stream, addr) = listener.accept().await.unwrap();
//!         tokio::spawn(handle_connection(stream, addr, handler.clone(), Arc::clone(&stats)));
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP values and the incremental command parser
//! - [`storage`]: Thread-safe storage engine with lazy expiry
//! - [`snapshot`]: RDB decoding and encoding
//! - [`replication`]: Roles, handshake, propagation, and acknowledgements
//! - [`commands`]: The verb table and its handlers
//! - [`connection`]: Per-connection read/execute/reply loop
//! - [`config`]: Command-line configuration
//!
//! ## Design Highlights
//!
//! ### Byte-Exact Offsets
//!
//! A leader's offset grows by the encoded length of every frame it
//! propagates; a replica's grows by the wire size of every command read from
//! its leader. `FULLRESYNC` always advertises offset 0 and a replica counts
//! from the end of its snapshot, so the two numbers are equal only for a
//! replica attached before the leader's first write. `WAIT` relies on
//! `REPLCONF ACK` arriving, not on the values matching.
//!
//! ### Lazy Expiry
//!
//! An expired key is removed by the first read that finds it. Keys that are
//! never read again stay in memory until overwritten.

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod replication;
pub mod snapshot;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use config::{Cli, Config, ConfigError};
pub use connection::{handle_connection, serve_leader_link, ConnectionStats};
pub use protocol::{Command, CommandParser, ParseError, RespValue};
pub use replication::{ReplicationState, Role};
pub use storage::StorageEngine;

/// The default port RelayKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host RelayKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of RelayKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
