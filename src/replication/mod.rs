//! Replication Module
//!
//! A node is either a leader (`master`) or a replica (`slave`), fixed at
//! startup.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!   client SET ────> │            Leader            │
//!                    │  [write-order lock]          │
//!                    │   apply, encode once, queue  │
//!                    │   on every replica handle    │
//!                    └──────┬───────────────┬───────┘
//!                           │               │
//!                 SET frame │               │ SET frame
//!                           ▼               ▼
//!                    ┌────────────┐  ┌────────────┐
//!                    │  Replica A │  │  Replica B │
//!                    │ offset += n│  │ offset += n│
//!                    └────────────┘  └────────────┘
//! ```
//!
//! - [`handshake`]: the replica's PING / REPLCONF / PSYNC exchange and
//!   snapshot transfer
//! - [`replica`]: the leader's handle on one attached replica, with its
//!   ordered write queue
//! - [`state`]: role, replication id, offset, replica registry, and the
//!   acknowledgement counter behind `WAIT`

pub mod handshake;
pub mod replica;
pub mod state;

pub use handshake::{connect, handshake, HandshakeError, LeaderLink};
pub use replica::{shared_writer, BoxedWriter, Delivery, ReplicaHandle, SharedWriter};
pub use state::{ReplicationState, Role};
