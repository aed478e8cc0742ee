//! Replication state shared by every connection on a node.
//!
//! ## Write ordering
//!
//! A leader applies each write to its store and queues it for every replica
//! while holding one lock, so replicas receive writes in exactly the order
//! the store applied them. Waiting for the sockets happens after the lock is
//! released, so a slow replica delays only the writes queued behind it.

use super::replica::{Delivery, ReplicaHandle, SharedWriter};
use crate::config::Config;
use crate::protocol::RespValue;
use crate::snapshot;
use crate::storage::StorageEngine;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Length of a replication id
pub const REPLICATION_ID_LEN: usize = 40;

/// The role a node plays, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    /// The name reported by `INFO replication`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Slave => "slave",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frames queued for the replicas attached when they were queued.
struct Pending {
    bytes: usize,
    deliveries: Vec<(Arc<ReplicaHandle>, Delivery)>,
}

/// Process-wide replication state.
///
/// On a leader this tracks the replica registry, the number of bytes
/// propagated, and the acknowledgement counter used by `WAIT`. On a replica
/// only the offset moves: it counts bytes received over the leader link.
pub struct ReplicationState {
    role: Role,
    replication_id: String,
    replica_of: Option<String>,
    offset: AtomicU64,
    replicas: RwLock<Vec<Arc<ReplicaHandle>>>,
    next_replica_id: AtomicU64,
    /// Held while a write is applied and queued, and while a replica attaches
    write_order: Mutex<()>,
    acks: watch::Sender<usize>,
}

impl ReplicationState {
    /// Creates state for a leader.
    pub fn master() -> Self {
        Self::new(Role::Master, None)
    }

    /// Creates state for a replica of `leader` (`host:port`).
    pub fn replica_of(leader: impl Into<String>) -> Self {
        Self::new(Role::Slave, Some(leader.into()))
    }

    /// Creates state matching the configured role.
    pub fn from_config(config: &Config) -> Self {
        match &config.replica_of {
            Some(leader) => Self::replica_of(leader.clone()),
            None => Self::master(),
        }
    }

    fn new(role: Role, replica_of: Option<String>) -> Self {
        let (acks, _) = watch::channel(0);
        Self {
            role,
            replication_id: generate_replication_id(),
            replica_of,
            offset: AtomicU64::new(0),
            replicas: RwLock::new(Vec::new()),
            next_replica_id: AtomicU64::new(1),
            write_order: Mutex::new(()),
            acks,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// The 40-character id generated at startup.
    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    /// Leader address when running as a replica.
    pub fn leader(&self) -> Option<&str> {
        self.replica_of.as_deref()
    }

    /// Current replication offset.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Adds `bytes` to the offset and returns the new value.
    pub fn advance_offset(&self, bytes: usize) -> u64 {
        self.offset.fetch_add(bytes as u64, Ordering::SeqCst) + bytes as u64
    }

    fn lock_write_order(&self) -> MutexGuard<'_, ()> {
        self.write_order.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Replica registry
    // ========================================================================

    /// Registers a replica whose connection writes through `writer`.
    ///
    /// Frames queued from now on reach it; nothing is sent on its own.
    pub fn register_replica(
        &self,
        addr: SocketAddr,
        listening_port: Option<u16>,
        writer: SharedWriter,
    ) -> Arc<ReplicaHandle> {
        let id = self.next_replica_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ReplicaHandle::spawn(id, addr, listening_port, writer));
        self.replicas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&handle));
        info!(replica = %addr, id, listening_port = ?listening_port, "Replica registered");
        handle
    }

    /// Answers `PSYNC`: captures the store, queues `header` and the snapshot
    /// as the replica's first frame, and registers it.
    ///
    /// Runs under the write-order lock, so every write lands either in the
    /// snapshot or in the queue behind it.
    pub fn attach_replica(
        &self,
        addr: SocketAddr,
        listening_port: Option<u16>,
        writer: SharedWriter,
        storage: &StorageEngine,
        header: &RespValue,
    ) -> (Arc<ReplicaHandle>, Delivery) {
        let _order = self.lock_write_order();

        let payload = snapshot::capture(storage);
        let mut frame = header.serialize();
        RespValue::file(payload).serialize_into(&mut frame);

        let handle = self.register_replica(addr, listening_port, writer);
        let delivery = handle.enqueue(Bytes::from(frame));
        debug!(replica = %addr, bytes = delivery.bytes(), "Snapshot queued");
        (handle, delivery)
    }

    /// Removes a replica by id. Returns `false` if it was already gone.
    pub fn remove_replica(&self, id: u64) -> bool {
        let mut replicas = self.replicas.write().unwrap_or_else(PoisonError::into_inner);
        let before = replicas.len();
        replicas.retain(|r| r.id() != id);
        let removed = replicas.len() != before;
        if removed {
            info!(id, remaining = replicas.len(), "Replica removed");
        }
        removed
    }

    /// A snapshot of the registry.
    pub fn replicas(&self) -> Vec<Arc<ReplicaHandle>> {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // ========================================================================
    // Propagation
    // ========================================================================

    /// Runs `apply` and, if it succeeds, queues `frame` for every replica,
    /// all under the write-order lock. Then waits for the queued writes.
    ///
    /// Two writes racing on the same key reach every replica in the order
    /// the store applied them.
    pub async fn apply_and_propagate<T, E>(
        &self,
        frame: &RespValue,
        apply: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let (value, pending) = {
            let _order = self.lock_write_order();
            let value = apply()?;
            (value, self.enqueue(frame))
        };
        self.settle(pending).await;
        Ok(value)
    }

    /// Sends `frame` to every registered replica and waits for all writes.
    ///
    /// The frame is encoded once. A replica whose write fails or times out is
    /// removed from the registry. The offset then grows by the encoded length
    /// whether or not any replica is attached.
    ///
    /// # Returns
    ///
    /// The new replication offset.
    pub async fn propagate(&self, frame: &RespValue) -> u64 {
        let pending = {
            let _order = self.lock_write_order();
            self.enqueue(frame)
        };
        self.settle(pending).await
    }

    /// Queues `frame` on every replica. Caller holds the write-order lock.
    fn enqueue(&self, frame: &RespValue) -> Pending {
        let encoded = Bytes::from(frame.serialize());
        let deliveries = self
            .replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|replica| (Arc::clone(replica), replica.enqueue(encoded.clone())))
            .collect();

        Pending {
            bytes: encoded.len(),
            deliveries,
        }
    }

    /// Waits for every delivery, drops failed replicas, then advances the
    /// offset.
    async fn settle(&self, pending: Pending) -> u64 {
        let mut writes = JoinSet::new();
        for (replica, delivery) in pending.deliveries {
            writes.spawn(async move { (replica, delivery.wait().await) });
        }

        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((replica, Err(e))) => {
                    warn!(
                        replica = %replica.addr(),
                        error = %e,
                        "Propagation failed, dropping replica"
                    );
                    self.remove_replica(replica.id());
                }
                Err(e) => warn!(error = %e, "Propagation task failed"),
            }
        }

        let offset = self.advance_offset(pending.bytes);
        debug!(bytes = pending.bytes, offset, "Propagated");
        offset
    }

    // ========================================================================
    // Acknowledgements
    // ========================================================================

    /// Counts one `REPLCONF ACK` and wakes any waiting `WAIT`.
    pub fn record_ack(&self) -> usize {
        self.acks.send_modify(|acks| *acks += 1);
        *self.acks.borrow()
    }

    /// Acknowledgements received since the last reset.
    pub fn acks(&self) -> usize {
        *self.acks.borrow()
    }

    /// Blocks until `needed` replicas acknowledge or `timeout` elapses.
    ///
    /// Resets the counter, then broadcasts `REPLCONF GETACK *` (which counts
    /// towards the offset like any propagated frame). Any `ACK` received after
    /// the reset counts, whatever offset it carries.
    ///
    /// # Returns
    ///
    /// `0` when `needed` is zero. Otherwise the acknowledgement count, or the
    /// number of attached replicas if the deadline passes with no
    /// acknowledgement at all.
    pub async fn wait_for_replicas(&self, needed: usize, timeout: Duration) -> usize {
        if needed == 0 {
            return 0;
        }

        let deadline = Instant::now() + timeout;
        let mut acks = self.acks.subscribe();
        self.acks.send_replace(0);

        self.propagate(&RespValue::command(["REPLCONF", "GETACK", "*"]))
            .await;

        loop {
            let current = *acks.borrow_and_update();
            if current >= needed {
                return current;
            }
            tokio::select! {
                changed = acks.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let acked = *acks.borrow();
        if acked > 0 {
            acked
        } else {
            self.replica_count()
        }
    }
}

impl fmt::Debug for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationState")
            .field("role", &self.role)
            .field("replication_id", &self.replication_id)
            .field("replica_of", &self.replica_of)
            .field("offset", &self.offset())
            .field("replicas", &self.replica_count())
            .finish()
    }
}

fn generate_replication_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REPLICATION_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::replica::shared_writer;
    use tokio::io::AsyncReadExt;

    fn addr() -> SocketAddr {
        "127.0.0.1:6380".parse().unwrap()
    }

    #[test]
    fn test_roles_and_ids() {
        let master = ReplicationState::master();
        assert_eq!(master.role(), Role::Master);
        assert_eq!(master.replication_id().len(), REPLICATION_ID_LEN);
        assert!(master
            .replication_id()
            .chars()
            .all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(master.offset(), 0);

        let replica = ReplicationState::replica_of("localhost:6379");
        assert_eq!(replica.role().to_string(), "slave");
        assert_eq!(replica.leader(), Some("localhost:6379"));
        assert_ne!(master.replication_id(), replica.replication_id());
    }

    #[tokio::test]
    async fn test_propagate_without_replicas_advances_offset() {
        let state = ReplicationState::master();
        let frame = RespValue::command(["SET", "foo", "bar"]);
        let offset = state.propagate(&frame).await;
        assert_eq!(offset, 31);
        assert_eq!(state.offset(), 31);
    }

    #[tokio::test]
    async fn test_propagate_reaches_every_replica() {
        let state = ReplicationState::master();
        let (a, mut a_peer) = tokio::io::duplex(256);
        let (b, mut b_peer) = tokio::io::duplex(256);
        state.register_replica(addr(), Some(6380), shared_writer(a));
        state.register_replica(addr(), Some(6381), shared_writer(b));

        state.propagate(&RespValue::command(["SET", "k", "v"])).await;

        let expected = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";
        let mut buf = vec![0u8; expected.len()];
        a_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, expected);
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, expected);
        assert_eq!(state.replica_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_replica_is_dropped() {
        let state = ReplicationState::master();
        let (live, _live_peer) = tokio::io::duplex(256);
        let (dead, dead_peer) = tokio::io::duplex(256);
        state.register_replica(addr(), None, shared_writer(live));
        let doomed = state.register_replica(addr(), None, shared_writer(dead));
        drop(dead_peer);

        state.propagate(&RespValue::command(["SET", "k", "v"])).await;

        let remaining = state.replicas();
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0].id(), doomed.id());
        assert!(!state.remove_replica(doomed.id()));
    }

    #[tokio::test]
    async fn test_failed_apply_queues_nothing() {
        let state = ReplicationState::master();
        let (writer, _peer) = tokio::io::duplex(256);
        state.register_replica(addr(), None, shared_writer(writer));

        let result: Result<(), &str> = state
            .apply_and_propagate(&RespValue::command(["SET", "k", "v"]), || Err("rejected"))
            .await;

        assert_eq!(result, Err("rejected"));
        assert_eq!(state.offset(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replicas_see_writes_in_apply_order() {
        let state = Arc::new(ReplicationState::master());
        let storage = Arc::new(StorageEngine::new());
        let (writer, mut peer) = tokio::io::duplex(64 * 1024);
        state.register_replica(addr(), None, shared_writer(writer));

        let mut writers = JoinSet::new();
        for i in 0..16 {
            let state = Arc::clone(&state);
            let storage = Arc::clone(&storage);
            writers.spawn(async move {
                let value = format!("v{:02}", i);
                let frame = RespValue::command(["SET", "k", value.as_str()]);
                state
                    .apply_and_propagate(&frame, || {
                        storage.set("k", value.clone(), 0);
                        Ok::<_, ()>(())
                    })
                    .await
            });
        }
        while let Some(joined) = writers.join_next().await {
            joined.unwrap().unwrap();
        }

        // Each frame is `*3 SET k vNN`, 29 bytes; the last one on the wire
        // must carry the value the store ended up with.
        let mut buf = vec![0u8; 16 * 29];
        peer.read_exact(&mut buf).await.unwrap();
        let last = String::from_utf8_lossy(&buf[buf.len() - 5..buf.len() - 2]).into_owned();
        assert_eq!(storage.get("k").unwrap(), last);
        assert_eq!(state.offset(), 16 * 29);
    }

    #[tokio::test]
    async fn test_attach_replica_sends_snapshot_first() {
        let state = ReplicationState::master();
        let storage = StorageEngine::new();
        storage.set("before", "1", 0);
        let (writer, mut peer) = tokio::io::duplex(4096);

        let header = RespValue::simple_string("FULLRESYNC id 0");
        let (handle, delivery) =
            state.attach_replica(addr(), Some(6380), shared_writer(writer), &storage, &header);
        let snapshot_len = delivery.bytes();
        delivery.wait().await.unwrap();
        assert_eq!(state.replicas()[0].id(), handle.id());

        state.propagate(&RespValue::command(["SET", "k", "v"])).await;

        let mut buf = vec![0u8; snapshot_len + 27];
        peer.read_exact(&mut buf).await.unwrap();
        assert!(buf.starts_with(b"+FULLRESYNC id 0\r\n$"));
        assert!(buf.ends_with(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n"));

        let payload_start = buf.windows(5).position(|w| w == b"REDIS").unwrap();
        let entries = snapshot::decode(&buf[payload_start..snapshot_len]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "before");
    }

    #[tokio::test]
    async fn test_wait_zero_returns_immediately() {
        let state = ReplicationState::master();
        assert_eq!(state.wait_for_replicas(0, Duration::from_secs(10)).await, 0);
        assert_eq!(state.offset(), 0);
    }

    #[tokio::test]
    async fn test_wait_times_out_with_replica_count() {
        let state = ReplicationState::master();
        let (writer, _peer) = tokio::io::duplex(1024);
        state.register_replica(addr(), None, shared_writer(writer));

        let start = std::time::Instant::now();
        let acked = state.wait_for_replicas(3, Duration::from_millis(100)).await;

        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(acked, 1);
        // GETACK counts towards the offset
        assert_eq!(state.offset(), 37);
    }

    #[tokio::test]
    async fn test_wait_returns_once_enough_acks() {
        let state = Arc::new(ReplicationState::master());
        let (writer, mut peer) = tokio::io::duplex(1024);
        state.register_replica(addr(), None, shared_writer(writer));

        let acker = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut buf = [0u8; 37];
                peer.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n");
                state.record_ack();
            })
        };

        let start = std::time::Instant::now();
        let acked = state.wait_for_replicas(1, Duration::from_secs(5)).await;
        acker.await.unwrap();

        assert_eq!(acked, 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_reports_partial_acks_on_timeout() {
        let state = Arc::new(ReplicationState::master());
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, _b_peer) = tokio::io::duplex(1024);
        state.register_replica(addr(), None, shared_writer(a));
        state.register_replica(addr(), None, shared_writer(b));

        let acker = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut buf = [0u8; 37];
                a_peer.read_exact(&mut buf).await.unwrap();
                state.record_ack();
            })
        };

        let acked = state.wait_for_replicas(2, Duration::from_millis(200)).await;
        acker.await.unwrap();
        assert_eq!(acked, 1);
    }
}
