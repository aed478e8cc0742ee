//! Connection Handler Module
//!
//! Each accepted socket, and a replica's link to its leader, gets its own
//! handler task that reads commands and writes replies in a loop.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Peer connects (or the replica handshake finishes)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  Read bytes from socket      │
//!    │              │               │
//!    │              ▼               │
//!    │  Parse command               │
//!    │              │               │
//!    │              ▼               │
//!    │  Execute -> Outcome          │
//!    │              │               │
//!    │              ▼               │
//!    │  Write reply (unless the     │
//!    │  peer is our leader)         │
//!    │              │               │
//!    │              ▼               │
//!    │  Leader link: offset += size │
//!    │              │               │
//!    │         [Loop back]          │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Disconnect, read/parse failure, or command error
//!        │
//!        ▼
//! 5. Handler task ends; a registered replica is removed
//! ```
//!
//! ## Buffer Management
//!
//! A BytesMut buffer accumulates incoming data. TCP is a stream protocol, so
//! one read may hold part of a command or several of them.
//!
//! ## Shared Write Half
//!
//! After `PSYNC` the write half is also used by the propagation path, so it
//! lives behind a [`SharedWriter`] and every frame is written under its lock.

use crate::commands::{CommandError, CommandHandler, LinkKind, Outcome, Session};
use crate::protocol::{Command, CommandParser, ParseError, RespValue};
use crate::replication::{shared_writer, LeaderLink, ReplicationState, SharedWriter};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Maximum size for the read buffer (64 MB)
pub const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single connection.
///
/// Owns the read half, the read buffer, and the per-connection [`Session`];
/// shares the write half with the replication state once the peer becomes a
/// replica.
pub struct ConnectionHandler {
    /// Read half of the socket
    reader: OwnedReadHalf,

    /// Write half, shared with propagation after PSYNC
    writer: SharedWriter,

    /// Peer address, link kind, announced port
    session: Session,

    /// Buffer for incoming data
    buffer: BytesMut,

    /// The command handler (shared across connections)
    command_handler: CommandHandler,

    /// Command parser
    parser: CommandParser,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,

    /// Registry id once the peer has become a replica
    replica_id: Option<u64>,
}

impl ConnectionHandler {
    /// Creates a handler for an accepted client connection.
    ///
    /// # Arguments
    ///
    /// * `stream` - The TCP stream for this connection
    /// * `addr` - The peer's socket address
    /// * `command_handler` - The command handler for executing commands
    /// * `stats` - Shared connection statistics
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self::with_session(
            stream,
            Session::client(addr),
            BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            command_handler,
            stats,
        )
    }

    /// Creates a handler for a replica's link to its leader.
    ///
    /// `buffer` holds whatever arrived after the handshake's snapshot.
    pub fn leader_link(
        stream: TcpStream,
        addr: SocketAddr,
        buffer: BytesMut,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self::with_session(stream, Session::leader(addr), buffer, command_handler, stats)
    }

    fn with_session(
        stream: TcpStream,
        session: Session,
        buffer: BytesMut,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();
        let (reader, writer) = stream.into_split();

        Self {
            reader,
            writer: shared_writer(BufWriter::new(writer)),
            session,
            buffer,
            command_handler,
            parser: CommandParser::with_max_bulk_size(MAX_BUFFER_SIZE),
            stats,
            replica_id: None,
        }
    }

    fn replication(&self) -> &Arc<ReplicationState> {
        self.command_handler.replication()
    }

    /// Runs the main connection loop.
    ///
    /// Reads commands, executes them, and writes replies until the peer
    /// disconnects or an error occurs.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let addr = self.session.addr;
        match self.session.link {
            LinkKind::Client => info!(client = %addr, "Client connected"),
            LinkKind::Leader => info!(leader = %addr, "Streaming from leader"),
        }

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %addr, "Client disconnected gracefully"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %addr, "Client disconnected")
                }
                ConnectionError::Io(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %addr, "Connection reset by peer")
                }
                _ => warn!(client = %addr, error = %e, "Connection error"),
            },
        }

        if self.session.link == LinkKind::Leader {
            warn!(leader = %addr, "Replication link closed");
        }
        if let Some(id) = self.replica_id.take() {
            self.replication().remove_replica(id);
        }
        self.stats.connection_closed();
        result
    }

    /// The main read-execute-respond loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            while let Some(command) = self.try_parse_command()? {
                self.stats.command_processed();
                let result = self
                    .command_handler
                    .execute(&mut self.session, &command)
                    .await;

                // The leader link counts every command, after it ran, so a
                // GETACK reports the offset before itself.
                if self.session.link == LinkKind::Leader {
                    let offset = self.replication().advance_offset(command.size());
                    trace!(offset, size = command.size(), "Replica offset advanced");
                }

                let outcome = result.map_err(|e| {
                    warn!(
                        client = %self.session.addr,
                        command = %command,
                        error = %e,
                        "Command failed"
                    );
                    ConnectionError::Command(e)
                })?;
                self.apply_outcome(&command, outcome).await?;
            }

            self.read_more_data().await?;
        }
    }

    /// Writes whatever the outcome calls for.
    async fn apply_outcome(
        &mut self,
        command: &Command,
        outcome: Outcome,
    ) -> Result<(), ConnectionError> {
        match outcome {
            Outcome::Reply(value) => {
                if self.session.link == LinkKind::Client {
                    self.send_response(&value).await?;
                } else {
                    trace!(command = %command, "Reply suppressed on leader link");
                }
            }
            Outcome::Ack(value) => self.send_response(&value).await?,
            Outcome::Silent => {}
            Outcome::FullResync { header } => {
                // The snapshot is captured and queued in write order, so every
                // later write reaches this replica after it.
                let (handle, delivery) = self.replication().attach_replica(
                    self.session.addr,
                    self.session.listening_port,
                    Arc::clone(&self.writer),
                    self.command_handler.storage(),
                    &header,
                );
                self.replica_id = Some(handle.id());

                let bytes = delivery.bytes();
                delivery.wait().await?;
                self.stats.bytes_written(bytes);
                debug!(replica = %self.session.addr, bytes, "Snapshot sent");
            }
        }
        Ok(())
    }

    /// Attempts to parse a command from the buffer.
    fn try_parse_command(&mut self) -> Result<Option<Command>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&self.buffer) {
            Ok(Some((command, consumed))) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    client = %self.session.addr,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed command"
                );
                Ok(Some(command))
            }
            Ok(None) => {
                trace!(
                    client = %self.session.addr,
                    buffered = self.buffer.len(),
                    "Incomplete command, need more data"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(client = %self.session.addr, error = %e, "Parse error");
                Err(ConnectionError::Parse(e))
            }
        }
    }

    /// Reads more data from the socket into the buffer.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            error!(
                client = %self.session.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = self.reader.read_buf(&mut self.buffer).await?;

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.stats.bytes_read(n);
        trace!(client = %self.session.addr, bytes = n, "Read data");

        Ok(())
    }

    /// Writes one frame to the peer.
    async fn send_response(&self, response: &RespValue) -> Result<(), ConnectionError> {
        let bytes = response.serialize();
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&bytes).await?;
            writer.flush().await?;
        }
        self.stats.bytes_written(bytes.len());
        trace!(
            client = %self.session.addr,
            bytes = bytes.len(),
            "Sent response"
        );
        Ok(())
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// The command was rejected
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Peer disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial command)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,
}

/// Handles a client connection.
///
/// Creates a ConnectionHandler and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats);
    if let Err(e) = handler.run().await {
        log_ended(addr, &e);
    }
}

/// Serves the command stream from a replica's leader.
///
/// Bytes left over from the handshake are processed before anything new is
/// read, so no propagated command is lost.
pub async fn serve_leader_link(
    link: LeaderLink<TcpStream>,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let addr = match link.stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "Leader link has no peer address");
            return;
        }
    };

    let handler =
        ConnectionHandler::leader_link(link.stream, addr, link.buffer, command_handler, stats);
    if let Err(e) = handler.run().await {
        log_ended(addr, &e);
    }
}

fn log_ended(addr: SocketAddr, e: &ConnectionError) {
    match e {
        ConnectionError::ClientDisconnected => {}
        ConnectionError::Io(io_err) if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
        _ => {
            debug!(client = %addr, error = %e, "Connection ended with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::StorageEngine;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct TestServer {
        addr: SocketAddr,
        handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    }

    async fn create_test_server() -> TestServer {
        spawn_server(ReplicationState::master()).await
    }

    async fn spawn_server(replication: ReplicationState) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(ConnectionStats::new());
        let handler = CommandHandler::new(
            Arc::new(StorageEngine::new()),
            Arc::new(replication),
            Arc::new(Config::default()),
            Arc::clone(&stats),
        );

        let accept_handler = handler.clone();
        let accept_stats = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    client_addr,
                    accept_handler.clone(),
                    Arc::clone(&accept_stats),
                ));
            }
        });

        TestServer {
            addr,
            handler,
            stats,
        }
    }

    async fn read_exactly(client: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .expect("timed out waiting for reply")
            .unwrap();
        buf
    }

    /// Reads until `needle` has been seen.
    async fn read_until(client: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !buf.windows(needle.len()).any(|w| w == needle) {
            let mut chunk = [0u8; 1024];
            let n = tokio::time::timeout_at(deadline, client.read(&mut chunk))
                .await
                .expect("timed out waiting for reply")
                .unwrap();
            assert!(n > 0, "connection closed");
            buf.extend_from_slice(&chunk[..n]);
        }
        buf
    }

    /// Runs the replica side of PSYNC on a raw socket.
    async fn attach_fake_replica(addr: SocketAddr) -> TcpStream {
        let mut replica = TcpStream::connect(addr).await.unwrap();
        replica
            .write_all(b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut replica, 5).await, b"+OK\r\n");

        replica
            .write_all(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
            .await
            .unwrap();
        // +FULLRESYNC <40> <offset>\r\n then $<len>\r\n<snapshot ending in FF + checksum>
        read_until(&mut replica, b"\xff\x00\x00\x00\x00\x00\x00\x00\x00").await;
        replica
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();

        assert_eq!(read_exactly(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_set_get() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\nAriz\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 10).await, b"$4\r\nAriz\r\n");
    }

    #[tokio::test]
    async fn test_multiple_commands() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        // Pipelined in one write
        let pipeline: &[u8] = b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n\
            *3\r\n$3\r\nSET\r\n$2\r\nk2\r\n$2\r\nv2\r\n\
            *2\r\n$3\r\nGET\r\n$2\r\nk1\r\n\
            *2\r\n$3\r\nGET\r\n$2\r\nk2\r\n";
        client.write_all(pipeline).await.unwrap();

        // +OK\r\n+OK\r\n$2\r\nv1\r\n$2\r\nv2\r\n
        let response = read_exactly(&mut client, 26).await;
        assert_eq!(response, b"+OK\r\n+OK\r\n$2\r\nv1\r\n$2\r\nv2\r\n");
    }

    #[tokio::test]
    async fn test_set_get_non_utf8_value() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nbin\r\n$2\r\n\xff\xfe\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nbin\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 8).await, b"$2\r\n\xff\xfe\r\n");
        assert_eq!(server.handler.storage().get("bin").unwrap(), &b"\xff\xfe"[..]);
    }

    #[tokio::test]
    async fn test_split_frame() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"*2\r\n$4\r\nEC").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"HO\r\n$2\r\nhi\r\n").await.unwrap();

        assert_eq!(read_exactly(&mut client, 8).await, b"$2\r\nhi\r\n");
    }

    #[tokio::test]
    async fn test_unknown_command_closes_connection() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"*1\r\n$7\r\nFLUSHDB\r\n").await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        // Other connections are unaffected
        let mut other = TcpStream::connect(server.addr).await.unwrap();
        other.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut other, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_wait_without_replicas() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client
            .write_all(b"*3\r\n$4\r\nWAIT\r\n$1\r\n0\r\n$5\r\n60000\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 4).await, b":0\r\n");

        let start = std::time::Instant::now();
        client
            .write_all(b"*3\r\n$4\r\nWAIT\r\n$1\r\n1\r\n$3\r\n100\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 4).await, b":0\r\n");
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_psync_registers_replica_and_propagates() {
        let server = create_test_server().await;
        let mut replica = attach_fake_replica(server.addr).await;
        assert_eq!(server.handler.replication().replica_count(), 1);
        assert_eq!(
            server.handler.replication().replicas()[0].listening_port(),
            Some(6380)
        );

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");

        // Forwarded verbatim, before the client saw +OK
        assert_eq!(
            read_exactly(&mut replica, 31).await,
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"
        );
        assert_eq!(server.handler.replication().offset(), 31);
    }

    #[tokio::test]
    async fn test_wait_counts_replica_acks() {
        let server = create_test_server().await;
        let mut replica = attach_fake_replica(server.addr).await;

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        client
            .write_all(b"*3\r\n$4\r\nWAIT\r\n$1\r\n1\r\n$4\r\n2000\r\n")
            .await
            .unwrap();

        assert_eq!(
            read_exactly(&mut replica, 37).await,
            b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n"
        );
        replica
            .write_all(b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$1\r\n0\r\n")
            .await
            .unwrap();

        assert_eq!(read_exactly(&mut client, 4).await, b":1\r\n");
    }

    #[tokio::test]
    async fn test_closed_replica_is_unregistered() {
        let server = create_test_server().await;
        let replica = attach_fake_replica(server.addr).await;
        assert_eq!(server.handler.replication().replica_count(), 1);

        drop(replica);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(server.handler.replication().replica_count(), 0);
    }

    #[tokio::test]
    async fn test_leader_link_suppresses_replies() {
        let server = spawn_server(ReplicationState::replica_of("127.0.0.1:6379")).await;

        // Stand in for the leader
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let leader_addr = listener.local_addr().unwrap();
        let link_stream = TcpStream::connect(leader_addr).await.unwrap();
        let (mut leader, _) = listener.accept().await.unwrap();

        // A SET that arrived together with the snapshot
        let leftover = BytesMut::from(&b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"[..]);
        let peer = link_stream.peer_addr().unwrap();
        let link = ConnectionHandler::leader_link(
            link_stream,
            peer,
            leftover,
            server.handler.clone(),
            Arc::clone(&server.stats),
        );
        tokio::spawn(link.run());

        leader.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        leader
            .write_all(b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n")
            .await
            .unwrap();

        // No +OK or +PONG; only the ACK, reporting SET (31) + PING (14)
        assert_eq!(
            read_exactly(&mut leader, 35).await,
            b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$2\r\n45\r\n"
        );

        // The GETACK itself counts afterwards
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.handler.replication().offset(), 45 + 37);

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 9).await, b"$3\r\nbar\r\n");
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let server = create_test_server().await;
        let stats = &server.stats;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let _ = read_exactly(&mut client, 7).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(stats.commands_processed.load(Ordering::Relaxed) >= 1);
        assert!(stats.bytes_read.load(Ordering::Relaxed) > 0);
        assert!(stats.bytes_written.load(Ordering::Relaxed) > 0);

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }
}
