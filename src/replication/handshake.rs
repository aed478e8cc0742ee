//! Replica-side handshake with a leader.
//!
//! ```text
//! replica                                   leader
//!    │  PING                                   │
//!    │ ──────────────────────────────────────> │
//!    │                                  +PONG  │
//!    │ <────────────────────────────────────── │
//!    │  REPLCONF listening-port <port>         │
//!    │ ──────────────────────────────────────> │
//!    │                                    +OK  │
//!    │ <────────────────────────────────────── │
//!    │  REPLCONF capa psync2                   │
//!    │ ──────────────────────────────────────> │
//!    │                                    +OK  │
//!    │ <────────────────────────────────────── │
//!    │  PSYNC ? -1                             │
//!    │ ──────────────────────────────────────> │
//!    │            +FULLRESYNC <replid> <offset>│
//!    │ <────────────────────────────────────── │
//!    │            $<len>\r\n<snapshot bytes>   │
//!    │ <────────────────────────────────────── │
//! ```
//!
//! Any bytes that arrive after the snapshot belong to the command stream and
//! are handed back in [`LeaderLink::buffer`].

use crate::protocol::{Command, CommandParser, ParseError, RespValue};
use crate::snapshot;
use crate::storage::StorageEngine;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Errors raised during the handshake. All are fatal at startup.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to connect to leader {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed reply from leader: {0}")]
    Parse(#[from] ParseError),

    #[error("unexpected reply to {step}: expected {expected}, got {got:?}")]
    UnexpectedReply {
        step: &'static str,
        expected: &'static str,
        got: String,
    },

    #[error("leader closed the connection during {0}")]
    ConnectionClosed(&'static str),
}

/// An established replication link, ready to stream commands.
#[derive(Debug)]
pub struct LeaderLink<S> {
    /// The connection to the leader
    pub stream: S,
    /// Bytes received after the snapshot, not yet parsed
    pub buffer: BytesMut,
    /// The raw snapshot payload
    pub snapshot: Bytes,
    /// The leader's replication id from `FULLRESYNC`
    pub leader_replication_id: String,
}

impl<S> LeaderLink<S> {
    /// Loads the received snapshot into `engine`.
    ///
    /// A snapshot that fails to decode is discarded with a warning and the
    /// store is left as it was.
    pub fn apply_snapshot(&self, engine: &StorageEngine) -> usize {
        match snapshot::decode(&self.snapshot) {
            Ok(entries) => {
                let loaded = snapshot::restore(engine, entries);
                info!(keys = loaded, "Applied snapshot from leader");
                loaded
            }
            Err(e) => {
                warn!(
                    error = %e,
                    bytes = self.snapshot.len(),
                    "Discarding undecodable snapshot from leader"
                );
                0
            }
        }
    }
}

/// Connects to `leader` (`host:port`) and runs the handshake.
pub async fn connect(
    leader: &str,
    listening_port: u16,
) -> Result<LeaderLink<TcpStream>, HandshakeError> {
    info!(leader, "Connecting to leader");
    let stream = TcpStream::connect(leader)
        .await
        .map_err(|source| HandshakeError::Connect {
            addr: leader.to_string(),
            source,
        })?;
    handshake(stream, listening_port).await
}

/// Runs the four-step handshake over an already connected stream.
pub async fn handshake<S>(stream: S, listening_port: u16) -> Result<LeaderLink<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut exchange = Exchange {
        stream,
        buffer: BytesMut::with_capacity(4096),
        parser: CommandParser::new(),
    };

    let port = listening_port.to_string();
    exchange
        .step("PING", &["PING"], "PONG", |reply| reply.eq_ignore_ascii_case("PONG"))
        .await?;
    exchange
        .step(
            "REPLCONF listening-port",
            &["REPLCONF", "listening-port", &port],
            "OK",
            |reply| reply.eq_ignore_ascii_case("OK"),
        )
        .await?;
    exchange
        .step("REPLCONF capa", &["REPLCONF", "capa", "psync2"], "OK", |reply| {
            reply.eq_ignore_ascii_case("OK")
        })
        .await?;
    let fullresync = exchange
        .step("PSYNC", &["PSYNC", "?", "-1"], "FULLRESYNC <replid> <offset>", |reply| {
            reply.starts_with("FULLRESYNC")
        })
        .await?;

    let leader_replication_id = fullresync
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string();

    let snapshot = exchange.read_snapshot().await?;
    info!(
        leader_replid = %leader_replication_id,
        snapshot_bytes = snapshot.len(),
        buffered = exchange.buffer.len(),
        "Handshake complete"
    );

    Ok(LeaderLink {
        stream: exchange.stream,
        buffer: exchange.buffer,
        snapshot,
        leader_replication_id,
    })
}

struct Exchange<S> {
    stream: S,
    buffer: BytesMut,
    parser: CommandParser,
}

impl<S> Exchange<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Sends one request and validates its single-line reply.
    async fn step(
        &mut self,
        step: &'static str,
        request: &[&str],
        expected: &'static str,
        accept: impl Fn(&str) -> bool,
    ) -> Result<String, HandshakeError> {
        let frame = RespValue::command(request).serialize();
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        debug!(step, "Handshake request sent");

        let reply = self.read_reply(step).await?;
        let line = reply.arg_str(0).unwrap_or_default().into_owned();
        if !accept(&line) {
            return Err(HandshakeError::UnexpectedReply {
                step,
                expected,
                got: line,
            });
        }
        Ok(line)
    }

    async fn read_reply(&mut self, step: &'static str) -> Result<Command, HandshakeError> {
        loop {
            if let Some((reply, consumed)) = self.parser.parse(&self.buffer)? {
                let _ = self.buffer.split_to(consumed);
                return Ok(reply);
            }
            self.fill(step).await?;
        }
    }

    async fn read_snapshot(&mut self) -> Result<Bytes, HandshakeError> {
        loop {
            if let Some((payload, consumed)) = self.parser.parse_file(&self.buffer)? {
                let _ = self.buffer.split_to(consumed);
                return Ok(payload);
            }
            self.fill("snapshot transfer").await?;
        }
    }

    async fn fill(&mut self, step: &'static str) -> Result<(), HandshakeError> {
        if self.stream.read_buf(&mut self.buffer).await? == 0 {
            return Err(HandshakeError::ConnectionClosed(step));
        }
        Ok(())
    }
}
