//! Leader-side handle on one attached replica.
//!
//! Every replica owns a queue of encoded frames and one task that drains it
//! into the replica's socket. Frames are written in the order they were
//! queued; each sender gets the write result back on a oneshot channel.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace};

/// How long a single frame may take to reach a replica's socket before the
/// replica is given up on
pub const REPLICA_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Write half of a connection, boxed so both TCP sockets and in-memory
/// pipes can stand behind it.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A write half shared between the connection task that owns it and the
/// replica's writer task. Each frame is written under the lock, so frames
/// never interleave.
pub type SharedWriter = Arc<Mutex<BoxedWriter>>;

/// Wraps a writer for sharing.
pub fn shared_writer<W>(writer: W) -> SharedWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(Mutex::new(Box::new(writer)))
}

/// One queued frame and where its write result goes.
struct Outgoing {
    frame: Bytes,
    done: oneshot::Sender<io::Result<()>>,
}

/// Resolves once a queued frame has been flushed to the replica.
#[derive(Debug)]
pub struct Delivery {
    bytes: usize,
    result: oneshot::Receiver<io::Result<()>>,
}

impl Delivery {
    /// Size of the queued frame.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Waits for the write. A writer task that has already stopped reports
    /// `BrokenPipe`.
    pub async fn wait(self) -> io::Result<()> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "replica writer stopped",
            )),
        }
    }
}

/// A replica that completed `PSYNC` on this leader.
///
/// The handle is registered together with its snapshot and removed when a
/// write to it fails or its connection closes. Dropping the last handle
/// stops the writer task.
pub struct ReplicaHandle {
    id: u64,
    addr: SocketAddr,
    listening_port: Option<u16>,
    queue: mpsc::UnboundedSender<Outgoing>,
}

impl ReplicaHandle {
    /// Creates a handle and spawns the task that writes its queue to
    /// `writer`. Must be called from within a Tokio runtime.
    pub(crate) fn spawn(
        id: u64,
        addr: SocketAddr,
        listening_port: Option<u16>,
        writer: SharedWriter,
    ) -> Self {
        let (queue, outgoing) = mpsc::unbounded_channel();
        tokio::spawn(drain(id, writer, outgoing));

        Self {
            id,
            addr,
            listening_port,
            queue,
        }
    }

    /// Registry id, unique for the lifetime of the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address of the replication link.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Port announced via `REPLCONF listening-port`, if any.
    pub fn listening_port(&self) -> Option<u16> {
        self.listening_port
    }

    /// Queues a frame behind every frame queued before it.
    ///
    /// Never blocks. The frame is written by the replica's writer task.
    pub fn enqueue(&self, frame: Bytes) -> Delivery {
        let (done, result) = oneshot::channel();
        let bytes = frame.len();
        // A closed queue drops `done`, which `Delivery::wait` reports.
        let _ = self.queue.send(Outgoing { frame, done });
        Delivery { bytes, result }
    }

    /// Queues one frame and waits until it is flushed.
    pub async fn send(&self, frame: impl Into<Bytes>) -> io::Result<()> {
        self.enqueue(frame.into()).wait().await
    }
}

impl std::fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("listening_port", &self.listening_port)
            .finish()
    }
}

/// Writes queued frames until the queue closes or a write fails.
///
/// After a failure the queue is dropped, so every frame still waiting fails
/// too instead of being written out of sequence.
async fn drain(id: u64, writer: SharedWriter, mut outgoing: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(Outgoing { frame, done }) = outgoing.recv().await {
        let result = match tokio::time::timeout(REPLICA_WRITE_TIMEOUT, write_frame(&writer, &frame))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "replica write timed out",
            )),
        };

        let failed = result.is_err();
        if let Err(e) = &result {
            debug!(replica = id, error = %e, "Replica write failed, closing its queue");
        } else {
            trace!(replica = id, bytes = frame.len(), "Frame written to replica");
        }
        let _ = done.send(result);
        if failed {
            break;
        }
    }
}

async fn write_frame(writer: &SharedWriter, frame: &[u8]) -> io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(frame).await?;
    writer.flush().await
}
