//! Physical socket plumbing.
//!
//! Each TCP socket is split into a reader task and a writer task. The reader
//! forwards everything it reads to the owning event loop; the writer drains a
//! command channel. The event loop only ever holds a [`SocketHandle`], so relay
//! state never crosses an await point.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::common::READ_BUFFER_SIZE;

/// Process-unique key of a physical socket.
pub type SocketId = u64;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh socket key.
pub fn next_socket_id() -> SocketId {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// Something that happened on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Bytes read from the socket.
    Data(Bytes),
    /// The socket reached EOF, errored, or was destroyed.
    ///
    /// May be delivered more than once for the same socket.
    Closed,
}

/// Instruction for a socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Write these bytes.
    Write(Bytes),
    /// Finish pending writes, then tear the socket down.
    Destroy,
}

/// Cheap, cloneable handle for writing to or destroying a socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: SocketId,
    tx: mpsc::UnboundedSender<Command>,
}

impl SocketHandle {
    /// Creates a handle that is not attached to a real socket.
    ///
    /// The returned receiver sees every command sent through the handle.
    pub fn detached(id: SocketId) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    /// Returns the socket key.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Queues bytes for writing. Empty writes and writes to a dead socket are
    /// ignored.
    pub fn write(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let _ = self.tx.send(Command::Write(data));
    }

    /// Destroys the socket after already queued writes.
    pub fn destroy(&self) {
        let _ = self.tx.send(Command::Destroy);
    }

    /// Returns true once the writer task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawns the reader and writer tasks for a connected stream.
///
/// Every event is wrapped with `wrap` and sent to `events`. The writer task is
/// tracked in `tasks` so shutdown can wait for sockets to finish closing.
pub fn spawn_socket<E, F>(
    stream: TcpStream,
    tasks: &mut JoinSet<()>,
    events: mpsc::UnboundedSender<E>,
    wrap: F,
) -> SocketHandle
where
    E: Send + 'static,
    F: Fn(SocketId, SocketEvent) -> E + Send + Sync + 'static,
{
    let id = next_socket_id();
    let wrap = Arc::new(wrap);
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let reader = tokio::spawn(read_loop(id, read_half, events.clone(), Arc::clone(&wrap)));

    tasks.spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Write(data) => {
                    if let Err(e) = write_half.write_all(&data).await {
                        tracing::debug!(socket = id, error = %e, "socket write failed");
                        break;
                    }
                }
                Command::Destroy => break,
            }
        }

        reader.abort();
        let _ = write_half.shutdown().await;
        let _ = events.send(wrap(id, SocketEvent::Closed));
    });

    SocketHandle { id, tx }
}

async fn read_loop<E, F>(
    id: SocketId,
    mut read_half: OwnedReadHalf,
    events: mpsc::UnboundedSender<E>,
    wrap: Arc<F>,
) where
    F: Fn(SocketId, SocketEvent) -> E,
{
    let mut read_buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match read_half.read(&mut read_buf).await {
            Ok(0) => {
                tracing::debug!(socket = id, "socket reached EOF");
                break;
            }
            Ok(n) => {
                let data = Bytes::copy_from_slice(&read_buf[..n]);
                if events.send(wrap(id, SocketEvent::Data(data))).is_err() {
                    // Event loop is gone
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(socket = id, error = %e, "socket read failed");
                break;
            }
        }
    }

    let _ = events.send(wrap(id, SocketEvent::Closed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_detached_handle_records_commands() {
        let (handle, mut rx) = SocketHandle::detached(7);
        handle.write(Bytes::from_static(b"abc"));
        handle.write(Bytes::new());
        handle.destroy();

        assert_eq!(handle.id(), 7);
        assert_eq!(rx.try_recv().unwrap(), Command::Write(Bytes::from_static(b"abc")));
        assert_eq!(rx.try_recv().unwrap(), Command::Destroy);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_socket_ids_are_unique() {
        let a = next_socket_id();
        let b = next_socket_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_spawned_socket_relays_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut peer = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        let handle = spawn_socket(stream, &mut tasks, events_tx, |id, event| (id, event));

        peer.write_all(b"ping").await.unwrap();
        let (id, event) = events_rx.recv().await.unwrap();
        assert_eq!(id, handle.id());
        assert_eq!(event, SocketEvent::Data(Bytes::from_static(b"ping")));

        handle.write(Bytes::from_static(b"pong"));
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        handle.destroy();
        let (_, event) = events_rx.recv().await.unwrap();
        assert_eq!(event, SocketEvent::Closed);

        // Peer observes EOF after destroy
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_peer_eof_emits_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        let _handle = spawn_socket(stream, &mut tasks, events_tx, |_, event| event);

        drop(peer);
        assert_eq!(events_rx.recv().await.unwrap(), SocketEvent::Closed);
    }
}
