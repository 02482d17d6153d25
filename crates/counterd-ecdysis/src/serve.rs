//! Binding request-handling code to listeners.
//!
//! The core knows nothing about the protocol spoken on a connection. A
//! [`Handler`] receives an [`Incoming`] stream of accepted connections for one
//! listener; the stream ends when the listener is closed. Every accepted
//! connection is tracked so a drain can force it closed.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::listener::Listener;

/// Request-handling logic bound to a listener with [`Generation::attach`].
///
/// Implementations should return once `incoming` yields `None` and their
/// connections have finished; the drain waits for that within its grace period.
///
/// [`Generation::attach`]: crate::Generation::attach
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn serve(&self, incoming: Incoming) -> io::Result<()>;
}

/// Accepted connections of one listener.
pub struct Incoming {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    closed: CancellationToken,
    connections: ConnectionSet,
}

impl Incoming {
    pub(crate) fn new(listener: &Listener, connections: ConnectionSet) -> io::Result<Self> {
        let std_listener = std::net::TcpListener::from(listener.duplicate()?);
        std_listener.set_nonblocking(true)?;
        Ok(Self {
            listener: Some(TcpListener::from_std(std_listener)?),
            local_addr: listener.local_addr(),
            closed: listener.closed_token(),
            connections,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token cancelled when the listener stops accepting.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Wait for the next connection. Returns `None` once the listener is closed;
    /// the accept socket is released at that point.
    pub async fn accept(&mut self) -> Option<(TrackedStream, SocketAddr)> {
        loop {
            let listener = self.listener.as_ref()?;
            let accepted = tokio::select! {
                biased;
                _ = self.closed.cancelled() => None,
                accepted = listener.accept() => Some(accepted),
            };

            match accepted {
                None => {
                    debug!(addr = %self.local_addr, "Listener closed, accept loop stopping");
                    self.listener = None;
                    return None;
                }
                Some(Ok((stream, peer))) => match self.connections.track(stream) {
                    Ok(stream) => return Some((stream, peer)),
                    Err(e) => warn!(%peer, error = %e, "Dropping connection that could not be tracked"),
                },
                Some(Err(e)) if is_connection_error(&e) => {
                    debug!(error = %e, "Accepted connection failed before use");
                }
                Some(Err(e)) => {
                    // Out of descriptors and similar: back off instead of spinning.
                    warn!(addr = %self.local_addr, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Open connections of a generation, force-closable as a whole.
///
/// Each entry holds a duplicate of the connection's descriptor; shutting that
/// duplicate down tears down the connection no matter what the handler is
/// blocked on.
#[derive(Clone, Default)]
pub(crate) struct ConnectionSet {
    inner: Arc<ConnectionSetInner>,
}

#[derive(Default)]
struct ConnectionSetInner {
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, OwnedFd>>,
}

impl ConnectionSetInner {
    fn open(&self) -> MutexGuard<'_, HashMap<u64, OwnedFd>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectionSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn track(&self, stream: TcpStream) -> io::Result<TrackedStream> {
        let fd = stream.as_fd().try_clone_to_owned()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.open().insert(id, fd);
        Ok(TrackedStream {
            stream,
            _entry: ConnectionEntry {
                id,
                set: Arc::clone(&self.inner),
            },
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.open().len()
    }

    /// Shut down every open connection. Returns how many there were.
    pub(crate) fn force_close_all(&self) -> usize {
        let open = std::mem::take(&mut *self.inner.open());
        for fd in open.values() {
            unsafe { libc::shutdown(fd.as_raw_fd(), libc::SHUT_RDWR) };
        }
        open.len()
    }
}

struct ConnectionEntry {
    id: u64,
    set: Arc<ConnectionSetInner>,
}

impl Drop for ConnectionEntry {
    fn drop(&mut self) {
        self.set.open().remove(&self.id);
    }
}

/// An accepted connection, tracked until dropped.
pub struct TrackedStream {
    stream: TcpStream,
    _entry: ConnectionEntry,
}

impl TrackedStream {
    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Generation;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Echoes one line per connection, counting it as a request.
    struct Echo {
        generation: Arc<Generation>,
    }

    #[async_trait]
    impl Handler for Echo {
        async fn serve(&self, mut incoming: Incoming) -> io::Result<()> {
            let mut connections = tokio::task::JoinSet::new();
            while let Some((mut stream, _peer)) = incoming.accept().await {
                let requests = self.generation.requests().clone();
                connections.spawn(async move {
                    let mut buf = [0u8; 64];
                    let n = stream.read(&mut buf).await?;
                    let _request = requests.enter();
                    stream.write_all(&buf[..n]).await?;
                    Ok::<_, io::Error>(())
                });
            }
            while connections.join_next().await.is_some() {}
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_attached_handler_serves_connections() {
        let generation = Arc::new(Generation::new());
        let listener = generation.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        generation
            .attach(
                &listener,
                Arc::new(Echo {
                    generation: Arc::clone(&generation),
                }),
            )
            .unwrap();
        generation.mark_ready().unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(generation.requests().total(), 1);
    }

    #[tokio::test]
    async fn test_accept_ends_when_listener_closes() {
        let generation = Generation::new();
        let listener = generation.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut incoming = Incoming::new(&listener, ConnectionSet::new()).unwrap();

        generation.registry().close(&listener);
        assert!(incoming.accept().await.is_none());
        assert!(incoming.accept().await.is_none());
        assert!(TcpStream::connect(listener.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_force_close_tears_down_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = ConnectionSet::new();

        let mut clients = Vec::new();
        let mut tracked = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(addr).await.unwrap());
            let (stream, _) = listener.accept().await.unwrap();
            tracked.push(connections.track(stream).unwrap());
        }
        assert_eq!(connections.len(), 3);

        assert_eq!(connections.force_close_all(), 3);
        assert_eq!(connections.len(), 0);

        for client in &mut clients {
            let mut buf = [0u8; 1];
            let read = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
                .await
                .expect("peer should observe the close");
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        // Server side reads fail or hit EOF as well.
        let mut buf = [0u8; 1];
        assert!(matches!(tracked[0].read(&mut buf).await, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_dropped_stream_leaves_the_set() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connections = ConnectionSet::new();
        let _client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let tracked = connections.track(stream).unwrap();
        assert_eq!(connections.len(), 1);
        drop(tracked);
        assert_eq!(connections.len(), 0);
    }
}
