/**
 * net/tcp.rs
 *
 * Thin TCP connection and listener wrappers: inbound data is delivered on a
 * `Queue`, writes are ordered through a single writer task
 */

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::net::Endpoint;
use crate::queue::Queue;

/// Size of a single socket read
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// How long `close` waits for queued writes to flush
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a TCP connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketCloseKind {
    WeClosedIt,
    RemotelyClosed,
    NeverConnected,
}

enum WriteCommand {
    Data(Bytes, oneshot::Sender<io::Result<()>>),
    Close,
}

struct ConnectionInner {
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    data_from_socket: Queue<Bytes>,
    writes: mpsc::UnboundedSender<WriteCommand>,
    paused: watch::Sender<bool>,
    closed: watch::Sender<Option<SocketCloseKind>>,
    /// Stops the reader
    shutdown: CancellationToken,
    /// Stops the writer without flushing
    abort: CancellationToken,
    /// Cancelled once the writer has exited
    writer_done: CancellationToken,
}

impl ConnectionInner {
    /// Record the close reason; the first caller wins
    fn mark_closed(&self, kind: SocketCloseKind) -> bool {
        self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(kind);
                true
            } else {
                false
            }
        })
    }
}

/// A connected TCP socket
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<ConnectionInner>,
}

impl TcpConnection {
    /// Connect to `endpoint`, resolving DNS names if needed
    pub async fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        let stream = match endpoint.socket_addr() {
            Some(addr) => TcpStream::connect(addr).await?,
            None => TcpStream::connect((endpoint.address.as_str(), endpoint.port)).await?,
        };
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream and start its reader and writer
    pub fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let (writes, write_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ConnectionInner {
            local_addr,
            remote_addr,
            data_from_socket: Queue::new(),
            writes,
            paused: watch::channel(false).0,
            closed: watch::channel(None).0,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            writer_done: CancellationToken::new(),
        });

        if remote_addr.is_none() {
            inner.mark_closed(SocketCloseKind::NeverConnected);
            inner.shutdown.cancel();
            inner.writer_done.cancel();
            return Self { inner };
        }

        tokio::spawn(read_loop(Arc::clone(&inner), reader));
        tokio::spawn(write_loop(Arc::clone(&inner), writer, write_rx));
        Self { inner }
    }

    /// Bytes read from the socket, one item per read
    pub fn data_from_socket_queue(&self) -> &Queue<Bytes> {
        &self.inner.data_from_socket
    }

    /// Queue `data` for writing
    ///
    /// The write is ordered at call time; the returned future only reports
    /// its outcome and may be dropped.
    pub fn send(&self, data: Bytes) -> impl Future<Output = io::Result<()>> + Send + 'static {
        let (ack, result) = oneshot::channel();
        let queued = self.inner.writes.send(WriteCommand::Data(data, ack)).is_ok();
        async move {
            if !queued {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            result
                .await
                .unwrap_or_else(|_| Err(io::ErrorKind::BrokenPipe.into()))
        }
    }

    /// Stop reading from the socket until `resume`
    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Close the connection after flushing queued writes; idempotent
    pub async fn close(&self) {
        if self.inner.mark_closed(SocketCloseKind::WeClosedIt) {
            debug!(remote = ?self.inner.remote_addr, "closing TCP connection");
        }
        let _ = self.inner.writes.send(WriteCommand::Close);
        self.inner.shutdown.cancel();

        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.inner.writer_done.cancelled())
            .await
            .is_err()
        {
            warn!(remote = ?self.inner.remote_addr, "TCP flush timed out, dropping queued writes");
            self.inner.abort.cancel();
        }
    }

    /// Resolves with the close reason once the connection has ended
    pub fn on_close(&self) -> impl Future<Output = SocketCloseKind> + Send + 'static {
        let mut closed = self.inner.closed.subscribe();
        async move {
            loop {
                if let Some(kind) = *closed.borrow_and_update() {
                    return kind;
                }
                if closed.changed().await.is_err() {
                    return SocketCloseKind::WeClosedIt;
                }
            }
        }
    }

    pub fn close_kind(&self) -> Option<SocketCloseKind> {
        *self.inner.closed.borrow()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }
}

async fn read_loop(inner: Arc<ConnectionInner>, mut reader: OwnedReadHalf) {
    let mut paused = inner.paused.subscribe();

    let kind = loop {
        if *paused.borrow_and_update() {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break SocketCloseKind::WeClosedIt,
                changed = paused.changed() => {
                    if changed.is_err() {
                        break SocketCloseKind::WeClosedIt;
                    }
                    continue;
                }
            }
        }

        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        tokio::select! {
            _ = inner.shutdown.cancelled() => break SocketCloseKind::WeClosedIt,
            _ = paused.changed() => continue,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break SocketCloseKind::RemotelyClosed,
                Ok(_) => inner.data_from_socket.push(buf.freeze()),
                Err(e) => {
                    debug!(remote = ?inner.remote_addr, "TCP read failed: {}", e);
                    break SocketCloseKind::RemotelyClosed;
                }
            },
        }
    };

    if kind == SocketCloseKind::RemotelyClosed && inner.mark_closed(kind) {
        debug!(remote = ?inner.remote_addr, "TCP connection closed by remote");
        let _ = inner.writes.send(WriteCommand::Close);
    }
}

async fn write_loop(
    inner: Arc<ConnectionInner>,
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
) {
    loop {
        let command = tokio::select! {
            _ = inner.abort.cancelled() => break,
            command = commands.recv() => command,
        };
        match command {
            Some(WriteCommand::Data(data, ack)) => {
                let result = tokio::select! {
                    _ = inner.abort.cancelled() => Err(io::ErrorKind::BrokenPipe.into()),
                    result = writer.write_all(&data) => result,
                };
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    if inner.mark_closed(SocketCloseKind::RemotelyClosed) {
                        debug!(remote = ?inner.remote_addr, "TCP write failed, treating as remote close");
                    }
                    inner.shutdown.cancel();
                    break;
                }
            }
            Some(WriteCommand::Close) | None => break,
        }
    }

    let _ = writer.shutdown().await;

    // Fail whatever is still queued
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let WriteCommand::Data(_, ack) = command {
            let _ = ack.send(Err(io::ErrorKind::BrokenPipe.into()));
        }
    }
    inner.writer_done.cancel();
}

/// Bind a listening socket with address reuse enabled
pub(crate) fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// TCP listener delivering accepted connections on a `Queue`
pub struct TcpServer {
    endpoint: Endpoint,
    connections: Queue<TcpConnection>,
    bound: Mutex<Option<Endpoint>>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
}

impl TcpServer {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connections: Queue::new(),
            bound: Mutex::new(None),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    /// Bind and start accepting; resolves with the bound endpoint
    pub async fn listen(&self) -> io::Result<Endpoint> {
        if self.shutdown.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "server shut down"));
        }
        let addr = match self.endpoint.socket_addr() {
            Some(addr) => addr,
            None => tokio::net::lookup_host((self.endpoint.address.as_str(), self.endpoint.port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "listen address did not resolve")
                })?,
        };

        let listener = bind_listener(addr)?;
        let bound: Endpoint = listener.local_addr()?.into();
        *self.bound.lock() = Some(bound.clone());
        debug!(%bound, "TCP server listening");

        let connections = self.connections.clone();
        let shutdown = self.shutdown.clone();
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            accept_loop(listener, connections, shutdown).await;
            stopped.cancel();
        });

        Ok(bound)
    }

    pub fn connections_queue(&self) -> &Queue<TcpConnection> {
        &self.connections
    }

    pub fn bound_endpoint(&self) -> Option<Endpoint> {
        self.bound.lock().clone()
    }

    /// Stop accepting; idempotent
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if self.bound.lock().is_some() {
            self.stopped.cancelled().await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    connections: Queue<TcpConnection>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted TCP connection");
                    connections.push(TcpConnection::from_stream(stream));
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
}
