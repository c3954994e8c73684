/**
 * socks_to_rtc.rs
 *
 * SOCKS5 front-end: accepts local connections and tunnels each one over
 * its own data channel to the peer
 */

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PeerConnectionConfig;
use crate::error::{Error, Result};
use crate::net::{Endpoint, TcpConnection, TcpServer};
use crate::peer::{PeerConnection, SignallingMessage};
use crate::queue::Queue;
use crate::session::{ClientSession, Meters};

/// Owns the listener, the peer connection and one `ClientSession` per
/// accepted connection
#[derive(Clone)]
pub struct SocksToRtc {
    inner: Arc<Inner>,
}

struct Inner {
    peer: PeerConnection,
    server: Mutex<Option<Arc<TcpServer>>>,
    sessions: Mutex<HashMap<String, ClientSession>>,
    meters: Meters,
    next_label: AtomicU64,
    stopping: CancellationToken,
    stopped: watch::Sender<bool>,
}

impl SocksToRtc {
    pub fn new(config: PeerConnectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                peer: PeerConnection::new(config),
                server: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
                meters: Meters::default(),
                next_label: AtomicU64::new(0),
                stopping: CancellationToken::new(),
                stopped: watch::channel(false).0,
            }),
        }
    }

    /// Listen on `endpoint` and connect to the peer
    ///
    /// Resolves with the bound endpoint once both are up. Fails, and stops
    /// the orchestrator, if either fails or `stop` is called first.
    pub async fn start(&self, endpoint: Endpoint) -> Result<Endpoint> {
        let server = Arc::new(TcpServer::new(endpoint));
        {
            let mut slot = self.inner.server.lock();
            if slot.is_some() || self.inner.stopping.is_cancelled() {
                return Err(Error::protocol("SOCKS front-end already started"));
            }
            *slot = Some(Arc::clone(&server));
        }

        let watcher = Arc::downgrade(&self.inner);
        let disconnected = self.inner.peer.once_disconnected();
        tokio::spawn(async move {
            disconnected.await;
            if let Some(inner) = watcher.upgrade() {
                debug!("peer connection ended, stopping SOCKS front-end");
                inner.stop();
            }
        });

        match self.bring_up(&server).await {
            Ok(bound) => {
                info!(%bound, "SOCKS front-end ready");
                Ok(bound)
            }
            Err(e) => {
                warn!("SOCKS front-end failed to start: {}", e);
                self.inner.stop();
                Err(e)
            }
        }
    }

    async fn bring_up(&self, server: &TcpServer) -> Result<Endpoint> {
        let stopping = self.inner.stopping.clone();
        let bound = tokio::select! {
            bound = server.listen() => bound?,
            _ = stopping.cancelled() => return Err(Error::Cancelled),
        };
        debug!(%bound, "listening for SOCKS clients");

        let connected = self.inner.peer.negotiate_connection();
        let addresses = tokio::select! {
            addresses = connected => addresses?,
            _ = stopping.cancelled() => return Err(Error::Cancelled),
        };
        info!(
            local = %addresses.local,
            remote = %addresses.remote,
            "peer connected"
        );

        let weak = Arc::downgrade(&self.inner);
        server
            .connections_queue()
            .set_handler(move |tcp| accept_connection(&weak, tcp));
        Ok(bound)
    }

    /// Where the listener is bound, once it is
    pub fn bound_endpoint(&self) -> Option<Endpoint> {
        self.inner
            .server
            .lock()
            .as_ref()
            .and_then(|server| server.bound_endpoint())
    }

    pub fn peer_connection(&self) -> &PeerConnection {
        &self.inner.peer
    }

    /// Messages for the host to relay to the remote peer
    pub fn signal_for_peer_queue(&self) -> &Queue<SignallingMessage> {
        self.inner.peer.signal_for_peer_queue()
    }

    pub fn handle_signal_message(&self, message: SignallingMessage) {
        self.inner.peer.handle_signal_message(message);
    }

    pub fn meters(&self) -> &Meters {
        &self.inner.meters
    }

    /// Number of sessions that have not yet stopped
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Stop listening, stop every session and close the peer connection;
    /// idempotent
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn once_stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut stopped = self.inner.stopped.subscribe();
        async move {
            let _ = stopped.wait_for(|s| *s).await;
        }
    }
}

impl Inner {
    fn stop(self: &Arc<Self>) {
        if self.stopping.is_cancelled() {
            return;
        }
        self.stopping.cancel();
        tokio::spawn(teardown(Arc::clone(self)));
    }
}

fn accept_connection(inner: &Weak<Inner>, tcp: TcpConnection) {
    match inner.upgrade() {
        Some(inner) => {
            let label = format!("c{}", inner.next_label.fetch_add(1, Ordering::Relaxed));
            tokio::spawn(open_session(inner, tcp, label));
        }
        None => {
            tokio::spawn(async move { tcp.close().await });
        }
    }
}

async fn open_session(inner: Arc<Inner>, tcp: TcpConnection, label: String) {
    debug!(%label, client = ?tcp.remote_addr(), "SOCKS client connected");
    let channel = match inner.peer.open_data_channel(&label).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(%label, "could not open data channel: {}", e);
            tcp.close().await;
            return;
        }
    };

    let session = ClientSession::start(tcp, channel, inner.meters.clone());
    inner.sessions.lock().insert(label.clone(), session.clone());
    if inner.stopping.is_cancelled() {
        session.stop();
    }

    session.once_stopped().await;
    inner.sessions.lock().remove(&label);
    debug!(%label, "session removed");
}

async fn teardown(inner: Arc<Inner>) {
    let server = inner.server.lock().take();
    if let Some(server) = server {
        server.shutdown().await;
        close_pending(&server).await;
    }

    let sessions: Vec<ClientSession> = inner.sessions.lock().values().cloned().collect();
    for session in &sessions {
        session.stop();
    }
    for session in sessions {
        session.once_stopped().await;
    }

    inner.peer.close();
    inner.stopped.send_replace(true);
    info!("SOCKS front-end stopped");
}

/// Close connections accepted before the peer came up; they never got a
/// session
async fn close_pending(server: &TcpServer) {
    let pending = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&pending);
    let queue = server.connections_queue();
    queue.set_handler(move |tcp: TcpConnection| sink.lock().push(tcp));
    queue.stop_handling();

    let pending: Vec<TcpConnection> = std::mem::take(&mut *pending.lock());
    if !pending.is_empty() {
        debug!(count = pending.len(), "closing connections that never got a session");
    }
    for tcp in pending {
        tcp.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback() -> PeerConnectionConfig {
        PeerConnectionConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..PeerConnectionConfig::named("socks")
        }
    }

    #[tokio::test]
    async fn test_stop_before_peer_answers() {
        let socks = SocksToRtc::new(loopback());
        let starting = tokio::spawn({
            let socks = socks.clone();
            async move { socks.start(Endpoint::new("127.0.0.1", 0)).await }
        });

        // The offer is queued once negotiation begins
        socks.signal_for_peer_queue().set_next_handler().await.unwrap();
        socks.stop();
        socks.stop();

        assert!(starting.await.unwrap().is_err());
        socks.once_stopped().await;
        assert_eq!(
            socks.peer_connection().state(),
            crate::peer::PeerConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_stop_closes_connections_waiting_for_peer() {
        use std::time::Duration;
        use tokio::io::AsyncReadExt;
        use tokio::time::timeout;

        let socks = SocksToRtc::new(loopback());
        let starting = tokio::spawn({
            let socks = socks.clone();
            async move { socks.start(Endpoint::new("127.0.0.1", 0)).await }
        });
        socks.signal_for_peer_queue().set_next_handler().await.unwrap();

        let bound = socks.bound_endpoint().unwrap();
        let mut client = tokio::net::TcpStream::connect(bound.socket_addr().unwrap())
            .await
            .unwrap();
        let server = socks.inner.server.lock().clone().unwrap();
        timeout(Duration::from_secs(5), async {
            while server.connections_queue().len() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection never accepted");

        socks.stop();
        assert!(starting.await.unwrap().is_err());
        socks.once_stopped().await;
        assert!(server.connections_queue().is_empty());

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(3), client.read(&mut buf))
            .await
            .expect("client socket still open after stop");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_start_after_stop_fails() {
        let socks = SocksToRtc::new(loopback());
        socks.stop();
        socks.once_stopped().await;
        assert!(socks.start(Endpoint::new("127.0.0.1", 0)).await.is_err());
    }
}
