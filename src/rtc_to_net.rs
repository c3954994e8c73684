/**
 * rtc_to_net.rs
 *
 * Network-facing relay: accepts data channels from the peer and connects
 * each one to its requested destination
 */

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PeerConnectionConfig, ProxyConfig};
use crate::error::{Error, Result};
use crate::peer::{ConnectionAddresses, DataChannel, PeerConnection, SignallingMessage};
use crate::queue::Queue;
use crate::session::{Meters, RemoteSession};

/// Owns the peer connection and one `RemoteSession` per peer-opened channel
#[derive(Clone)]
pub struct RtcToNet {
    inner: Arc<Inner>,
}

struct Inner {
    peer: PeerConnection,
    proxy: ProxyConfig,
    sessions: Mutex<HashMap<String, RemoteSession>>,
    meters: Meters,
    started: Mutex<bool>,
    stopping: CancellationToken,
    stopped: watch::Sender<bool>,
}

impl RtcToNet {
    pub fn new(config: PeerConnectionConfig, proxy: ProxyConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                peer: PeerConnection::new(config),
                proxy,
                sessions: Mutex::new(HashMap::new()),
                meters: Meters::default(),
                started: Mutex::new(false),
                stopping: CancellationToken::new(),
                stopped: watch::channel(false).0,
            }),
        }
    }

    /// Wait for the peer to connect and serve its channels from then on
    ///
    /// The peer drives negotiation; its offer arrives through
    /// `handle_signal_message`.
    pub async fn start(&self) -> Result<ConnectionAddresses> {
        {
            let mut started = self.inner.started.lock();
            if *started || self.inner.stopping.is_cancelled() {
                return Err(Error::protocol("relay already started"));
            }
            *started = true;
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .peer
            .peer_opened_channel_queue()
            .set_handler(move |channel| accept_channel(&weak, channel));

        let watcher = Arc::downgrade(&self.inner);
        let disconnected = self.inner.peer.once_disconnected();
        tokio::spawn(async move {
            disconnected.await;
            if let Some(inner) = watcher.upgrade() {
                debug!("peer connection ended, stopping relay");
                inner.stop();
            }
        });

        let connected = self.inner.peer.once_connected();
        let outcome = tokio::select! {
            outcome = connected => outcome,
            _ = self.inner.stopping.cancelled() => Err(Error::Cancelled),
        };
        match outcome {
            Ok(addresses) => {
                info!(
                    local = %addresses.local,
                    remote = %addresses.remote,
                    "relay connected to peer"
                );
                Ok(addresses)
            }
            Err(e) => {
                warn!("relay failed to connect: {}", e);
                self.inner.stop();
                Err(e)
            }
        }
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

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Stop every session and close the peer connection; idempotent
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

fn accept_channel(inner: &Weak<Inner>, channel: DataChannel) {
    let Some(inner) = inner.upgrade() else {
        channel.close();
        return;
    };
    if inner.stopping.is_cancelled() {
        channel.close();
        return;
    }

    let label = channel.label().to_string();
    debug!(%label, "peer opened a channel");
    let session = RemoteSession::start(channel, inner.proxy, inner.meters.clone());
    inner.sessions.lock().insert(label.clone(), session.clone());

    tokio::spawn(async move {
        session.once_stopped().await;
        inner.sessions.lock().remove(&label);
        debug!(%label, "session removed");
    });
}

async fn teardown(inner: Arc<Inner>) {
    inner.peer.peer_opened_channel_queue().stop_handling();

    let sessions: Vec<RemoteSession> = inner.sessions.lock().values().cloned().collect();
    for session in &sessions {
        session.stop();
    }
    for session in sessions {
        session.once_stopped().await;
    }

    inner.peer.close();
    inner.stopped.send_replace(true);
    info!("relay stopped");
}
