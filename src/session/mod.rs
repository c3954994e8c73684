/**
 * session/mod.rs
 *
 * Per-connection sessions pairing one TCP connection with one data channel
 */

pub mod client;
pub mod remote;

pub use client::ClientSession;
pub use remote::RemoteSession;

use bytes::Bytes;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::net::TcpConnection;
use crate::peer::{Data, DataChannel, SendBufferState};
use crate::queue::Queue;

/// Session lifecycle: `Negotiating -> Forwarding -> Stopping -> Stopped`,
/// where `Forwarding` is skipped when the handshake fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Negotiating,
    Forwarding,
    Stopping,
    Stopped,
}

/// Byte counters shared by every session of an orchestrator
///
/// Each forwarded chunk pushes its length; `bytes_sent` counts bytes sent
/// to the peer, `bytes_received` bytes received from it.
#[derive(Debug, Clone, Default)]
pub struct Meters {
    pub bytes_sent: Queue<usize>,
    pub bytes_received: Queue<usize>,
}

/// State shared by both session kinds
pub(crate) struct SessionCore {
    channel: DataChannel,
    meters: Meters,
    state: watch::Sender<SessionState>,
    stop: CancellationToken,
}

impl SessionCore {
    pub(crate) fn new(channel: DataChannel, meters: Meters) -> Arc<Self> {
        Arc::new(Self {
            channel,
            meters,
            state: watch::channel(SessionState::Negotiating).0,
            stop: CancellationToken::new(),
        })
    }

    pub(crate) fn label(&self) -> &str {
        self.channel.label()
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Advance the state; moving backwards is ignored
    fn advance(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }

    pub(crate) fn once_stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.state.subscribe();
        async move {
            let _ = state.wait_for(|s| *s == SessionState::Stopped).await;
        }
    }

    /// Run `work` until it finishes or the session is torn down underneath
    /// it, whichever comes first
    pub(crate) async fn guard<T>(
        &self,
        tcp: Option<&TcpConnection>,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let tcp_closed = async {
            match tcp {
                Some(tcp) => {
                    tcp.on_close().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            result = work => result,
            _ = self.stop.cancelled() => Err(Error::Cancelled),
            _ = self.channel.on_close() => Err(Error::ChannelClosed),
            _ = tcp_closed => Err(Error::Transport(io::ErrorKind::ConnectionAborted.into())),
        }
    }

    /// Receive exactly one text control message
    pub(crate) async fn next_control_message(&self) -> Result<String> {
        match self.channel.data_from_peer_queue().set_next_handler().await? {
            Data::Text(text) => Ok(text),
            Data::Binary(_) => Err(Error::protocol("expected a text control message")),
        }
    }

    /// Send one JSON control message
    pub(crate) fn send_control_message(&self, message: &impl serde::Serialize) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.channel.send(Data::Text(json))
    }

    /// Link `tcp` and the channel in both directions until either side
    /// closes or the session is stopped
    pub(crate) async fn forward(&self, tcp: &TcpConnection) {
        if !self.advance(SessionState::Forwarding) {
            return;
        }
        debug!(label = %self.label(), "forwarding");

        let to_peer = self.channel.clone();
        let sent = self.meters.bytes_sent.clone();
        let label = self.label().to_string();
        tcp.data_from_socket_queue().set_handler(move |data: Bytes| {
            let len = data.len();
            match to_peer.send(Data::Binary(data)) {
                Ok(()) => sent.push(len),
                Err(e) => debug!(%label, "dropping {} bytes for the peer: {}", len, e),
            }
        });

        let to_socket = tcp.clone();
        let received = self.meters.bytes_received.clone();
        let label = self.label().to_string();
        self.channel
            .data_from_peer_queue()
            .set_handler(move |data| match data {
                Data::Binary(bytes) => {
                    let len = bytes.len();
                    // Write order is fixed at call time; completion is not awaited
                    let _ = to_socket.send(bytes);
                    received.push(len);
                }
                Data::Text(_) => warn!(%label, "ignoring text message while forwarding"),
            });

        let throttled = tcp.clone();
        self.channel
            .send_buffer_queue()
            .set_handler(move |state| match state {
                SendBufferState::Overflow => throttled.pause(),
                SendBufferState::Drained => throttled.resume(),
            });
        tcp.resume();

        tokio::select! {
            _ = self.stop.cancelled() => debug!(label = %self.label(), "stop requested"),
            kind = tcp.on_close() => debug!(label = %self.label(), ?kind, "socket closed"),
            _ = self.channel.on_close() => debug!(label = %self.label(), "data channel closed"),
        }
    }

    /// Close both resources; safe from any phase
    pub(crate) async fn shutdown(&self, tcp: Option<&TcpConnection>) {
        if !self.advance(SessionState::Stopping) {
            return;
        }
        self.stop.cancel();
        self.channel.close();
        if let Some(tcp) = tcp {
            tcp.close().await;
            tcp.data_from_socket_queue().stop_handling();
        }
        self.channel.data_from_peer_queue().stop_handling();
        self.channel.send_buffer_queue().stop_handling();
        self.advance(SessionState::Stopped);
        debug!(label = %self.label(), "session stopped");
    }
}
