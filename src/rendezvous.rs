/**
 * rendezvous.rs
 *
 * WebSocket rendezvous client relaying signalling messages between two
 * peers registered under fingerprints (TLS with self-signed certs allowed
 * for development)
 */

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use native_tls::TlsConnector;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::peer::{PeerConnection, SignallingMessage};

/// Interval between keepalives sent to the rendezvous server
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Envelopes exchanged with the rendezvous server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Register {
        fingerprint: String,
    },
    RegisterAck {
        success: bool,
        message: String,
    },
    /// Ask the server to deliver `message` to `target_fingerprint`
    Relay {
        target_fingerprint: String,
        message: SignallingMessage,
    },
    /// A message relayed to us from `from_fingerprint`
    Forward {
        from_fingerprint: String,
        message: SignallingMessage,
    },
    Keepalive,
    Error {
        message: String,
    },
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type Socket = WebSocketStream<Box<dyn Transport>>;

pub struct RendezvousClient {
    ws: Socket,
    local_fingerprint: Option<String>,
}

impl RendezvousClient {
    /// Connect to `url` (`ws://` or `wss://`)
    pub async fn connect(url: &str, accept_invalid_certs: bool) -> Result<Self> {
        let req = url
            .into_client_request()
            .context("Invalid rendezvous URL")?;

        let secure = match req.uri().scheme_str() {
            Some("wss") => true,
            Some("ws") => false,
            other => bail!("Unsupported rendezvous scheme: {:?}", other),
        };
        let host = req
            .uri()
            .host()
            .ok_or_else(|| anyhow!("Missing hostname"))?
            .to_string();
        let port = req
            .uri()
            .port_u16()
            .unwrap_or(if secure { 443 } else { 80 });

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .context("TCP connection failed")?;

        let stream: Box<dyn Transport> = if secure {
            let mut builder = TlsConnector::builder();
            builder.danger_accept_invalid_certs(accept_invalid_certs);
            let tls = tokio_native_tls::TlsConnector::from(
                builder.build().context("Failed to build TLS connector")?,
            );
            let tls_stream = tls
                .connect(&host, tcp)
                .await
                .context("TLS handshake failed")?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };

        let (ws, _resp) = tokio_tungstenite::client_async(req, stream)
            .await
            .context("WebSocket upgrade failed")?;
        debug!(%url, "rendezvous connected");

        Ok(Self {
            ws,
            local_fingerprint: None,
        })
    }

    /// Register our fingerprint and wait for the acknowledgement
    pub async fn register(&mut self, fingerprint: &str) -> Result<()> {
        self.send_envelope(&Envelope::Register {
            fingerprint: fingerprint.to_string(),
        })
        .await?;

        match self.receive_envelope().await? {
            Envelope::RegisterAck { success: true, .. } => {
                self.local_fingerprint = Some(fingerprint.to_string());
                info!(%fingerprint, "registered with rendezvous server");
                Ok(())
            }
            Envelope::RegisterAck { message, .. } => Err(anyhow!("Registration failed: {}", message)),
            Envelope::Error { message } => Err(anyhow!("Registration failed: {}", message)),
            other => Err(anyhow!("Unexpected registration response: {:?}", other)),
        }
    }

    /// Relay signalling between `peer` and `target` until the peer
    /// connection ends or the server goes away
    pub async fn pump(self, peer: PeerConnection, target: &str) -> Result<()> {
        if self.local_fingerprint.is_none() {
            bail!("Not registered");
        }

        let (tx, mut outgoing) = mpsc::unbounded_channel();
        peer.signal_for_peer_queue().set_handler(move |message| {
            let _ = tx.send(message);
        });

        let (mut sink, mut stream) = self.ws.split();
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        let disconnected = peer.once_disconnected();
        tokio::pin!(disconnected);

        let result = loop {
            tokio::select! {
                _ = &mut disconnected => break Ok(()),
                Some(message) = outgoing.recv() => {
                    let envelope = Envelope::Relay {
                        target_fingerprint: target.to_string(),
                        message,
                    };
                    if let Err(e) = send(&mut sink, &envelope).await {
                        break Err(e);
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = send(&mut sink, &Envelope::Keepalive).await {
                        break Err(e);
                    }
                }
                incoming = stream.next() => {
                    let message = match incoming {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => break Err(anyhow!(e).context("WebSocket receive failed")),
                        None => break Err(anyhow!("Connection closed")),
                    };
                    match message {
                        Message::Text(text) => match serde_json::from_str::<Envelope>(&text) {
                            Ok(Envelope::Forward { from_fingerprint, message }) if from_fingerprint == target => {
                                peer.handle_signal_message(message);
                            }
                            Ok(Envelope::Forward { from_fingerprint, .. }) => {
                                debug!(%from_fingerprint, "ignoring signalling from unexpected peer");
                            }
                            Ok(Envelope::Error { message }) => warn!("rendezvous error: {}", message),
                            Ok(_) => {}
                            Err(e) => warn!("Failed to decode rendezvous message: {}", e),
                        },
                        Message::Ping(data) => {
                            if let Err(e) = sink.send(Message::Pong(data)).await {
                                break Err(anyhow!(e).context("WebSocket send failed"));
                            }
                        }
                        Message::Close(_) => break Err(anyhow!("Server closed WebSocket")),
                        _ => {}
                    }
                }
            }
        };

        peer.signal_for_peer_queue().stop_handling();
        let _ = sink.close().await;
        result
    }

    async fn send_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        send(&mut self.ws, envelope).await
    }

    async fn receive_envelope(&mut self) -> Result<Envelope> {
        loop {
            let msg = self
                .ws
                .next()
                .await
                .ok_or_else(|| anyhow!("Connection closed"))??;

            match msg {
                Message::Text(text) => {
                    return serde_json::from_str(&text)
                        .context("Failed to decode rendezvous message");
                }
                Message::Ping(data) => {
                    self.ws.send(Message::Pong(data)).await?;
                }
                Message::Close(_) => bail!("Server closed WebSocket"),
                _ => {}
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws
            .close(None)
            .await
            .context("Failed closing WebSocket")?;
        Ok(())
    }
}

async fn send<S>(sink: &mut S, envelope: &Envelope) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(envelope).context("Message serialization failed")?;
    sink.send(Message::Text(json))
        .await
        .context("WebSocket send failed")?;
    Ok(())
}
