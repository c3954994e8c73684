/**
 * cli.rs
 *
 * Command line interface: argument parsing, logging setup and the two run
 * modes of the binary
 */

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{PeerConnectionConfig, ProxyConfig, DEFAULT_STUN_SERVER};
use crate::net::Endpoint;
use crate::peer::{Caesar, Obfuscator, PeerConnection, PeerConnectionState};
use crate::rendezvous::RendezvousClient;
use crate::rtc_to_net::RtcToNet;
use crate::session::Meters;
use crate::socks_to_rtc::SocksToRtc;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "peersocks",
    version,
    about = "SOCKS5 proxy tunnelled over an encrypted peer-to-peer transport"
)]
pub struct Cli {
    /// Rendezvous WebSocket server, e.g. wss://example.com:8443
    #[arg(long, env = "SIGNALLING_URL")]
    pub signalling_url: String,

    /// STUN server used to discover the public address (host:port)
    #[arg(long, env = "STUN_SERVER", default_value = DEFAULT_STUN_SERVER)]
    pub stun_server: String,

    /// Our identity on the rendezvous server; random when unset
    #[arg(long, env = "LOCAL_FINGERPRINT")]
    pub fingerprint: Option<String>,

    /// Accept self-signed rendezvous certificates
    #[arg(long)]
    pub accept_invalid_certs: bool,

    /// Local address for peer candidates
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Shift every link byte by this amount (both peers must agree)
    #[arg(long)]
    pub caesar: Option<u8>,

    /// Log level override
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Mode {
    /// Accept SOCKS5 clients locally and tunnel them to `peer`
    Socks {
        /// Fingerprint of the relaying peer
        peer: String,

        /// SOCKS5 listen address
        #[arg(short, long, default_value = "127.0.0.1:1080")]
        listen: Endpoint,
    },
    /// Connect channels opened by `peer` to their destinations
    Relay {
        /// Fingerprint of the SOCKS peer
        peer: String,

        /// Allow loopback, private and link-local destinations
        #[arg(long)]
        allow_non_unicast: bool,

        /// Destination connect timeout in seconds, 0 to disable
        #[arg(long, default_value_t = 30)]
        connect_timeout: u64,
    },
}

impl Cli {
    fn peer_config(&self, name: &str) -> PeerConnectionConfig {
        PeerConnectionConfig {
            bind_address: self.bind,
            stun_servers: vec![self.stun_server.clone()],
            obfuscator: self
                .caesar
                .map(|shift| -> Arc<dyn Obfuscator> { Arc::new(Caesar::new(shift)) }),
            ..PeerConnectionConfig::named(name)
        }
    }
}

/// Install the global subscriber; `level` wins over `RUST_LOG`
pub fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run the binary with parsed arguments until the peer goes away or a
/// shutdown signal arrives
pub async fn run(cli: Cli) -> Result<()> {
    init_tracing(cli.log_level.as_deref());

    let local = cli.fingerprint.clone().unwrap_or_else(|| {
        let random_id = format!("peer_{}", rand::random::<u32>());
        warn!("LOCAL_FINGERPRINT not set, using random ID: {}", random_id);
        random_id
    });
    let peer = match &cli.mode {
        Mode::Socks { peer, .. } | Mode::Relay { peer, .. } => peer.clone(),
    };
    if local == peer {
        bail!("Cannot connect to yourself: local fingerprint equals the peer's");
    }

    info!(
        signalling = %cli.signalling_url,
        stun = %cli.stun_server,
        fingerprint = %local,
        peer = %peer,
        "configuration"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal_handler().await;
        info!("shutdown signal received");
        signal.cancel();
    });

    let mut rendezvous = RendezvousClient::connect(&cli.signalling_url, cli.accept_invalid_certs)
        .await
        .context("Failed to connect to rendezvous server")?;
    rendezvous
        .register(&local)
        .await
        .context("Failed to register with rendezvous server")?;

    let config = cli.peer_config(&local);
    match cli.mode {
        Mode::Socks { listen, .. } => {
            let socks = SocksToRtc::new(config);
            spawn_pump(rendezvous, socks.peer_connection().clone(), peer);
            let totals = Totals::attach(socks.meters());

            tokio::select! {
                bound = socks.start(listen) => {
                    let bound = bound.context("SOCKS front-end failed to start")?;
                    info!(%bound, "accepting SOCKS5 connections");
                    wait(&shutdown, socks.once_stopped()).await;
                }
                _ = shutdown.cancelled() => {}
            }
            socks.stop();
            socks.once_stopped().await;
            totals.report();
        }
        Mode::Relay {
            allow_non_unicast,
            connect_timeout,
            ..
        } => {
            let proxy = ProxyConfig {
                allow_non_unicast,
                connect_timeout: (connect_timeout > 0).then(|| Duration::from_secs(connect_timeout)),
            };
            let relay = RtcToNet::new(config, proxy);
            spawn_pump(rendezvous, relay.peer_connection().clone(), peer);
            let totals = Totals::attach(relay.meters());

            tokio::select! {
                connected = relay.start() => {
                    connected.context("Relay failed to connect to peer")?;
                    wait(&shutdown, relay.once_stopped()).await;
                }
                _ = shutdown.cancelled() => {}
            }
            relay.stop();
            relay.once_stopped().await;
            totals.report();
        }
    }
    Ok(())
}

fn spawn_pump(rendezvous: RendezvousClient, peer_connection: PeerConnection, peer: String) {
    tokio::spawn(async move {
        if let Err(e) = rendezvous.pump(peer_connection.clone(), &peer).await {
            warn!("rendezvous connection ended: {:#}", e);
            // Signalling is only needed until the link is up
            if peer_connection.state() != PeerConnectionState::Connected {
                peer_connection.close();
            }
        }
    });
}

async fn wait(shutdown: &CancellationToken, stopped: impl Future<Output = ()>) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = stopped => info!("peer connection ended"),
    }
}

/// Running byte totals fed by an orchestrator's meters
struct Totals {
    sent: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
}

impl Totals {
    fn attach(meters: &Meters) -> Self {
        let sent = Arc::new(AtomicU64::new(0));
        let received = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&sent);
        meters
            .bytes_sent
            .set_handler(move |n| {
                sink.fetch_add(n as u64, Ordering::Relaxed);
            });
        let sink = Arc::clone(&received);
        meters
            .bytes_received
            .set_handler(move |n| {
                sink.fetch_add(n as u64, Ordering::Relaxed);
            });
        Self { sent, received }
    }

    fn report(&self) {
        info!(
            bytes_sent = self.sent.load(Ordering::Relaxed),
            bytes_received = self.received.load(Ordering::Relaxed),
            "transfer totals"
        );
    }
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socks_mode() {
        let cli = Cli::try_parse_from([
            "peersocks",
            "--signalling-url",
            "wss://example.com:8443",
            "--caesar",
            "7",
            "socks",
            "bob",
            "--listen",
            "127.0.0.1:9050",
        ])
        .unwrap();

        assert_eq!(cli.stun_server, DEFAULT_STUN_SERVER);
        match &cli.mode {
            Mode::Socks { peer, listen } => {
                assert_eq!(peer, "bob");
                assert_eq!(*listen, Endpoint::new("127.0.0.1", 9050));
            }
            other => panic!("unexpected mode {:?}", other),
        }

        let config = cli.peer_config("alice");
        assert_eq!(config.name, "alice");
        assert_eq!(config.stun_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert!(config.obfuscator.is_some());
    }

    #[test]
    fn test_parse_relay_mode() {
        let cli = Cli::try_parse_from([
            "peersocks",
            "--signalling-url",
            "ws://127.0.0.1:8080",
            "relay",
            "alice",
            "--allow-non-unicast",
            "--connect-timeout",
            "0",
        ])
        .unwrap();

        match cli.mode {
            Mode::Relay {
                peer,
                allow_non_unicast,
                connect_timeout,
            } => {
                assert_eq!(peer, "alice");
                assert!(allow_non_unicast);
                assert_eq!(connect_timeout, 0);
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_listen_endpoint() {
        let parsed = Cli::try_parse_from([
            "peersocks",
            "--signalling-url",
            "ws://127.0.0.1:8080",
            "socks",
            "bob",
            "--listen",
            "no-port",
        ]);
        assert!(parsed.is_err());
    }
}
