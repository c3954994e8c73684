/**
 * peer/gather.rs
 *
 * Candidate gathering: host addresses, the passive listener and
 * server-reflexive addresses via STUN
 */

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::PeerConnectionConfig;
use crate::net::tcp::bind_listener;
use crate::peer::sdp::{CandidateType, IceCandidate, TcpType, DISCARD_PORT};
use crate::peer::stun;

/// Addresses this host can be reached on for `bind`
///
/// A specific bind address is used as-is. For the unspecified address the
/// interface carrying the default route is used, plus loopback.
pub(crate) fn host_addresses(bind: IpAddr) -> Vec<IpAddr> {
    if !bind.is_unspecified() {
        return vec![bind];
    }

    let mut addresses = Vec::new();
    if let Some(primary) = primary_interface_address() {
        addresses.push(primary);
    }
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    if !addresses.contains(&loopback) {
        addresses.push(loopback);
    }
    addresses
}

/// Local address of the interface routing towards the public internet
///
/// Connecting a UDP socket sends nothing; it only selects a route.
fn primary_interface_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// `tcptype active` candidates for the controlling side
pub(crate) fn active_candidates(config: &PeerConnectionConfig, ufrag: &str) -> Vec<IceCandidate> {
    host_addresses(config.bind_address)
        .into_iter()
        .enumerate()
        .map(|(index, ip)| {
            IceCandidate::new(
                SocketAddr::new(ip, DISCARD_PORT),
                CandidateType::Host,
                TcpType::Active,
                ufrag,
                local_preference(index),
            )
        })
        .collect()
}

/// Bind the listener that backs the passive candidates
pub(crate) fn bind_passive_listener(config: &PeerConnectionConfig) -> io::Result<TcpListener> {
    let listener = bind_listener(SocketAddr::new(config.bind_address, 0))?;
    debug!(
        name = %config.name,
        addr = ?listener.local_addr().ok(),
        "passive candidate listener bound"
    );
    Ok(listener)
}

/// `tcptype passive` host candidates for a listener bound on `port`
pub(crate) fn passive_host_candidates(
    config: &PeerConnectionConfig,
    ufrag: &str,
    port: u16,
) -> Vec<IceCandidate> {
    host_addresses(config.bind_address)
        .into_iter()
        .enumerate()
        .map(|(index, ip)| {
            IceCandidate::new(
                SocketAddr::new(ip, port),
                CandidateType::Host,
                TcpType::Passive,
                ufrag,
                local_preference(index),
            )
        })
        .collect()
}

/// Server-reflexive candidates for a listener bound on `port`
///
/// STUN runs over UDP, so the mapped address only says which public IP the
/// NAT uses; the listener port is assumed to be preserved by the NAT.
pub(crate) async fn reflexive_candidates(
    config: &PeerConnectionConfig,
    ufrag: &str,
    port: u16,
) -> Vec<IceCandidate> {
    if config.bind_address.is_loopback() {
        return Vec::new();
    }

    let mut candidates: Vec<IceCandidate> = Vec::new();
    for server in &config.stun_servers {
        let server_addr = match tokio::net::lookup_host(server.as_str()).await {
            Ok(mut addrs) => match addrs.find(SocketAddr::is_ipv4) {
                Some(addr) => addr,
                None => {
                    warn!(%server, "STUN server has no IPv4 address");
                    continue;
                }
            },
            Err(e) => {
                warn!(%server, "Failed to resolve STUN server: {}", e);
                continue;
            }
        };

        match stun::query_reflexive_address(config.bind_address, server_addr).await {
            Ok(mapped) => {
                info!(%server, public_ip = %mapped.ip(), "Discovered server-reflexive address");
                let address = SocketAddr::new(mapped.ip(), port);
                if candidates.iter().any(|c| c.address == address) {
                    continue;
                }
                candidates.push(IceCandidate::new(
                    address,
                    CandidateType::ServerReflexive,
                    TcpType::Passive,
                    ufrag,
                    local_preference(candidates.len()),
                ));
            }
            Err(e) => warn!(%server, "STUN query failed: {:#}", e),
        }
    }
    candidates
}

fn local_preference(index: usize) -> u16 {
    u16::MAX.saturating_sub(index as u16)
}
