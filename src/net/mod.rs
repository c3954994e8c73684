/**
 * net/mod.rs
 *
 * Endpoint value type, address policy helpers and the TCP boundary
 */

pub mod tcp;

pub use tcp::{SocketCloseKind, TcpConnection, TcpServer};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// A host (IP literal or DNS name) and port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// The address as an IP literal, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        let trimmed = self
            .address
            .strip_prefix('[')
            .and_then(|a| a.strip_suffix(']'))
            .unwrap_or(&self.address);
        trimmed.parse().ok()
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// The unspecified IPv4 endpoint, used for replies with no bound address
    pub fn unspecified() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED.to_string(), 0)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

impl std::str::FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in {:?}", s))?;
        if host.is_empty() {
            return Err(format!("missing host in {:?}", s));
        }
        let port = port
            .parse()
            .map_err(|_| format!("invalid port in {:?}", s))?;
        Ok(Self::new(host, port))
    }
}

/// Whether `ip` is a public unicast address, i.e. safe to proxy to when
/// non-unicast destinations are disallowed
pub fn is_unicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_unicast_v4(v4),
        IpAddr::V6(v6) => is_unicast_v6(v6),
    }
}

fn is_unicast_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast()
        // carrier-grade NAT, 100.64.0.0/10
        || (a == 100 && (b & 0xc0) == 64)
        // reserved, 240.0.0.0/4
        || a >= 240)
}

fn is_unicast_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_unicast_v4(v4);
    }
    let first = ip.segments()[0];
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // link-local, fe80::/10
        || (first & 0xffc0) == 0xfe80
        // unique local, fc00::/7
        || (first & 0xfe00) == 0xfc00)
}
