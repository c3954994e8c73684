/**
 * config.rs
 *
 * Peer connection and proxy policy configuration
 */

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::peer::obfuscation::Obfuscator;

/// Default STUN server, as used by the rendezvous deployment
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Transport settings for one `PeerConnection`
#[derive(Debug, Clone)]
pub struct PeerConnectionConfig {
    /// Name used in log lines
    pub name: String,
    /// Local address for the passive listener and candidate gathering
    pub bind_address: IpAddr,
    /// `host:port` STUN servers queried for server-reflexive candidates
    pub stun_servers: Vec<String>,
    /// How long one connectivity check may take
    pub check_timeout: Duration,
    /// Buffered bytes above which a channel reports `Overflow`
    pub send_buffer_high_water: usize,
    /// Buffered bytes at or below which a channel reports `Drained`
    pub send_buffer_low_water: usize,
    /// Byte transform applied to every link record
    pub obfuscator: Option<Arc<dyn Obfuscator>>,
}

impl Default for PeerConnectionConfig {
    fn default() -> Self {
        Self {
            name: "peer".to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            stun_servers: Vec::new(),
            check_timeout: Duration::from_secs(5),
            send_buffer_high_water: 1024 * 1024,
            send_buffer_low_water: 256 * 1024,
            obfuscator: None,
        }
    }
}

impl PeerConnectionConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub(crate) fn water_marks(&self) -> (usize, usize) {
        let high = self.send_buffer_high_water.max(1);
        (high, self.send_buffer_low_water.min(high - 1))
    }
}

/// Destination policy for the network-facing side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Allow loopback, private and link-local destinations
    pub allow_non_unicast: bool,
    /// Give up on a destination connect after this long
    pub connect_timeout: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allow_non_unicast: false,
            connect_timeout: Some(Duration::from_secs(30)),
        }
    }
}
