/**
 * peer/sdp.rs
 *
 * Session descriptions and ICE-TCP style candidate lines
 */

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};

/// Port advertised by active TCP candidates, which never listen
pub(crate) const DISCARD_PORT: u16 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SdpType {
    Offer,
    Answer,
}

/// `a=setup`: the offerer dials, the answerer listens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Setup {
    Active,
    Passive,
}

impl SdpType {
    fn setup(self) -> Setup {
        match self {
            SdpType::Offer => Setup::Active,
            SdpType::Answer => Setup::Passive,
        }
    }
}

/// The parts of a session description this transport uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionDescription {
    pub kind: SdpType,
    pub session_id: u64,
    pub ufrag: String,
    /// X25519 public key used to key the link
    pub public_key: [u8; 32],
}

impl SessionDescription {
    pub fn new(kind: SdpType, public_key: [u8; 32]) -> Self {
        Self {
            kind,
            session_id: rand::random::<u64>() >> 1,
            ufrag: hex::encode(rand::random::<[u8; 4]>()),
            public_key,
        }
    }

    pub fn to_sdp(&self) -> String {
        let setup = match self.kind.setup() {
            Setup::Active => "active",
            Setup::Passive => "passive",
        };
        format!(
            "v=0\r\n\
             o=- {} 2 IN IP4 127.0.0.1\r\n\
             s=-\r\n\
             t=0 0\r\n\
             m=application 9 TCP/AESGCM webrtc-datachannel\r\n\
             a=ice-ufrag:{}\r\n\
             a=fingerprint:x25519 {}\r\n\
             a=setup:{}\r\n",
            self.session_id,
            self.ufrag,
            hex::encode(self.public_key),
            setup,
        )
    }

    /// Parse `sdp`, which must describe a `kind` description
    pub fn parse(kind: SdpType, sdp: &str) -> Result<Self> {
        let mut lines = sdp.lines().map(|l| l.trim_end_matches('\r'));
        if lines.next() != Some("v=0") {
            return Err(Error::negotiation("session description must start with v=0"));
        }

        let mut session_id = None;
        let mut ufrag = None;
        let mut public_key = None;
        let mut setup = None;

        for line in lines {
            if let Some(origin) = line.strip_prefix("o=") {
                let id = origin
                    .split_whitespace()
                    .nth(1)
                    .and_then(|id| id.parse::<u64>().ok())
                    .ok_or_else(|| Error::negotiation("invalid o= line"))?;
                session_id = Some(id);
            } else if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
                if value.is_empty() || value.contains(char::is_whitespace) {
                    return Err(Error::negotiation("invalid ice-ufrag"));
                }
                ufrag = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("a=fingerprint:") {
                let (algorithm, key) = value
                    .split_once(' ')
                    .ok_or_else(|| Error::negotiation("invalid fingerprint line"))?;
                if algorithm != "x25519" {
                    return Err(Error::negotiation(format!(
                        "unsupported fingerprint algorithm {}",
                        algorithm
                    )));
                }
                let bytes = hex::decode(key.trim())
                    .map_err(|_| Error::negotiation("fingerprint is not hex"))?;
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| Error::negotiation("fingerprint must be 32 bytes"))?;
                public_key = Some(key);
            } else if let Some(value) = line.strip_prefix("a=setup:") {
                setup = Some(match value {
                    "active" => Setup::Active,
                    "passive" => Setup::Passive,
                    other => {
                        return Err(Error::negotiation(format!("unsupported setup {}", other)))
                    }
                });
            }
        }

        if setup != Some(kind.setup()) {
            return Err(Error::negotiation(format!(
                "{:?} must carry a=setup:{:?}",
                kind,
                kind.setup()
            )));
        }

        Ok(Self {
            kind,
            session_id: session_id.ok_or_else(|| Error::negotiation("missing o= line"))?,
            ufrag: ufrag.ok_or_else(|| Error::negotiation("missing ice-ufrag"))?,
            public_key: public_key.ok_or_else(|| Error::negotiation("missing fingerprint"))?,
        })
    }
}

/// Outcome of comparing two simultaneous offers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GlareWinner {
    Local,
    Remote,
}

/// Decide which of two colliding offers survives: the lower BLAKE3 hash
/// of the offer body wins
pub(crate) fn resolve_glare(local_sdp: &str, remote_sdp: &str) -> GlareWinner {
    let local = blake3::hash(local_sdp.as_bytes());
    let remote = blake3::hash(remote_sdp.as_bytes());
    match local.as_bytes().cmp(remote.as_bytes()) {
        Ordering::Less => GlareWinner::Local,
        Ordering::Greater => GlareWinner::Remote,
        // Identical hashes mean identical bodies; fall back to the text
        Ordering::Equal => match local_sdp.cmp(remote_sdp) {
            Ordering::Greater => GlareWinner::Remote,
            _ => GlareWinner::Local,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CandidateType {
    Host,
    ServerReflexive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpType {
    Active,
    Passive,
}

/// A transport address the remote side may try
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IceCandidate {
    pub foundation: u32,
    pub priority: u32,
    pub address: SocketAddr,
    pub kind: CandidateType,
    pub tcp_type: TcpType,
    /// ufrag of the description this candidate belongs to
    pub ufrag: String,
}

impl IceCandidate {
    pub fn new(
        address: SocketAddr,
        kind: CandidateType,
        tcp_type: TcpType,
        ufrag: &str,
        local_preference: u16,
    ) -> Self {
        let type_preference: u32 = match kind {
            CandidateType::Host => 126,
            CandidateType::ServerReflexive => 100,
        };
        Self {
            foundation: foundation_for(address.ip(), kind),
            priority: (type_preference << 24) | ((local_preference as u32) << 8) | 255,
            address,
            kind,
            tcp_type,
            ufrag: ufrag.to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let bad = |what: &str| Error::protocol(format!("invalid candidate ({}): {}", what, line));

        let body = line
            .trim()
            .strip_prefix("candidate:")
            .ok_or_else(|| bad("prefix"))?;
        let mut tokens = body.split_whitespace();
        let mut next = |what: &str| tokens.next().ok_or_else(|| bad(what));

        let foundation = next("foundation")?.parse().map_err(|_| bad("foundation"))?;
        if next("component")? != "1" {
            return Err(bad("component"));
        }
        if !next("transport")?.eq_ignore_ascii_case("tcp") {
            return Err(bad("transport"));
        }
        let priority = next("priority")?.parse().map_err(|_| bad("priority"))?;
        let ip: IpAddr = next("address")?.parse().map_err(|_| bad("address"))?;
        let port: u16 = next("port")?.parse().map_err(|_| bad("port"))?;
        if next("typ")? != "typ" {
            return Err(bad("typ"));
        }
        let kind = match next("type")? {
            "host" => CandidateType::Host,
            "srflx" => CandidateType::ServerReflexive,
            _ => return Err(bad("type")),
        };

        let mut tcp_type = None;
        let mut ufrag = None;
        while let Some(key) = tokens.next() {
            let value = tokens.next().ok_or_else(|| bad(key))?;
            match key {
                "tcptype" => {
                    tcp_type = Some(match value {
                        "active" => TcpType::Active,
                        "passive" => TcpType::Passive,
                        _ => return Err(bad("tcptype")),
                    })
                }
                "ufrag" => ufrag = Some(value.to_string()),
                // Unknown extension attributes are ignored
                _ => {}
            }
        }

        Ok(Self {
            foundation,
            priority,
            address: SocketAddr::new(ip, port),
            kind,
            tcp_type: tcp_type.ok_or_else(|| bad("tcptype"))?,
            ufrag: ufrag.ok_or_else(|| bad("ufrag"))?,
        })
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
        };
        let tcp_type = match self.tcp_type {
            TcpType::Active => "active",
            TcpType::Passive => "passive",
        };
        write!(
            f,
            "candidate:{} 1 tcp {} {} {} typ {} tcptype {} ufrag {}",
            self.foundation,
            self.priority,
            self.address.ip(),
            self.address.port(),
            kind,
            tcp_type,
            self.ufrag,
        )
    }
}

/// Order candidates for checking: highest priority first, ties broken by
/// foundation, one check per transport address
pub(crate) fn check_order(mut candidates: Vec<IceCandidate>) -> Vec<IceCandidate> {
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.foundation.cmp(&b.foundation))
    });
    let mut seen = HashSet::new();
    candidates.retain(|candidate| seen.insert(candidate.address));
    candidates
}

fn foundation_for(ip: IpAddr, kind: CandidateType) -> u32 {
    let mut input = ip.to_string().into_bytes();
    input.push(kind as u8);
    let hash = blake3::hash(&input);
    let bytes = hash.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_round_trip() {
        let offer = SessionDescription::new(SdpType::Offer, [7u8; 32]);
        let parsed = SessionDescription::parse(SdpType::Offer, &offer.to_sdp()).unwrap();
        assert_eq!(parsed, offer);
    }

    #[test]
    fn test_description_kind_must_match_setup() {
        let answer = SessionDescription::new(SdpType::Answer, [1u8; 32]);
        assert!(SessionDescription::parse(SdpType::Offer, &answer.to_sdp()).is_err());
    }

    #[test]
    fn test_description_rejects_garbage() {
        assert!(SessionDescription::parse(SdpType::Offer, "").is_err());
        assert!(SessionDescription::parse(SdpType::Offer, "v=0\r\na=setup:active\r\n").is_err());

        let short_key = SessionDescription::new(SdpType::Offer, [2u8; 32])
            .to_sdp()
            .replace(&hex::encode([2u8; 32]), "abcd");
        assert!(SessionDescription::parse(SdpType::Offer, &short_key).is_err());
    }

    #[test]
    fn test_glare_is_antisymmetric() {
        let a = SessionDescription::new(SdpType::Offer, [3u8; 32]).to_sdp();
        let b = SessionDescription::new(SdpType::Offer, [4u8; 32]).to_sdp();
        let ab = resolve_glare(&a, &b);
        let ba = resolve_glare(&b, &a);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_candidate_round_trip() {
        let candidate = IceCandidate::new(
            "192.168.1.20:50123".parse().unwrap(),
            CandidateType::Host,
            TcpType::Passive,
            "beefcafe",
            65535,
        );
        let line = candidate.to_string();
        assert!(line.starts_with("candidate:"));
        assert!(line.contains("typ host tcptype passive"));
        assert_eq!(IceCandidate::parse(&line).unwrap(), candidate);
    }

    #[test]
    fn test_candidate_rejects_udp_and_truncation() {
        assert!(IceCandidate::parse("candidate:1 1 udp 1 10.0.0.1 5000 typ host").is_err());
        assert!(IceCandidate::parse("candidate:1 1 tcp 1 10.0.0.1").is_err());
        assert!(IceCandidate::parse(
            "candidate:1 1 tcp 1 10.0.0.1 5000 typ host tcptype passive"
        )
        .is_err());
    }

    #[test]
    fn test_host_outranks_reflexive() {
        let addr = "203.0.113.5:4000".parse().unwrap();
        let host = IceCandidate::new(addr, CandidateType::Host, TcpType::Passive, "u", 100);
        let srflx = IceCandidate::new(addr, CandidateType::ServerReflexive, TcpType::Passive, "u", 100);
        assert!(host.priority > srflx.priority);
    }

    #[test]
    fn test_check_order_prefers_priority_and_skips_repeats() {
        let nat: SocketAddr = "203.0.113.5:4000".parse().unwrap();
        let lan: SocketAddr = "192.168.1.20:4000".parse().unwrap();
        let vpn: SocketAddr = "10.8.0.2:4000".parse().unwrap();
        let candidates = vec![
            IceCandidate::new(nat, CandidateType::ServerReflexive, TcpType::Passive, "u", 65535),
            IceCandidate::new(vpn, CandidateType::Host, TcpType::Passive, "u", 100),
            IceCandidate::new(lan, CandidateType::Host, TcpType::Passive, "u", 65535),
            // Same address reported twice, only the better one is checked
            IceCandidate::new(lan, CandidateType::Host, TcpType::Passive, "u", 1),
        ];

        let ordered: Vec<(SocketAddr, u32)> = check_order(candidates)
            .iter()
            .map(|c| (c.address, c.priority))
            .collect();
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].0, lan);
        assert_eq!(ordered[1].0, vpn);
        assert_eq!(ordered[2].0, nat);
        assert!(ordered[0].1 > ordered[1].1 && ordered[1].1 > ordered[2].1);
    }
}
