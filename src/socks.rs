/**
 * socks.rs
 *
 * SOCKS5 wire codec (RFC 1928 subset): method negotiation, CONNECT
 * requests and IPv4-shaped replies
 */

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracing::warn;

use crate::net::Endpoint;

const SOCKS5_VERSION: u8 = 0x05;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Requests shorter than this are rejected before looking at the address
const MIN_REQUEST_LEN: usize = 9;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth,
    Gssapi,
    UsernamePassword,
    NoAcceptable,
    Other(u8),
}

impl AuthMethod {
    pub fn code(self) -> u8 {
        match self {
            AuthMethod::NoAuth => 0x00,
            AuthMethod::Gssapi => 0x01,
            AuthMethod::UsernamePassword => 0x02,
            AuthMethod::NoAcceptable => 0xFF,
            AuthMethod::Other(code) => code,
        }
    }
}

impl From<u8> for AuthMethod {
    fn from(code: u8) -> Self {
        match code {
            0x00 => AuthMethod::NoAuth,
            0x01 => AuthMethod::Gssapi,
            0x02 => AuthMethod::UsernamePassword,
            0xFF => AuthMethod::NoAcceptable,
            other => AuthMethod::Other(other),
        }
    }
}

/// Request commands; only `Connect` is served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Connect => 0x01,
            Command::Bind => 0x02,
            Command::UdpAssociate => 0x03,
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reply {
    Succeeded,
    Failure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    UnsupportedCommand,
    AddressTypeNotSupported,
}

impl Reply {
    pub const ALL: [Reply; 9] = [
        Reply::Succeeded,
        Reply::Failure,
        Reply::NotAllowed,
        Reply::NetworkUnreachable,
        Reply::HostUnreachable,
        Reply::ConnectionRefused,
        Reply::TtlExpired,
        Reply::UnsupportedCommand,
        Reply::AddressTypeNotSupported,
    ];

    pub fn code(self) -> u8 {
        match self {
            Reply::Succeeded => 0x00,
            Reply::Failure => 0x01,
            Reply::NotAllowed => 0x02,
            Reply::NetworkUnreachable => 0x03,
            Reply::HostUnreachable => 0x04,
            Reply::ConnectionRefused => 0x05,
            Reply::TtlExpired => 0x06,
            Reply::UnsupportedCommand => 0x07,
            Reply::AddressTypeNotSupported => 0x08,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Reply::ALL.into_iter().find(|reply| reply.code() == code)
    }
}

/// A decoded CONNECT request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    pub endpoint: Endpoint,
}

/// A reply code with the address the proxy bound for the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub reply: Reply,
    pub endpoint: Endpoint,
}

impl Response {
    pub fn new(reply: Reply, endpoint: Endpoint) -> Self {
        Self { reply, endpoint }
    }

    /// A reply carrying no bound address
    pub fn failure(reply: Reply) -> Self {
        Self::new(reply, Endpoint::unspecified())
    }
}

/// Malformed or unsupported SOCKS5 data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocksError {
    #[error("invalid SOCKS version: {0}")]
    InvalidVersion(u8),

    #[error("message truncated: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("client offers no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("invalid domain name")]
    InvalidDomain,

    #[error("unknown reply code: {0:#04x}")]
    UnknownReply(u8),
}

impl SocksError {
    /// The reply a client should receive for this error
    pub fn reply(&self) -> Reply {
        match self {
            SocksError::UnsupportedCommand(_) => Reply::UnsupportedCommand,
            SocksError::UnsupportedAddressType(_) => Reply::AddressTypeNotSupported,
            _ => Reply::Failure,
        }
    }
}

type Result<T> = std::result::Result<T, SocksError>;

fn require(bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() < expected {
        return Err(SocksError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn check_version(version: u8) -> Result<()> {
    if version != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion(version));
    }
    Ok(())
}

/// Decode the client greeting `[0x05, N, method_1..method_N]`
///
/// Fails unless the client offers `NoAuth`, the only method served.
pub fn decode_auth_handshake(bytes: &[u8]) -> Result<Vec<AuthMethod>> {
    require(bytes, 2)?;
    check_version(bytes[0])?;

    let count = bytes[1] as usize;
    require(bytes, 2 + count)?;
    let methods: Vec<AuthMethod> = bytes[2..2 + count]
        .iter()
        .copied()
        .map(AuthMethod::from)
        .collect();

    if !methods.contains(&AuthMethod::NoAuth) {
        return Err(SocksError::NoAcceptableMethod);
    }
    Ok(methods)
}

pub fn encode_auth_handshake(methods: &[AuthMethod]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + methods.len());
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(methods.len() as u8);
    for method in methods {
        buf.put_u8(method.code());
    }
    buf.freeze()
}

/// The server's method selection `[0x05, method]`
pub fn encode_auth_reply(method: AuthMethod) -> Bytes {
    Bytes::from(vec![SOCKS5_VERSION, method.code()])
}

/// Decode `[0x05, CMD, 0x00, ATYP, ADDR..., PORT_hi, PORT_lo]`
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    require(bytes, MIN_REQUEST_LEN)?;
    check_version(bytes[0])?;

    let command = match bytes[1] {
        0x01 => Command::Connect,
        other => return Err(SocksError::UnsupportedCommand(other)),
    };

    let (endpoint, _) = decode_address(bytes[3], &bytes[4..])?;
    Ok(Request { command, endpoint })
}

pub fn encode_request(request: &Request) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(request.command.code());
    buf.put_u8(0x00);
    encode_address(&mut buf, &request.endpoint)?;
    Ok(buf.freeze())
}

/// Encode `[0x05, REP, 0x00, 0x01, a, b, c, d, PORT_hi, PORT_lo]`
///
/// Replies are always IPv4 shaped; any other bound address is sent as
/// `0.0.0.0`.
pub fn encode_response(reply: Reply, endpoint: &Endpoint) -> Bytes {
    let ip = match endpoint.ip() {
        Some(IpAddr::V4(ip)) => ip,
        _ => {
            warn!(
                bound = %endpoint,
                "Bound address is not IPv4, replying with 0.0.0.0"
            );
            Ipv4Addr::UNSPECIFIED
        }
    };

    let mut buf = BytesMut::with_capacity(10);
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(reply.code());
    buf.put_u8(0x00);
    buf.put_u8(ATYP_IPV4);
    buf.put_slice(&ip.octets());
    buf.put_u16(endpoint.port);
    buf.freeze()
}

pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    require(bytes, 10)?;
    check_version(bytes[0])?;
    let reply = Reply::from_code(bytes[1]).ok_or(SocksError::UnknownReply(bytes[1]))?;
    let (endpoint, _) = decode_address(bytes[3], &bytes[4..])?;
    Ok(Response { reply, endpoint })
}

/// Decode an address and port; returns the endpoint and bytes consumed
fn decode_address(atyp: u8, data: &[u8]) -> Result<(Endpoint, usize)> {
    let (address, len) = match atyp {
        ATYP_IPV4 => {
            require(data, 4 + 2)?;
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            (ip.to_string(), 4)
        }
        ATYP_DOMAIN => {
            require(data, 1)?;
            let len = data[0] as usize;
            require(data, 1 + len + 2)?;
            let name = &data[1..1 + len];
            if name.is_empty() || !name.is_ascii() {
                return Err(SocksError::InvalidDomain);
            }
            let name = std::str::from_utf8(name).map_err(|_| SocksError::InvalidDomain)?;
            (name.to_string(), 1 + len)
        }
        ATYP_IPV6 => {
            require(data, 16 + 2)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            (Ipv6Addr::from(octets).to_string(), 16)
        }
        other => return Err(SocksError::UnsupportedAddressType(other)),
    };

    let port = u16::from_be_bytes([data[len], data[len + 1]]);
    Ok((Endpoint::new(address, port), len + 2))
}

fn encode_address(buf: &mut BytesMut, endpoint: &Endpoint) -> Result<()> {
    match endpoint.ip() {
        Some(IpAddr::V4(ip)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        Some(IpAddr::V6(ip)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
        None => {
            let name = endpoint.address.as_bytes();
            if name.is_empty() || name.len() > 255 || !name.is_ascii() {
                return Err(SocksError::InvalidDomain);
            }
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name);
        }
    }
    buf.put_u16(endpoint.port);
    Ok(())
}
