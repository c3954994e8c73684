/**
 * peer/stun.rs
 *
 * STUN client for server-reflexive candidate discovery
 */

use anyhow::{anyhow, Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

/// STUN message types
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;

/// STUN magic cookie
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN attribute types
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// How long to wait for a binding response
const STUN_TIMEOUT: Duration = Duration::from_secs(3);

/// Query `server` for the external address of a fresh UDP socket bound on
/// `bind_ip`
pub async fn query_reflexive_address(bind_ip: IpAddr, server: SocketAddr) -> Result<SocketAddr> {
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
        .await
        .context("Failed to bind UDP socket")?;

    let transaction_id: [u8; 12] = rand::random();
    let request = build_binding_request(&transaction_id);

    socket
        .send_to(&request, server)
        .await
        .context("Failed to send STUN request")?;

    let mut buffer = vec![0u8; 1024];
    let (len, _) = tokio::time::timeout(STUN_TIMEOUT, socket.recv_from(&mut buffer))
        .await
        .map_err(|_| anyhow!("STUN query to {} timed out", server))?
        .context("Failed to receive STUN response")?;

    parse_binding_response(&buffer[..len], &transaction_id)
}

/// Build a STUN binding request
pub(crate) fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut request = Vec::with_capacity(20);

    // Message type, length (no attributes), magic cookie, transaction ID
    request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    request.extend_from_slice(&0u16.to_be_bytes());
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    request.extend_from_slice(transaction_id);

    request
}

/// Parse a STUN binding response into the mapped address
pub(crate) fn parse_binding_response(
    data: &[u8],
    expected_transaction_id: &[u8; 12],
) -> Result<SocketAddr> {
    if data.len() < 20 {
        return Err(anyhow!("STUN response too short"));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != STUN_BINDING_RESPONSE {
        return Err(anyhow!("Invalid STUN response type: 0x{:04x}", msg_type));
    }

    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != STUN_MAGIC_COOKIE {
        return Err(anyhow!("Invalid magic cookie"));
    }

    if &data[8..20] != expected_transaction_id {
        return Err(anyhow!("Transaction ID mismatch"));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < 20 + msg_len {
        return Err(anyhow!("STUN response truncated"));
    }

    // XOR-MAPPED-ADDRESS is preferred; MAPPED-ADDRESS is kept as a fallback
    let mut mapped = None;
    let mut offset = 20;
    while offset + 4 <= 20 + msg_len {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if offset + attr_len > data.len() {
            break;
        }
        let attr_data = &data[offset..offset + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                return parse_address(attr_data, Some(expected_transaction_id));
            }
            ATTR_MAPPED_ADDRESS if mapped.is_none() => {
                mapped = Some(parse_address(attr_data, None)?);
            }
            _ => {}
        }

        // Attributes are padded to 4-byte boundaries
        offset += (attr_len + 3) & !3;
    }

    mapped.ok_or_else(|| anyhow!("No address attribute found in STUN response"))
}

/// Parse a (XOR-)MAPPED-ADDRESS attribute; `transaction_id` is given for
/// the XOR variant
fn parse_address(data: &[u8], transaction_id: Option<&[u8; 12]>) -> Result<SocketAddr> {
    if data.len() < 8 {
        return Err(anyhow!("address attribute too short"));
    }

    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if transaction_id.is_some() {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        0x01 => {
            let mut addr = [data[4], data[5], data[6], data[7]];
            if transaction_id.is_some() {
                for (byte, key) in addr.iter_mut().zip(STUN_MAGIC_COOKIE.to_be_bytes()) {
                    *byte ^= key;
                }
            }
            IpAddr::from(addr)
        }
        0x02 => {
            if data.len() < 20 {
                return Err(anyhow!("Invalid IPv6 address length"));
            }
            let mut addr = [0u8; 16];
            addr.copy_from_slice(&data[4..20]);

            if let Some(transaction_id) = transaction_id {
                // XOR with magic cookie + transaction ID
                let mut xor_key = [0u8; 16];
                xor_key[0..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
                xor_key[4..16].copy_from_slice(transaction_id);
                for (byte, key) in addr.iter_mut().zip(xor_key) {
                    *byte ^= key;
                }
            }
            IpAddr::from(addr)
        }
        _ => return Err(anyhow!("Unknown address family: {}", family)),
    };

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_mapped_response(transaction_id: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = addr else {
            panic!("test helper only builds IPv4 responses");
        };
        let mut attr = vec![0x00, 0x01];
        attr.extend_from_slice(&(v4.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        let ip = u32::from(*v4.ip()) ^ STUN_MAGIC_COOKIE;
        attr.extend_from_slice(&ip.to_be_bytes());

        let mut response = Vec::new();
        response.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        response.extend_from_slice(&((attr.len() + 4) as u16).to_be_bytes());
        response.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        response.extend_from_slice(transaction_id);
        response.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        response.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        response.extend_from_slice(&attr);
        response
    }

    #[test]
    fn test_binding_request_layout() {
        let id = [9u8; 12];
        let request = build_binding_request(&id);
        assert_eq!(request.len(), 20);
        assert_eq!(&request[0..2], &STUN_BINDING_REQUEST.to_be_bytes());
        assert_eq!(&request[8..20], &id);
    }

    #[test]
    fn test_parse_xor_mapped_address() {
        let id = [1u8; 12];
        let addr: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let response = xor_mapped_response(&id, addr);
        assert_eq!(parse_binding_response(&response, &id).unwrap(), addr);
    }

    #[test]
    fn test_rejects_wrong_transaction() {
        let addr: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let response = xor_mapped_response(&[1u8; 12], addr);
        assert!(parse_binding_response(&response, &[2u8; 12]).is_err());
        assert!(parse_binding_response(&response[..12], &[1u8; 12]).is_err());
    }

    #[tokio::test]
    async fn test_query_against_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 20);
            let mut id = [0u8; 12];
            id.copy_from_slice(&buf[8..20]);
            let response = xor_mapped_response(&id, from);
            server.send_to(&response, from).await.unwrap();
        });

        let mapped = query_reflexive_address("127.0.0.1".parse().unwrap(), server_addr)
            .await
            .unwrap();
        assert_eq!(mapped.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
    }
}
