/**
 * session/client.rs
 *
 * SOCKS-facing session: performs the SOCKS5 handshake on an accepted
 * connection and forwards the request to the peer
 */

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::net::{Endpoint, TcpConnection};
use crate::peer::DataChannel;
use crate::session::{Meters, SessionCore, SessionState};
use crate::socks::{self, AuthMethod, Reply, Request, Response, SocksError};

/// One accepted SOCKS connection tunnelled over one data channel
#[derive(Clone)]
pub struct ClientSession {
    core: Arc<SessionCore>,
}

impl ClientSession {
    /// Take ownership of `tcp` and start the handshake in the background
    pub fn start(tcp: TcpConnection, channel: DataChannel, meters: Meters) -> Self {
        let core = SessionCore::new(channel, meters);
        tokio::spawn(run(Arc::clone(&core), tcp));
        Self { core }
    }

    pub fn label(&self) -> &str {
        self.core.label()
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Stop the session; idempotent
    pub fn stop(&self) {
        self.core.stop();
    }

    pub fn once_stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        self.core.once_stopped()
    }
}

async fn run(core: Arc<SessionCore>, tcp: TcpConnection) {
    if let Err(e) = core.guard(Some(&tcp), negotiate_method(&tcp)).await {
        debug!(label = %core.label(), "SOCKS greeting failed: {}", e);
        if let Error::Socks(SocksError::NoAcceptableMethod) = e {
            let _ = tcp.send(socks::encode_auth_reply(AuthMethod::NoAcceptable)).await;
        }
        core.shutdown(Some(&tcp)).await;
        return;
    }

    let request = match core.guard(Some(&tcp), read_request(&tcp)).await {
        Ok(request) => request,
        Err(e) => {
            debug!(label = %core.label(), "SOCKS request failed: {}", e);
            if let Error::Socks(socks_error) = &e {
                let reply = socks::encode_response(socks_error.reply(), &Endpoint::unspecified());
                let _ = tcp.send(reply).await;
            }
            core.shutdown(Some(&tcp)).await;
            return;
        }
    };

    info!(label = %core.label(), destination = %request.endpoint, "SOCKS CONNECT");
    tcp.pause();

    let response = match core.guard(Some(&tcp), exchange(&core, &request)).await {
        Ok(response) => response,
        Err(e) => {
            debug!(label = %core.label(), "no usable reply from peer: {}", e);
            Response::failure(e.reply())
        }
    };

    let reply = socks::encode_response(response.reply, &response.endpoint);
    if let Err(e) = tcp.send(reply).await {
        debug!(label = %core.label(), "failed to write SOCKS reply: {}", e);
        core.shutdown(Some(&tcp)).await;
        return;
    }

    if response.reply == Reply::Succeeded {
        core.forward(&tcp).await;
    } else {
        info!(label = %core.label(), reply = ?response.reply, "peer refused request");
    }
    core.shutdown(Some(&tcp)).await;
}

/// Read the greeting and settle on no authentication
async fn negotiate_method(tcp: &TcpConnection) -> Result<()> {
    let greeting = next_buffer(tcp).await?;
    socks::decode_auth_handshake(&greeting)?;
    tcp.send(socks::encode_auth_reply(AuthMethod::NoAuth)).await?;
    Ok(())
}

async fn read_request(tcp: &TcpConnection) -> Result<Request> {
    let request = next_buffer(tcp).await?;
    Ok(socks::decode_request(&request)?)
}

async fn next_buffer(tcp: &TcpConnection) -> Result<Bytes> {
    tcp.data_from_socket_queue().set_next_handler().await
}

/// Send the request to the peer and wait for its one reply
async fn exchange(core: &SessionCore, request: &Request) -> Result<Response> {
    core.send_control_message(request)?;
    let reply = core.next_control_message().await?;
    Ok(serde_json::from_str(&reply)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConnectionConfig;
    use crate::net::TcpServer;
    use crate::peer::Data;
    use crate::session::test_support::{channel_pair, channel_pair_with};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn accepted_socket() -> (TcpStream, TcpConnection) {
        let server = TcpServer::new(Endpoint::new("127.0.0.1", 0));
        let bound = server.listen().await.unwrap();
        let accepted = server.connections_queue().set_next_handler();
        let client = TcpStream::connect(bound.socket_addr().unwrap()).await.unwrap();
        let tcp = accepted.await.unwrap();
        server.shutdown().await;
        (client, tcp)
    }

    async fn socks_connect(client: &mut TcpStream, request: &[u8]) -> [u8; 10] {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        client.write_all(request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        reply
    }

    const CONNECT_EXAMPLE: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50];

    #[tokio::test]
    async fn test_succeeded_reply_enters_forwarding() {
        let (_a, _b, channel, peer) = channel_pair("c0").await;
        let (mut client, tcp) = accepted_socket().await;
        let session = ClientSession::start(tcp, channel, Meters::default());

        let request = peer.data_from_peer_queue().set_next_handler();
        let socks_reply = tokio::spawn(async move {
            let reply = socks_connect(&mut client, &CONNECT_EXAMPLE).await;
            (client, reply)
        });

        let Data::Text(json) = request.await.unwrap() else {
            panic!("request must be a text message");
        };
        let request: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(request.endpoint, Endpoint::new("93.184.216.34", 80));

        let response = Response::new(Reply::Succeeded, Endpoint::new("198.51.100.1", 5555));
        peer.send(Data::Text(serde_json::to_string(&response).unwrap()))
            .unwrap();

        let (mut client, reply) = socks_reply.await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 198, 51, 100, 1, 0x15, 0xB3]);

        // Bytes written to the socket arrive on the peer's channel in order
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        peer.data_from_peer_queue().set_handler(move |data| {
            if let Data::Binary(bytes) = data {
                sink.lock().extend_from_slice(&bytes);
            }
        });
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();
        while received.lock().len() < payload.len() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(*received.lock(), payload);
        assert_eq!(session.state(), SessionState::Forwarding);

        // Closing the socket closes the channel
        drop(client);
        peer.on_close().await;
        session.once_stopped().await;
    }

    #[tokio::test]
    async fn test_refused_reply_stops_session() {
        let (_a, _b, channel, peer) = channel_pair("c0").await;
        let (mut client, tcp) = accepted_socket().await;
        let session = ClientSession::start(tcp, channel, Meters::default());

        peer.data_from_peer_queue().set_handler({
            let peer = peer.clone();
            move |_| {
                let response = Response::failure(Reply::ConnectionRefused);
                let _ = peer.send(Data::Text(serde_json::to_string(&response).unwrap()));
            }
        });

        let reply = socks_connect(&mut client, &CONNECT_EXAMPLE).await;
        assert_eq!(reply[1], Reply::ConnectionRefused.code());
        session.once_stopped().await;
        peer.on_close().await;

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_bind_request_gets_unsupported_reply() {
        let (_a, _b, channel, _peer) = channel_pair("c0").await;
        let (mut client, tcp) = accepted_socket().await;
        let session = ClientSession::start(tcp, channel, Meters::default());

        let mut bind = CONNECT_EXAMPLE;
        bind[1] = 0x02;
        let reply = socks_connect(&mut client, &bind).await;
        assert_eq!(reply[1], Reply::UnsupportedCommand.code());
        session.once_stopped().await;
    }

    #[tokio::test]
    async fn test_truncated_request_gets_failure_reply() {
        let (_a, _b, channel, _peer) = channel_pair("c0").await;
        let (mut client, tcp) = accepted_socket().await;
        let session = ClientSession::start(tcp, channel, Meters::default());

        // CONNECT to IPv4 with only two of the four address bytes
        let reply = socks_connect(&mut client, &[0x05, 0x01, 0x00, 0x01, 1, 2]).await;
        assert_eq!(reply, [0x05, Reply::Failure.code(), 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        session.once_stopped().await;

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_bad_request_version_gets_failure_reply() {
        let (_a, _b, channel, _peer) = channel_pair("c0").await;
        let (mut client, tcp) = accepted_socket().await;
        let _session = ClientSession::start(tcp, channel, Meters::default());

        let mut request = CONNECT_EXAMPLE;
        request[0] = 0x04;
        let reply = socks_connect(&mut client, &request).await;
        assert_eq!(reply[1], Reply::Failure.code());
    }

    #[tokio::test]
    async fn test_greeting_without_no_auth_is_refused() {
        let (_a, _b, channel, _peer) = channel_pair("c0").await;
        let (mut client, tcp) = accepted_socket().await;
        let session = ClientSession::start(tcp, channel, Meters::default());

        // Username/password only
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut answer = Vec::new();
        client.read_to_end(&mut answer).await.unwrap();
        assert_eq!(answer, [0x05, 0xFF]);
        session.once_stopped().await;
    }

    #[tokio::test]
    async fn test_bad_greeting_closes_without_reply() {
        let (_a, _b, channel, _peer) = channel_pair("c0").await;
        let (mut client, tcp) = accepted_socket().await;
        let session = ClientSession::start(tcp, channel, Meters::default());

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let mut answer = Vec::new();
        client.read_to_end(&mut answer).await.unwrap();
        assert!(answer.is_empty());
        session.once_stopped().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_send_buffer_pauses_socket_reads() {
        let (_a, _b, channel, peer) = channel_pair_with("c0", |config| PeerConnectionConfig {
            send_buffer_high_water: 1024,
            send_buffer_low_water: 256,
            ..config
        })
        .await;
        let (mut client, tcp) = accepted_socket().await;
        let watched = tcp.clone();
        let session = ClientSession::start(tcp, channel, Meters::default());

        // While `gate` is held the peer's link reader blocks on the first
        // chunk, so the local send buffer cannot drain
        let gate = Arc::new(parking_lot::Mutex::new(()));
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let held = gate.lock();
        peer.data_from_peer_queue().set_handler({
            let peer = peer.clone();
            let gate = Arc::clone(&gate);
            let sink = Arc::clone(&received);
            move |data| match data {
                Data::Text(_) => {
                    let response = Response::new(Reply::Succeeded, Endpoint::new("198.51.100.1", 5555));
                    let _ = peer.send(Data::Text(serde_json::to_string(&response).unwrap()));
                }
                Data::Binary(bytes) => {
                    let _open = gate.lock();
                    sink.lock().extend_from_slice(&bytes);
                }
            }
        });

        let reply = socks_connect(&mut client, &CONNECT_EXAMPLE).await;
        assert_eq!(reply[1], Reply::Succeeded.code());

        let payload: Vec<u8> = (0..8 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();
        let writing = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        timeout(Duration::from_secs(10), async {
            while !watched.is_paused() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("socket reads never paused");
        // Stays paused while nothing drains
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(watched.is_paused());
        assert!(received.lock().len() < expected.len());

        drop(held);
        timeout(Duration::from_secs(60), async {
            while received.lock().len() < expected.len() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("forwarding stalled after the send buffer drained");
        assert!(*received.lock() == expected, "bytes arrived out of order");
        assert!(!watched.is_paused());

        drop(writing.await.unwrap());
        session.once_stopped().await;
    }

    #[tokio::test]
    async fn test_garbage_reply_becomes_failure() {
        let (_a, _b, channel, peer) = channel_pair("c0").await;
        let (mut client, tcp) = accepted_socket().await;
        let _session = ClientSession::start(tcp, channel, Meters::default());

        peer.data_from_peer_queue().set_handler({
            let peer = peer.clone();
            move |_| {
                let _ = peer.send(Data::Text("not json".into()));
            }
        });

        let reply = socks_connect(&mut client, &CONNECT_EXAMPLE).await;
        assert_eq!(reply[1], Reply::Failure.code());
    }

    #[tokio::test]
    async fn test_stop_during_handshake() {
        let (_a, _b, channel, peer) = channel_pair("c0").await;
        let (_client, tcp) = accepted_socket().await;
        let session = ClientSession::start(tcp, channel, Meters::default());

        session.stop();
        session.stop();
        session.once_stopped().await;
        peer.on_close().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }
}
