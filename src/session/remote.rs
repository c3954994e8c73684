/**
 * session/remote.rs
 *
 * Network-facing session: receives a request over a data channel, applies
 * destination policy and connects to the destination
 */

use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::net::{is_unicast, Endpoint, TcpConnection};
use crate::peer::DataChannel;
use crate::session::{Meters, SessionCore, SessionState};
use crate::socks::{Command, Reply, Request, Response};

/// One peer-opened data channel and the destination connection behind it
#[derive(Clone)]
pub struct RemoteSession {
    core: Arc<SessionCore>,
}

impl RemoteSession {
    pub fn start(channel: DataChannel, config: ProxyConfig, meters: Meters) -> Self {
        let core = SessionCore::new(channel, meters);
        tokio::spawn(run(Arc::clone(&core), config));
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

async fn run(core: Arc<SessionCore>, config: ProxyConfig) {
    let request = match core.guard(None, receive_request(&core)).await {
        Ok(request) => request,
        Err(Error::Cancelled) | Err(Error::ChannelClosed) => {
            core.shutdown(None).await;
            return;
        }
        Err(e) => {
            debug!(label = %core.label(), "bad request from peer: {}", e);
            reply_and_stop(&core, Response::failure(Reply::UnsupportedCommand), None).await;
            return;
        }
    };

    if let Err(e) = check_literal_destination(&request.endpoint, &config) {
        info!(label = %core.label(), destination = %request.endpoint, "{}", e);
        reply_and_stop(&core, Response::failure(e.reply()), None).await;
        return;
    }

    info!(label = %core.label(), destination = %request.endpoint, "connecting");
    let tcp = match core.guard(None, connect(&request.endpoint, &config)).await {
        Ok(tcp) => tcp,
        Err(Error::Cancelled) | Err(Error::ChannelClosed) => {
            core.shutdown(None).await;
            return;
        }
        Err(e) => {
            let reply = connect_failure_reply(&e, &config);
            info!(label = %core.label(), destination = %request.endpoint, ?reply, "connect failed: {}", e);
            reply_and_stop(&core, Response::failure(reply), None).await;
            return;
        }
    };

    // A hostname may resolve somewhere the literal check could not see
    if !config.allow_non_unicast {
        if let Some(addr) = tcp.remote_addr().filter(|addr| !is_unicast(addr.ip())) {
            info!(label = %core.label(), %addr, "destination resolved to a non-unicast address");
            reply_and_stop(&core, Response::failure(Reply::Failure), Some(&tcp)).await;
            return;
        }
    }

    let bound = tcp
        .local_addr()
        .map(Endpoint::from)
        .unwrap_or_else(Endpoint::unspecified);
    if let Err(e) = core.send_control_message(&Response::new(Reply::Succeeded, bound)) {
        debug!(label = %core.label(), "failed to send reply: {}", e);
        core.shutdown(Some(&tcp)).await;
        return;
    }

    core.forward(&tcp).await;
    core.shutdown(Some(&tcp)).await;
}

async fn receive_request(core: &SessionCore) -> Result<Request> {
    let message = core.next_control_message().await?;
    let request: Request = serde_json::from_str(&message)?;
    if request.command != Command::Connect {
        return Err(Error::protocol(format!(
            "unsupported command {:?}",
            request.command
        )));
    }
    Ok(request)
}

/// Reject literal IP destinations outside the public unicast range
fn check_literal_destination(endpoint: &Endpoint, config: &ProxyConfig) -> Result<()> {
    match endpoint.ip() {
        Some(ip) if !config.allow_non_unicast && !is_unicast(ip) => Err(Error::PolicyViolation(
            format!("destination {} is not a unicast address", ip),
        )),
        _ => Ok(()),
    }
}

async fn connect(endpoint: &Endpoint, config: &ProxyConfig) -> Result<TcpConnection> {
    let attempt = TcpConnection::connect(endpoint);
    let tcp = match config.connect_timeout {
        Some(limit) => timeout(limit, attempt)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??,
        None => attempt.await?,
    };
    Ok(tcp)
}

/// Refusal is only reported as such when probing local services is allowed
fn connect_failure_reply(error: &Error, config: &ProxyConfig) -> Reply {
    let Error::Transport(io_error) = error else {
        return Reply::Failure;
    };
    match io_error.kind() {
        io::ErrorKind::TimedOut => Reply::TtlExpired,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
            if config.allow_non_unicast =>
        {
            Reply::ConnectionRefused
        }
        _ => Reply::Failure,
    }
}

async fn reply_and_stop(core: &SessionCore, response: Response, tcp: Option<&TcpConnection>) {
    if let Err(e) = core.send_control_message(&response) {
        debug!(label = %core.label(), "failed to send reply: {}", e);
    }
    core.shutdown(tcp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Data;
    use crate::session::test_support::channel_pair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn allow_local() -> ProxyConfig {
        ProxyConfig {
            allow_non_unicast: true,
            ..ProxyConfig::default()
        }
    }

    async fn request_reply(client: &DataChannel, request: &str) -> Response {
        let reply = client.data_from_peer_queue().set_next_handler();
        client.send(Data::Text(request.to_string())).unwrap();
        let Data::Text(json) = reply.await.unwrap() else {
            panic!("reply must be a text message");
        };
        serde_json::from_str(&json).unwrap()
    }

    fn connect_json(endpoint: &Endpoint) -> String {
        serde_json::to_string(&Request {
            command: Command::Connect,
            endpoint: endpoint.clone(),
        })
        .unwrap()
    }

    #[test]
    fn test_connect_failure_mapping() {
        let strict = ProxyConfig::default();
        let refused = || Error::Transport(io::ErrorKind::ConnectionRefused.into());
        let timed_out = Error::Transport(io::ErrorKind::TimedOut.into());

        assert_eq!(connect_failure_reply(&timed_out, &strict), Reply::TtlExpired);
        assert_eq!(connect_failure_reply(&refused(), &strict), Reply::Failure);
        assert_eq!(
            connect_failure_reply(&refused(), &allow_local()),
            Reply::ConnectionRefused
        );
        assert_eq!(
            connect_failure_reply(&Error::negotiation("x"), &allow_local()),
            Reply::Failure
        );
    }

    #[tokio::test]
    async fn test_private_destinations_not_allowed() {
        for address in ["127.0.0.1", "10.1.2.3", "::1"] {
            let (_a, _b, client, channel) = channel_pair("c0").await;
            let session = RemoteSession::start(channel, ProxyConfig::default(), Meters::default());

            let response = request_reply(&client, &connect_json(&Endpoint::new(address, 80))).await;
            assert_eq!(response.reply, Reply::NotAllowed, "{}", address);
            session.once_stopped().await;
            client.on_close().await;
        }
    }

    #[tokio::test]
    async fn test_unparseable_request_is_unsupported() {
        let (_a, _b, client, channel) = channel_pair("c0").await;
        let session = RemoteSession::start(channel, ProxyConfig::default(), Meters::default());

        let response = request_reply(&client, "{\"command\":").await;
        assert_eq!(response.reply, Reply::UnsupportedCommand);
        session.once_stopped().await;
    }

    #[tokio::test]
    async fn test_non_connect_command_is_unsupported() {
        let (_a, _b, client, channel) = channel_pair("c0").await;
        let _session = RemoteSession::start(channel, ProxyConfig::default(), Meters::default());

        let bind = serde_json::to_string(&Request {
            command: Command::Bind,
            endpoint: Endpoint::new("93.184.216.34", 80),
        })
        .unwrap();
        let response = request_reply(&client, &bind).await;
        assert_eq!(response.reply, Reply::UnsupportedCommand);
    }

    #[tokio::test]
    async fn test_refused_port_reported_when_allowed() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let (_a, _b, client, channel) = channel_pair("c0").await;
        let _session = RemoteSession::start(channel, allow_local(), Meters::default());

        let response =
            request_reply(&client, &connect_json(&Endpoint::new("127.0.0.1", port))).await;
        assert_eq!(response.reply, Reply::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_forwards_to_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let destination = Endpoint::from(listener.local_addr().unwrap());
        let echo = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n]).await.unwrap();
            }
        });

        let meters = Meters::default();
        let received = Arc::new(parking_lot::Mutex::new(0usize));
        let total = Arc::clone(&received);
        meters.bytes_received.set_handler(move |n| *total.lock() += n);

        let (_a, _b, client, channel) = channel_pair("c0").await;
        let session = RemoteSession::start(channel, allow_local(), meters);

        let response = request_reply(&client, &connect_json(&destination)).await;
        assert_eq!(response.reply, Reply::Succeeded);
        assert_eq!(response.endpoint.address, "127.0.0.1");

        let echoed = client.data_from_peer_queue().set_next_handler();
        client
            .send(Data::Binary(bytes::Bytes::from_static(b"ping")))
            .unwrap();
        assert_eq!(
            echoed.await.unwrap(),
            Data::Binary(bytes::Bytes::from_static(b"ping"))
        );
        assert_eq!(*received.lock(), 4);
        assert_eq!(session.state(), SessionState::Forwarding);

        client.close();
        session.once_stopped().await;
        echo.await.unwrap();
    }
}
