/**
 * peer/mod.rs
 *
 * PeerConnection: offer/answer signalling, connectivity checks and data
 * channel creation over one encrypted link
 */

pub mod data_channel;
pub(crate) mod gather;
pub(crate) mod link;
pub mod obfuscation;
pub(crate) mod sdp;
pub(crate) mod stun;
pub mod types;

pub use data_channel::{Data, DataChannel, SendBufferState};
pub use obfuscation::{Caesar, Obfuscator};
pub use types::{ConnectionAddresses, PeerConnectionState, SignallingMessage, TransportStats};

use parking_lot::Mutex;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::PeerConnectionConfig;
use crate::error::{Error, Result};
use crate::queue::Queue;
use data_channel::{ChannelInner, ChannelState, ChannelTable};
use link::{Frame, FrameType, Link, LinkKeys, Outbound, RecordReader, RecordWriter};
use sdp::{GlareWinner, IceCandidate, SdpType, SessionDescription, TcpType};
use types::{Role, SignallingState};

/// How often the selected route is looked up once signalling is stable
const STATS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long queued link writes may take once the connection is closing
const LINK_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

struct LocalDescription {
    desc: SessionDescription,
    sdp: String,
    secret: StaticSecret,
}

struct Negotiation {
    signalling: SignallingState,
    role: Option<Role>,
    local: Option<LocalDescription>,
    remote: Option<SessionDescription>,
    keys: Option<LinkKeys>,
    /// Candidates received before the remote description
    pending_candidates: Vec<String>,
    remote_gathering_done: bool,
    checks_in_flight: usize,
    next_channel_id: u16,
}

impl Negotiation {
    fn set_role(&mut self, role: Role) {
        self.role = Some(role);
        self.next_channel_id = role.first_channel_id();
    }
}

struct LinkHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    route: ConnectionAddresses,
}

type ConnectOutcome = Option<std::result::Result<ConnectionAddresses, String>>;

struct Shared {
    config: PeerConnectionConfig,
    negotiation: Mutex<Negotiation>,
    state: watch::Sender<PeerConnectionState>,
    connected: watch::Sender<ConnectOutcome>,
    signal_for_peer: Queue<SignallingMessage>,
    peer_opened_channels: Queue<DataChannel>,
    channels: Arc<ChannelTable>,
    pending_opens: Mutex<HashMap<u16, oneshot::Sender<()>>>,
    link: Mutex<Option<LinkHandle>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    shutdown: CancellationToken,
    /// Cancelled once a link has been selected
    link_ready: CancellationToken,
}

/// One peer-to-peer transport session
///
/// Cloning yields another handle to the same connection. All methods must
/// be called from within a tokio runtime.
#[derive(Clone)]
pub struct PeerConnection {
    shared: Arc<Shared>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("name", &self.shared.config.name)
            .field("state", &self.state())
            .finish()
    }
}

impl PeerConnection {
    pub fn new(config: PeerConnectionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                negotiation: Mutex::new(Negotiation {
                    signalling: SignallingState::Stable,
                    role: None,
                    local: None,
                    remote: None,
                    keys: None,
                    pending_candidates: Vec::new(),
                    remote_gathering_done: false,
                    checks_in_flight: 0,
                    next_channel_id: 0,
                }),
                state: watch::channel(PeerConnectionState::Waiting).0,
                connected: watch::channel(None).0,
                signal_for_peer: Queue::new(),
                peer_opened_channels: Queue::new(),
                channels: Arc::new(Mutex::new(HashMap::new())),
                pending_opens: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                link_ready: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn state(&self) -> PeerConnectionState {
        *self.shared.state.borrow()
    }

    /// Start negotiating as the offerer
    ///
    /// The offer is queued for the peer before this returns. Calling it
    /// again while connecting or connected just waits for the same outcome.
    pub fn negotiate_connection(
        &self,
    ) -> impl Future<Output = Result<ConnectionAddresses>> + Send + 'static {
        let started = self.shared.start_negotiation();
        let connected = self.once_connected();
        async move {
            started?;
            connected.await
        }
    }

    /// Feed a message relayed from the remote peer
    pub fn handle_signal_message(&self, message: SignallingMessage) {
        let shared = &self.shared;
        let result = match message {
            SignallingMessage::Offer { sdp } => shared.handle_offer(&sdp),
            SignallingMessage::Answer { sdp } => shared.handle_answer(&sdp),
            SignallingMessage::Candidate { candidate } => {
                shared.handle_candidate(candidate);
                Ok(())
            }
            SignallingMessage::NoMoreCandidates => {
                shared.handle_end_of_candidates();
                Ok(())
            }
        };
        if let Err(e) = result {
            shared.fail(e);
        }
    }

    /// Open a channel labelled `label`, negotiating first if still waiting
    pub async fn open_data_channel(&self, label: &str) -> Result<DataChannel> {
        if self.state() == PeerConnectionState::Waiting {
            self.shared.start_negotiation()?;
        }
        self.once_connected().await?;

        let (channel, opened) = self.shared.register_local_channel(label)?;
        match opened.await {
            Ok(()) if channel.is_open() => {
                debug!(name = %self.name(), label, id = channel.id(), "data channel open");
                Ok(channel)
            }
            _ => Err(Error::ChannelClosed),
        }
    }

    /// Channels opened by the remote peer, delivered once open
    pub fn peer_opened_channel_queue(&self) -> &Queue<DataChannel> {
        &self.shared.peer_opened_channels
    }

    /// Messages the host must relay to the remote peer
    pub fn signal_for_peer_queue(&self) -> &Queue<SignallingMessage> {
        &self.shared.signal_for_peer
    }

    /// Disconnect; idempotent and infallible
    pub fn close(&self) {
        self.shared.close();
    }

    /// Resolves with the selected route once connected, or fails if the
    /// connection ends first
    pub fn once_connected(
        &self,
    ) -> impl Future<Output = Result<ConnectionAddresses>> + Send + 'static {
        let mut connected = self.shared.connected.subscribe();
        async move {
            loop {
                if let Some(outcome) = connected.borrow_and_update().clone() {
                    return outcome.map_err(Error::Negotiation);
                }
                if connected.changed().await.is_err() {
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    pub fn once_disconnected(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.shared.state.subscribe();
        async move {
            let _ = state
                .wait_for(|s| *s == PeerConnectionState::Disconnected)
                .await;
        }
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.stats()
    }
}

impl Shared {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn transition(&self, next: PeerConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn settle(&self, outcome: std::result::Result<ConnectionAddresses, String>) {
        self.connected.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            } else {
                false
            }
        });
    }

    fn start_negotiation(self: &Arc<Self>) -> Result<()> {
        let (offer, candidates) = {
            let mut negotiation = self.negotiation.lock();
            match *self.state.borrow() {
                PeerConnectionState::Waiting => {}
                PeerConnectionState::Connecting | PeerConnectionState::Connected => return Ok(()),
                PeerConnectionState::Disconnected => {
                    return Err(Error::negotiation("peer connection is closed"))
                }
            }

            let secret = StaticSecret::random_from_rng(OsRng);
            let desc = SessionDescription::new(SdpType::Offer, PublicKey::from(&secret).to_bytes());
            let sdp = desc.to_sdp();
            let candidates = gather::active_candidates(&self.config, &desc.ufrag);

            negotiation.set_role(Role::Controlling);
            negotiation.signalling = SignallingState::HaveLocalOffer;
            negotiation.local = Some(LocalDescription {
                desc,
                sdp: sdp.clone(),
                secret,
            });
            self.transition(PeerConnectionState::Connecting);
            (sdp, candidates)
        };

        info!(name = %self.name(), "Sending offer");
        self.signal_for_peer.push(SignallingMessage::Offer { sdp: offer });
        self.push_candidates(candidates);
        self.signal_for_peer.push(SignallingMessage::NoMoreCandidates);
        Ok(())
    }

    fn push_candidates(&self, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            debug!(name = %self.name(), %candidate, "Gathered local candidate");
            self.signal_for_peer.push(SignallingMessage::Candidate {
                candidate: candidate.to_string(),
            });
        }
    }

    fn handle_offer(self: &Arc<Self>, sdp: &str) -> Result<()> {
        let remote = SessionDescription::parse(SdpType::Offer, sdp)?;

        let mut negotiation = self.negotiation.lock();
        match (*self.state.borrow(), negotiation.signalling) {
            (PeerConnectionState::Disconnected, _) => return Ok(()),
            (PeerConnectionState::Waiting, _) => {}
            (_, SignallingState::HaveLocalOffer) => {
                let Some(local) = negotiation.local.as_ref() else {
                    return Err(Error::negotiation("local offer missing"));
                };
                match sdp::resolve_glare(&local.sdp, sdp) {
                    GlareWinner::Local => {
                        info!(name = %self.name(), "Offers collided, keeping ours");
                        return Ok(());
                    }
                    GlareWinner::Remote => {
                        info!(name = %self.name(), "Offers collided, answering theirs");
                        negotiation.local = None;
                    }
                }
            }
            (_, SignallingState::Stable) => {
                warn!(name = %self.name(), "Ignoring offer on an already negotiated connection");
                return Ok(());
            }
        }

        let secret = StaticSecret::random_from_rng(OsRng);
        let desc = SessionDescription::new(SdpType::Answer, PublicKey::from(&secret).to_bytes());
        let keys = link::derive_keys(
            Role::Controlled,
            &secret,
            &remote.public_key,
            remote.session_id,
            desc.session_id,
        )?;
        let listener = gather::bind_passive_listener(&self.config)?;
        let port = listener.local_addr()?.port();
        let candidates = gather::passive_host_candidates(&self.config, &desc.ufrag, port);

        let answer = desc.to_sdp();
        let ufrag = desc.ufrag.clone();
        negotiation.set_role(Role::Controlled);
        negotiation.signalling = SignallingState::Stable;
        negotiation.remote = Some(remote);
        negotiation.keys = Some(keys.clone());
        negotiation.local = Some(LocalDescription {
            desc,
            sdp: answer.clone(),
            secret,
        });
        let pending = std::mem::take(&mut negotiation.pending_candidates);
        self.transition(PeerConnectionState::Connecting);
        drop(negotiation);

        info!(name = %self.name(), "Sending answer");
        self.signal_for_peer.push(SignallingMessage::Answer { sdp: answer });
        self.push_candidates(candidates);

        tokio::spawn(finish_gathering(Arc::clone(self), ufrag.clone(), port));
        tokio::spawn(accept_loop(Arc::clone(self), listener, keys, ufrag));
        tokio::spawn(wait_for_route(Arc::clone(self)));

        self.apply_pending(pending);
        Ok(())
    }

    fn handle_answer(self: &Arc<Self>, sdp: &str) -> Result<()> {
        let remote = SessionDescription::parse(SdpType::Answer, sdp)?;

        let mut negotiation = self.negotiation.lock();
        match *self.state.borrow() {
            PeerConnectionState::Disconnected => return Ok(()),
            PeerConnectionState::Waiting => {
                return Err(Error::negotiation("answer received before any offer"))
            }
            PeerConnectionState::Connecting | PeerConnectionState::Connected => {}
        }
        if negotiation.signalling != SignallingState::HaveLocalOffer {
            warn!(name = %self.name(), "Ignoring unexpected answer");
            return Ok(());
        }
        let Some(local) = negotiation.local.as_ref() else {
            return Err(Error::negotiation("local offer missing"));
        };

        let keys = link::derive_keys(
            Role::Controlling,
            &local.secret,
            &remote.public_key,
            local.desc.session_id,
            remote.session_id,
        )?;
        negotiation.keys = Some(keys);
        negotiation.remote = Some(remote);
        negotiation.signalling = SignallingState::Stable;
        let pending = std::mem::take(&mut negotiation.pending_candidates);
        drop(negotiation);

        info!(name = %self.name(), "Answer applied, checking candidates");
        tokio::spawn(wait_for_route(Arc::clone(self)));

        self.apply_pending(pending);
        Ok(())
    }

    fn handle_candidate(self: &Arc<Self>, candidate: String) {
        {
            let mut negotiation = self.negotiation.lock();
            if *self.state.borrow() == PeerConnectionState::Disconnected {
                return;
            }
            if negotiation.remote.is_none() {
                negotiation.pending_candidates.push(candidate);
                return;
            }
        }
        self.apply_candidate(&candidate);
    }

    /// Candidates that arrived before the remote description, best first
    fn apply_pending(self: &Arc<Self>, pending: Vec<String>) {
        let parsed = pending
            .iter()
            .filter_map(|line| self.parse_candidate(line))
            .collect();
        for candidate in sdp::check_order(parsed) {
            self.apply(candidate);
        }
    }

    fn apply_candidate(self: &Arc<Self>, line: &str) {
        if let Some(candidate) = self.parse_candidate(line) {
            self.apply(candidate);
        }
    }

    fn parse_candidate(&self, line: &str) -> Option<IceCandidate> {
        match IceCandidate::parse(line) {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                warn!(name = %self.name(), "Ignoring candidate: {}", e);
                None
            }
        }
    }

    fn apply(self: &Arc<Self>, candidate: IceCandidate) {
        let mut negotiation = self.negotiation.lock();
        let Some(remote) = negotiation.remote.as_ref() else {
            return;
        };
        if candidate.ufrag != remote.ufrag {
            debug!(name = %self.name(), %candidate, "Dropping candidate for a superseded description");
            return;
        }

        match (negotiation.role, candidate.tcp_type) {
            (Some(Role::Controlling), TcpType::Passive) => {
                if self.link_ready.is_cancelled() {
                    return;
                }
                let ufrag = remote.ufrag.clone();
                let Some(keys) = negotiation.keys.clone() else {
                    return;
                };
                negotiation.checks_in_flight += 1;
                drop(negotiation);
                self.spawn_check(candidate.address, keys, ufrag);
            }
            _ => debug!(name = %self.name(), %candidate, "Recorded remote candidate"),
        }
    }

    fn handle_end_of_candidates(self: &Arc<Self>) {
        {
            let mut negotiation = self.negotiation.lock();
            if negotiation.remote.is_none() {
                debug!(name = %self.name(), "Dropping end-of-candidates for an unknown description");
                return;
            }
            negotiation.remote_gathering_done = true;
        }
        self.check_exhausted();
    }

    /// Fail once the remote finished gathering and every check failed
    fn check_exhausted(&self) {
        let exhausted = {
            let negotiation = self.negotiation.lock();
            negotiation.role == Some(Role::Controlling)
                && negotiation.remote.is_some()
                && negotiation.remote_gathering_done
                && negotiation.checks_in_flight == 0
                && !self.link_ready.is_cancelled()
        };
        if exhausted {
            self.fail(Error::negotiation("all candidate checks failed"));
        }
    }

    fn spawn_check(self: &Arc<Self>, address: SocketAddr, keys: LinkKeys, ufrag: String) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            debug!(name = %shared.name(), %address, "Checking candidate");
            let attempt = async {
                let stream = TcpStream::connect(address).await?;
                link::initiate(stream, &keys, shared.config.obfuscator.clone(), &ufrag).await
            };

            let outcome = tokio::select! {
                _ = shared.link_ready.cancelled() => None,
                _ = shared.shutdown.cancelled() => None,
                result = tokio::time::timeout(shared.config.check_timeout, attempt) => Some(result),
            };

            {
                let mut negotiation = shared.negotiation.lock();
                negotiation.checks_in_flight = negotiation.checks_in_flight.saturating_sub(1);
            }

            match outcome {
                None => {}
                Some(Ok(Ok(link))) => {
                    info!(name = %shared.name(), %address, "Connectivity check succeeded");
                    shared.install_link(link, Role::Controlling);
                }
                Some(Ok(Err(e))) => {
                    debug!(name = %shared.name(), %address, "Connectivity check failed: {}", e);
                    shared.check_exhausted();
                }
                Some(Err(_)) => {
                    debug!(name = %shared.name(), %address, "Connectivity check timed out");
                    shared.check_exhausted();
                }
            }
        });
    }

    /// Select `link` unless another one already won
    fn install_link(self: &Arc<Self>, link: Link, role: Role) -> bool {
        let Link {
            reader,
            writer,
            route,
        } = link;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        {
            let mut slot = self.link.lock();
            if slot.is_some() || self.shutdown.is_cancelled() {
                return false;
            }
            if role == Role::Controlled {
                // Acknowledge only the selected link so both ends agree on it
                let _ = outbound.send(Outbound::control(Frame::control(FrameType::HelloAck, 0)));
            }
            *slot = Some(LinkHandle {
                outbound,
                route: route.clone(),
            });
        }
        self.link_ready.cancel();

        info!(
            name = %self.name(),
            local = %route.local,
            remote = %route.remote,
            "Peer link established"
        );
        tokio::spawn(write_loop(Arc::clone(self), writer, outbound_rx));
        tokio::spawn(read_loop(Arc::clone(self), reader));
        true
    }

    fn channel(&self, id: u16) -> Option<Arc<ChannelInner>> {
        self.channels.lock().get(&id).cloned()
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<Outbound>> {
        self.link.lock().as_ref().map(|link| link.outbound.clone())
    }

    fn register_local_channel(&self, label: &str) -> Result<(DataChannel, oneshot::Receiver<()>)> {
        let outbound = self.outbound().ok_or(Error::ChannelClosed)?;

        let inner = {
            let mut negotiation = self.negotiation.lock();
            if negotiation.role.is_none() {
                return Err(Error::negotiation("connection has no role yet"));
            }
            let mut channels = self.channels.lock();
            if channels.values().any(|c| c.label() == label) {
                return Err(Error::protocol(format!(
                    "data channel label {:?} already in use",
                    label
                )));
            }

            let mut id = None;
            for _ in 0..=(u16::MAX / 2) {
                let candidate = negotiation.next_channel_id;
                negotiation.next_channel_id = candidate.wrapping_add(2);
                if !channels.contains_key(&candidate) {
                    id = Some(candidate);
                    break;
                }
            }
            let id = id.ok_or_else(|| Error::protocol("no free data channel ids"))?;

            let inner = ChannelInner::new(
                label.to_string(),
                id,
                outbound.clone(),
                self.config.water_marks(),
                &self.channels,
                ChannelState::Opening,
            );
            channels.insert(id, Arc::clone(&inner));
            inner
        };

        let (opened_tx, opened_rx) = oneshot::channel();
        let id = inner.id();
        self.pending_opens.lock().insert(id, opened_tx);
        let open = Frame::new(FrameType::Open, id, label.as_bytes().to_vec());
        if outbound.send(Outbound::control(open)).is_err() {
            inner.mark_closed();
            return Err(Error::ChannelClosed);
        }
        Ok((DataChannel::from_inner(inner), opened_rx))
    }

    fn accept_remote_channel(&self, id: u16, payload: &[u8]) -> Result<()> {
        let label = std::str::from_utf8(payload)
            .map_err(|_| Error::protocol("channel label is not UTF-8"))?
            .to_string();
        let role = self.negotiation.lock().role;
        if !role.is_some_and(|role| role.is_remote_channel_id(id)) {
            return Err(Error::protocol(format!("peer opened channel {} with our parity", id)));
        }
        let Some(outbound) = self.outbound() else {
            return Ok(());
        };

        let inner = {
            let mut channels = self.channels.lock();
            if channels.contains_key(&id) || channels.values().any(|c| c.label() == label) {
                None
            } else {
                let inner = ChannelInner::new(
                    label.clone(),
                    id,
                    outbound.clone(),
                    self.config.water_marks(),
                    &self.channels,
                    ChannelState::Open,
                );
                channels.insert(id, Arc::clone(&inner));
                Some(inner)
            }
        };

        let Some(inner) = inner else {
            warn!(name = %self.name(), %label, id, "Refusing duplicate data channel");
            let _ = outbound.send(Outbound::control(Frame::control(FrameType::Close, id)));
            return Ok(());
        };

        let _ = outbound.send(Outbound::control(Frame::control(FrameType::OpenAck, id)));
        debug!(name = %self.name(), %label, id, "Peer opened data channel");
        self.peer_opened_channels.push(DataChannel::from_inner(inner));
        Ok(())
    }

    fn dispatch(&self, frame: Frame) -> Result<()> {
        let id = frame.channel;
        match frame.kind {
            FrameType::Open => self.accept_remote_channel(id, &frame.payload),
            FrameType::OpenAck => {
                if let Some(channel) = self.channel(id) {
                    channel.mark_open();
                }
                if let Some(opened) = self.pending_opens.lock().remove(&id) {
                    let _ = opened.send(());
                }
                Ok(())
            }
            FrameType::Binary => {
                match self.channel(id) {
                    Some(channel) => channel.deliver(Data::Binary(frame.payload)),
                    None => debug!(name = %self.name(), id, "Data for unknown channel"),
                }
                Ok(())
            }
            FrameType::Text => {
                let text = String::from_utf8(frame.payload.to_vec())
                    .map_err(|_| Error::protocol("text frame is not UTF-8"))?;
                match self.channel(id) {
                    Some(channel) => channel.deliver(Data::Text(text)),
                    None => debug!(name = %self.name(), id, "Data for unknown channel"),
                }
                Ok(())
            }
            FrameType::Close => {
                if let Some(channel) = self.channel(id) {
                    channel.mark_closed();
                }
                // Dropping the sender fails a pending open
                self.pending_opens.lock().remove(&id);
                Ok(())
            }
            FrameType::Hello | FrameType::HelloAck => {
                Err(Error::negotiation("handshake frame on an established link"))
            }
        }
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            selected_route: self.link.lock().as_ref().map(|link| link.route.clone()),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            open_channels: self.channels.lock().len(),
        }
    }

    fn fail(&self, error: Error) {
        warn!(name = %self.name(), "Peer connection failed: {}", error);
        self.settle(Err(match error {
            Error::Negotiation(message) => message,
            other => other.to_string(),
        }));
        self.close();
    }

    fn close(&self) {
        if !self.transition(PeerConnectionState::Disconnected) {
            return;
        }
        self.settle(Err("peer connection closed".to_string()));
        self.shutdown.cancel();
        self.link.lock().take();
        self.pending_opens.lock().clear();

        let channels: Vec<_> = self.channels.lock().values().cloned().collect();
        for channel in channels {
            channel.mark_closed();
        }
        info!(name = %self.name(), "Peer connection closed");
    }
}

/// Publish server-reflexive candidates, then end gathering
async fn finish_gathering(shared: Arc<Shared>, ufrag: String, port: u16) {
    let candidates = tokio::select! {
        _ = shared.shutdown.cancelled() => return,
        candidates = gather::reflexive_candidates(&shared.config, &ufrag, port) => candidates,
    };
    shared.push_candidates(candidates);
    shared.signal_for_peer.push(SignallingMessage::NoMoreCandidates);
}

/// Controlled side: accept connectivity checks until a link is selected
async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, keys: LinkKeys, ufrag: String) {
    loop {
        let accepted = tokio::select! {
            _ = shared.link_ready.cancelled() => break,
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, from)) => {
                debug!(name = %shared.name(), %from, "Incoming connectivity check");
                let shared = Arc::clone(&shared);
                let keys = keys.clone();
                let ufrag = ufrag.clone();
                tokio::spawn(async move {
                    let obfuscator = shared.config.obfuscator.clone();
                    let verified = tokio::time::timeout(
                        shared.config.check_timeout,
                        link::accept(stream, &keys, obfuscator, &ufrag),
                    )
                    .await;
                    match verified {
                        Ok(Ok(link)) => {
                            if !shared.install_link(link, Role::Controlled) {
                                debug!(name = %shared.name(), %from, "Link already selected");
                            }
                        }
                        Ok(Err(e)) => {
                            debug!(name = %shared.name(), %from, "Rejected connectivity check: {}", e)
                        }
                        Err(_) => {
                            debug!(name = %shared.name(), %from, "Connectivity check timed out")
                        }
                    }
                });
            }
            Err(e) => {
                warn!(name = %shared.name(), "Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Poll transport stats until a route is selected, then report `Connected`
async fn wait_for_route(shared: Arc<Shared>) {
    let mut poll = tokio::time::interval(STATS_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = poll.tick() => {}
        }
        let Some(route) = shared.stats().selected_route else {
            continue;
        };
        if shared.transition(PeerConnectionState::Connected) {
            info!(
                name = %shared.name(),
                local = %route.local,
                remote = %route.remote,
                "Peer connection established"
            );
            shared.settle(Ok(route));
        }
        return;
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: RecordWriter,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let flush_deadline = async {
        shared.shutdown.cancelled().await;
        tokio::time::sleep(LINK_FLUSH_TIMEOUT).await;
    };
    tokio::pin!(flush_deadline);

    loop {
        // Frames already queued are written before shutdown is noticed
        let next = tokio::select! {
            biased;
            next = outbound.recv() => next,
            _ = shared.shutdown.cancelled() => None,
        };
        let Some(Outbound { frame, sent_from }) = next else {
            break;
        };

        let written = tokio::select! {
            result = writer.write_frame(&frame) => result,
            _ = &mut flush_deadline => break,
        };
        if let Err(e) = written {
            warn!(name = %shared.name(), "Link write failed: {}", e);
            shared.close();
            break;
        }

        let len = frame.payload.len();
        shared.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        if let Some(channel) = sent_from {
            channel.on_written(len);
        }
    }
    writer.shutdown().await;
}

async fn read_loop(shared: Arc<Shared>, mut reader: RecordReader) {
    let reason = loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            frame = reader.read_frame() => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                shared
                    .bytes_received
                    .fetch_add(frame.payload.len() as u64, Ordering::Relaxed);
                match shared.dispatch(frame) {
                    Ok(()) => {}
                    Err(e) if e.is_connection_fatal() => {
                        break format!("link frame rejected: {}", e)
                    }
                    Err(e) => warn!(name = %shared.name(), "Dropping link frame: {}", e),
                }
            }
            Ok(None) => break "peer closed the link".to_string(),
            Err(e) => break format!("link failed: {}", e),
        }
    };
    info!(name = %shared.name(), "{}", reason);
    shared.close();
}
