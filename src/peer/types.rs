/**
 * peer/types.rs
 *
 * Core types for the peer connection
 */

use serde::{Deserialize, Serialize};

use crate::net::Endpoint;

/// Out-of-band signalling messages exchanged between two peer connections
///
/// The host application relays these verbatim; the transport never looks
/// inside them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignallingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
    NoMoreCandidates,
}

/// Connection state machine
///
/// `Waiting -> Connecting -> Connected -> Disconnected`, where `Disconnected`
/// is reachable from every state and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Waiting,
    Connecting,
    Connected,
    Disconnected,
}

impl PeerConnectionState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: PeerConnectionState) -> bool {
        use PeerConnectionState::*;
        matches!(
            (self, next),
            (Waiting, Connecting)
                | (Connecting, Connected)
                | (Waiting, Disconnected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

/// Signalling state of the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignallingState {
    Stable,
    HaveLocalOffer,
}

/// Which side drives connectivity checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// The offerer; dials the remote candidates
    Controlling,
    /// The answerer; accepts on its passive candidates
    Controlled,
}

impl Role {
    /// First data channel id; each side allocates with its own parity
    pub(crate) fn first_channel_id(self) -> u16 {
        match self {
            Role::Controlling => 0,
            Role::Controlled => 1,
        }
    }

    /// Whether `id` was allocated by the remote side
    pub(crate) fn is_remote_channel_id(self, id: u16) -> bool {
        (id % 2) != self.first_channel_id()
    }
}

/// Addresses of the selected route once connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAddresses {
    pub local: Endpoint,
    pub remote: Endpoint,
}

/// Snapshot of transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// The route carrying traffic, once connectivity checks succeeded
    pub selected_route: Option<ConnectionAddresses>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub open_channels: usize,
}
