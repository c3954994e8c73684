#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod cli;
pub mod config;
pub mod error;
pub mod net;
pub mod peer;
pub mod queue;
pub mod rendezvous;
pub mod rtc_to_net;
pub mod session;
pub mod socks;
pub mod socks_to_rtc;

pub use config::{PeerConnectionConfig, ProxyConfig};
pub use error::{Error, Result};
pub use net::Endpoint;
pub use peer::{DataChannel, PeerConnection, SignallingMessage};
pub use queue::Queue;
pub use rtc_to_net::RtcToNet;
pub use socks_to_rtc::SocksToRtc;
