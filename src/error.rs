/**
 * error.rs
 *
 * Error taxonomy shared by the peer transport, the sessions and the
 * orchestrators
 */

use thiserror::Error;

use crate::socks::{Reply, SocksError};

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the tunnel core
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unexpected data on a control path
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed or unsupported SOCKS5 wire data
    #[error("SOCKS5 error: {0}")]
    Socks(#[from] SocksError),

    /// Destination refused by the proxy policy
    #[error("destination not allowed: {0}")]
    PolicyViolation(String),

    /// TCP connect/read/write failure
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Peer connection signalling or connectivity failure
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// A pending operation was superseded or its owner went away
    #[error("operation cancelled")]
    Cancelled,

    /// The data channel (or the peer connection under it) is closed
    #[error("data channel closed")]
    ChannelClosed,

    /// Link encryption failure
    #[error("cryptographic error: {0}")]
    Crypto(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn negotiation(msg: impl Into<String>) -> Self {
        Error::Negotiation(msg.into())
    }

    /// SOCKS reply a client should see when a session fails with this error
    pub fn reply(&self) -> Reply {
        match self {
            Error::Socks(e) => e.reply(),
            Error::PolicyViolation(_) => Reply::NotAllowed,
            _ => Reply::Failure,
        }
    }

    /// Whether the error is fatal to the whole peer connection rather than
    /// to a single session
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::Negotiation(_) | Error::Crypto(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(format!("bad control message: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Cancelled.to_string(), "operation cancelled");
        assert_eq!(
            Error::negotiation("no route").to_string(),
            "negotiation failed: no route"
        );
    }

    #[test]
    fn test_error_reply_mapping() {
        assert_eq!(
            Error::Socks(SocksError::UnsupportedCommand(0x02)).reply(),
            Reply::UnsupportedCommand
        );
        assert_eq!(
            Error::PolicyViolation("10.0.0.1".into()).reply(),
            Reply::NotAllowed
        );
        assert_eq!(Error::ChannelClosed.reply(), Reply::Failure);
    }

    #[test]
    fn test_error_fatality() {
        assert!(Error::negotiation("glare").is_connection_fatal());
        assert!(!Error::protocol("bad frame").is_connection_fatal());
        assert!(!Error::Cancelled.is_connection_fatal());
    }
}
