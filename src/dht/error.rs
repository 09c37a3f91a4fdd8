//! DHT error kinds.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the DHT stack.
///
/// The protocol engine never propagates past a single RPC call; callers (the
/// iterative finder, the ping queue, the announcer) decide what a failure
/// means. Bucket-full is deliberately not here — it is an internal signal
/// that drives split-or-replace and never escapes the routing layer.
#[derive(Debug, Error)]
pub enum DhtError {
    /// Malformed bencode or unexpected top-level type. The datagram is
    /// dropped and the sender's failure count incremented.
    #[error("malformed datagram: {0}")]
    Decode(String),

    /// Well-formed datagram violating the four-method contract.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No reply within the RPC timeout.
    #[error("request timed out")]
    Timeout,

    /// The remote replied with an error datagram.
    #[error("remote error: {exception_type}({message})")]
    Remote {
        exception_type: String,
        message: String,
    },

    /// A reply arrived from a different address than the request went to.
    #[error("reply from {got}, expected {expected}")]
    RemoteMismatch { expected: SocketAddr, got: SocketAddr },

    /// `store` carried a token that fails verification outside the
    /// cold-start grace window.
    #[error("invalid token")]
    Token,

    /// Send attempted after the endpoint was stopped.
    #[error("transport not connected")]
    TransportNotConnected,

    /// A key argument of the wrong width, caught before transmitting.
    #[error("invalid key length: {0}")]
    InvalidKeyLength(usize),

    /// Encoded message exceeds the datagram payload limit; nothing is sent.
    #[error("message of {0} bytes exceeds the datagram size limit")]
    OversizeDatagram(usize),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl DhtError {
    /// Wire spelling of the error kind for outgoing error datagrams. Remote
    /// compatibility tables key on these names, so invalid-argument errors
    /// keep the historical `ValueError` spelling.
    pub fn remote_kind(&self) -> &'static str {
        match self {
            DhtError::Token | DhtError::InvalidKeyLength(_) => "ValueError",
            DhtError::Protocol(_) => "AttributeError",
            _ => "Exception",
        }
    }
}
