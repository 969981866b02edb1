//! Route errors

use std::fmt;
use std::io;

use crate::protocol::{ProtocolError, ServerId};

/// Error type for route connections
#[derive(Debug)]
pub enum RouteError {
    /// Socket failure
    Transport(io::Error),
    /// Peer did not complete the handshake in time
    HandshakeTimeout,
    /// Peer is incompatible (version, cluster name)
    HandshakeMismatch(String),
    /// The arbitrating side already holds a route to this peer
    DuplicateRoute(ServerId),
    /// Connected to ourselves
    SelfRoute,
    /// Peer sent something out of sequence or invalid
    Protocol(String),
    /// Frame could not be encoded or decoded
    Codec(ProtocolError),
    /// Peer closed the connection
    Closed,
    /// Peer stopped answering pings
    StalePeer,
}

impl RouteError {
    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            RouteError::Transport(_) => "transport",
            RouteError::HandshakeTimeout => "handshake_timeout",
            RouteError::HandshakeMismatch(_) => "handshake_mismatch",
            RouteError::DuplicateRoute(_) => "duplicate_route",
            RouteError::SelfRoute => "self_route",
            RouteError::Protocol(_) => "protocol",
            RouteError::Codec(_) => "codec",
            RouteError::Closed => "closed",
            RouteError::StalePeer => "stale_peer",
        }
    }
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::Transport(e) => write!(f, "Transport error: {}", e),
            RouteError::HandshakeTimeout => write!(f, "Handshake timed out"),
            RouteError::HandshakeMismatch(msg) => write!(f, "Handshake mismatch: {}", msg),
            RouteError::DuplicateRoute(peer) => write!(f, "Duplicate route to {}", peer),
            RouteError::SelfRoute => write!(f, "Handshake mismatch: route to self"),
            RouteError::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            RouteError::Codec(e) => write!(f, "Codec error: {}", e),
            RouteError::Closed => write!(f, "Connection closed"),
            RouteError::StalePeer => write!(f, "Stale connection"),
        }
    }
}

impl std::error::Error for RouteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RouteError::Transport(e) => Some(e),
            RouteError::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RouteError {
    fn from(e: io::Error) -> Self {
        RouteError::Transport(e)
    }
}

impl From<ProtocolError> for RouteError {
    fn from(e: ProtocolError) -> Self {
        RouteError::Codec(e)
    }
}
