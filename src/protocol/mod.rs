//! Wire protocols and shared identifiers
//!
//! Two protocols are spoken by a server:
//! - the line-oriented client protocol (`client`), served on the client listener
//! - the length-prefixed binary route protocol (`route`), served on the cluster listener
//!
//! Connection ids and server identities live here because both protocols and
//! the subscription engine refer to them.

pub mod client;
mod error;
pub mod route;

pub use error::ProtocolError;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier of a client connection or a route.
///
/// Clients and routes draw from the same sequence, so ids are unique across
/// both kinds of connection on a server.
pub type ConnId = u64;

/// Monotonic connection id sequence, starting at 1
#[derive(Debug, Default)]
pub struct ConnIdSequence {
    last: AtomicU64,
}

impl ConnIdSequence {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Allocate the next id
    pub fn next_id(&self) -> ConnId {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last id handed out (0 if none yet)
    pub fn current(&self) -> ConnId {
        self.last.load(Ordering::SeqCst)
    }
}

/// Cluster-unique server identity.
///
/// Identities are totally ordered by their byte representation; the route
/// handshake relies on that order to decide which side arbitrates duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(Arc<str>);

impl ServerId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Generate a random identity
    pub fn generate() -> Self {
        let raw = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
        Self(format!("N{}", raw).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl PartialEq<str> for ServerId {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_id_sequence() {
        let seq = ConnIdSequence::new();
        assert_eq!(seq.current(), 0);
        assert_eq!(seq.next_id(), 1);
        assert_eq!(seq.next_id(), 2);
        assert_eq!(seq.current(), 2);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ServerId::generate();
        let b = ServerId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with('N'));
    }

    #[test]
    fn test_server_id_order() {
        let low = ServerId::from("AAA");
        let high = ServerId::from("BBB");
        assert!(low < high);
        assert_eq!(low, *"AAA");
    }
}
