//! Subject matching and subscription management
//!
//! Implements subject/pattern validation, the Sublist trie used for matching,
//! and the registry that correlates connections and routes to their
//! subscriptions.

mod registry;
mod sublist;
pub mod validation;

pub use registry::{InterestDelta, InterestKey, InterestSink, NoopSink, SubscriptionRegistry};
pub use sublist::{Sublist, SublistResult};
pub use validation::{subject_matches_pattern, validate_pattern, validate_subject};

use std::fmt;
use std::sync::Arc;

use crate::protocol::{ConnId, ServerId};

/// Where a subscription came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A client connected to this server
    Local,
    /// Interest of `server`, learned over `route`
    Remote { server: ServerId, route: ConnId },
}

/// A subscription entry
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subject pattern
    pub subject: Arc<str>,
    /// Queue group, if any
    pub queue: Option<Arc<str>>,
    /// Owning client connection or route
    pub owner: ConnId,
    /// Subscriber id, unique per owner
    pub sid: Arc<str>,
    pub origin: Origin,
}

impl Subscription {
    /// Build a subscription owned by a local client
    pub fn local(owner: ConnId, subject: &str, queue: Option<&str>, sid: &str) -> Self {
        Self {
            subject: subject.into(),
            queue: queue.map(Into::into),
            owner,
            sid: sid.into(),
            origin: Origin::Local,
        }
    }

    /// Build the record for interest learned over a route.
    ///
    /// The sid is derived from the interest key, so each route holds at most
    /// one record per key.
    pub fn remote(route: ConnId, key: &InterestKey) -> Self {
        let sid = match key.queue {
            Some(ref queue) => format!("{} {} {}", key.origin, key.subject, queue),
            None => format!("{} {}", key.origin, key.subject),
        };
        Self {
            subject: key.subject.clone(),
            queue: key.queue.clone(),
            owner: route,
            sid: sid.into(),
            origin: Origin::Remote {
                server: key.origin.clone(),
                route,
            },
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.origin, Origin::Local)
    }
}

/// Subject errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectError {
    /// Subject is not valid for publishing
    InvalidSubject(String),
    /// Subscription pattern or queue name is malformed
    InvalidPattern(String),
}

impl fmt::Display for SubjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSubject(s) => write!(f, "invalid subject: {:?}", s),
            Self::InvalidPattern(s) => write!(f, "invalid subject pattern: {:?}", s),
        }
    }
}

impl std::error::Error for SubjectError {}
