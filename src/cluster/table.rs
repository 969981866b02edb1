//! Route Table
//!
//! Established routes keyed by remote server identity. A peer has at most one
//! entry; ids come from the server-wide connection id sequence and are only
//! taken when a route is registered, so refused attempts consume none.
//!
//! The table is also the registry's [`InterestSink`]: interest deltas become
//! `Sub`/`Unsub` frames on every eligible route queue.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::RouteError;
use crate::config::RouteUrl;
use crate::protocol::route::RouteFrame;
use crate::protocol::{ConnId, ConnIdSequence, ServerId};
use crate::subject::{InterestDelta, InterestSink};

/// A route that passed the handshake, before it has an id
pub(crate) struct PendingRoute {
    pub peer: ServerId,
    pub peer_name: String,
    /// URL we dialed, for solicited routes
    pub url: Option<RouteUrl>,
    pub remote_addr: SocketAddr,
    pub tx: mpsc::UnboundedSender<RouteFrame>,
    pub close: CancellationToken,
}

/// Handle to an established route
#[derive(Debug)]
pub struct RouteHandle {
    id: ConnId,
    peer: ServerId,
    peer_name: String,
    url: Option<RouteUrl>,
    remote_addr: SocketAddr,
    established_at: SystemTime,
    tx: mpsc::UnboundedSender<RouteFrame>,
    close: CancellationToken,
    /// Set once the initial interest dump has been written
    synced: AtomicBool,
}

impl RouteHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> &ServerId {
        &self.peer
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn url(&self) -> Option<&RouteUrl> {
        self.url.as_ref()
    }

    pub fn is_solicited(&self) -> bool {
        self.url.is_some()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn established_at(&self) -> SystemTime {
        self.established_at
    }

    /// Queue a frame; never blocks. Returns false once the writer is gone.
    pub fn send(&self, frame: RouteFrame) -> bool {
        self.tx.send(frame).is_ok()
    }

    /// Ask the route to close. Idempotent.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn close_token(&self) -> &CancellationToken {
        &self.close
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub(crate) fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }
}

/// Introspection view of a route
#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub rid: ConnId,
    pub remote_id: String,
    pub remote_name: String,
    pub solicited: bool,
    pub remote_addr: SocketAddr,
    pub established_at: SystemTime,
    pub synced: bool,
    /// Subscription records learned over this route
    pub subscriptions: usize,
}

#[derive(Default)]
struct TableInner {
    by_peer: AHashMap<ServerId, Arc<RouteHandle>>,
    by_id: BTreeMap<ConnId, Arc<RouteHandle>>,
}

/// Established routes
pub struct RouteTable {
    inner: RwLock<TableInner>,
    ids: Arc<ConnIdSequence>,
}

impl RouteTable {
    pub fn new(ids: Arc<ConnIdSequence>) -> Self {
        Self {
            inner: RwLock::new(TableInner::default()),
            ids,
        }
    }

    /// Register a route to `pending.peer`.
    ///
    /// `preamble` is queued on the route before it becomes visible, so it
    /// precedes every delta sent to the route. Fails with `DuplicateRoute`
    /// if the peer already has a route; nothing is queued then.
    pub(crate) fn register(
        &self,
        pending: PendingRoute,
        preamble: Vec<RouteFrame>,
    ) -> Result<Arc<RouteHandle>, RouteError> {
        let mut inner = self.inner.write();
        if inner.by_peer.contains_key(&pending.peer) {
            return Err(RouteError::DuplicateRoute(pending.peer));
        }

        let id = self.ids.next_id();
        for frame in preamble {
            let _ = pending.tx.send(frame);
        }

        let handle = Arc::new(RouteHandle {
            id,
            peer: pending.peer,
            peer_name: pending.peer_name,
            url: pending.url,
            remote_addr: pending.remote_addr,
            established_at: SystemTime::now(),
            tx: pending.tx,
            close: pending.close,
            synced: AtomicBool::new(false),
        });
        inner.by_peer.insert(handle.peer.clone(), handle.clone());
        inner.by_id.insert(id, handle.clone());
        Ok(handle)
    }

    /// Take the route to `peer` out of the table without closing it
    pub fn retire(&self, peer: &ServerId) -> Option<Arc<RouteHandle>> {
        let mut inner = self.inner.write();
        let handle = inner.by_peer.remove(peer)?;
        inner.by_id.remove(&handle.id);
        Some(handle)
    }

    /// Remove route `id`. Returns false if it was already gone.
    pub fn remove(&self, id: ConnId) -> bool {
        let mut inner = self.inner.write();
        let Some(handle) = inner.by_id.remove(&id) else {
            return false;
        };
        inner.by_peer.remove(&handle.peer);
        true
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<RouteHandle>> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn get_by_peer(&self, peer: &ServerId) -> Option<Arc<RouteHandle>> {
        self.inner.read().by_peer.get(peer).cloned()
    }

    /// Id of the direct route to `peer`
    pub fn route_id_for(&self, peer: &ServerId) -> Option<ConnId> {
        self.inner.read().by_peer.get(peer).map(|h| h.id)
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.inner.read().by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Routes ordered by id
    pub fn snapshot(&self) -> Vec<Arc<RouteHandle>> {
        self.inner.read().by_id.values().cloned().collect()
    }

    /// Queue a frame on route `id`
    pub fn send(&self, id: ConnId, frame: RouteFrame) -> bool {
        match self.inner.read().by_id.get(&id) {
            Some(handle) => handle.send(frame),
            None => false,
        }
    }

    /// Close every route
    pub fn close_all(&self) {
        for handle in self.inner.read().by_id.values() {
            handle.close();
        }
    }
}

impl InterestSink for RouteTable {
    fn interest_changed(&self, delta: &InterestDelta) {
        let key = delta.key();
        let origin = key.origin.to_string();
        let subject = key.subject.to_string();
        let queue = key.queue.as_deref().map(str::to_string);
        let frame = if delta.is_add() {
            RouteFrame::Sub {
                origin,
                subject,
                queue,
            }
        } else {
            RouteFrame::Unsub {
                origin,
                subject,
                queue,
            }
        };

        let inner = self.inner.read();
        for handle in inner.by_id.values() {
            // Never back toward where it came from, never to its origin
            if delta.exclude().contains(&handle.id) || handle.peer == key.origin {
                continue;
            }
            handle.send(frame.clone());
        }
    }
}
