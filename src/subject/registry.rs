//! Subscription Registry
//!
//! Single source of truth correlating client connections and routes to their
//! live subscriptions. Every mutation goes through one write lock covering the
//! Sublist and the interest bookkeeping, so a closing owner is never partially
//! visible to a concurrent match.
//!
//! Interest is tracked per key `(origin server, pattern, queue)`:
//! - local keys are reference counted over local subscriptions; the first
//!   subscription produces an `Add`, the last removal a `Remove`
//! - remote keys remember every route they were learned on; the first route
//!   produces an `Add` (excluding that route), losing the last route a `Remove`
//!
//! Deltas are handed to the [`InterestSink`] while the write lock is still
//! held, so the order in which peers observe deltas equals mutation order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::{smallvec, SmallVec};
use tracing::debug;

use super::sublist::{Sublist, SublistResult};
use super::validation::{validate_pattern, validate_queue};
use super::{Origin, SubjectError, Subscription};
use crate::protocol::{ConnId, ServerId};

/// Unit of route-level interest propagation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterestKey {
    /// Server whose subscriptions create this interest
    pub origin: ServerId,
    pub subject: Arc<str>,
    pub queue: Option<Arc<str>>,
}

impl InterestKey {
    pub fn new(origin: ServerId, subject: &str, queue: Option<&str>) -> Self {
        Self {
            origin,
            subject: subject.into(),
            queue: queue.map(Into::into),
        }
    }
}

/// Change of aggregate interest that routes must hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterestDelta {
    Add {
        key: InterestKey,
        /// Routes the change arrived on; never sent back to them
        exclude: SmallVec<[ConnId; 2]>,
    },
    Remove {
        key: InterestKey,
        exclude: SmallVec<[ConnId; 2]>,
    },
}

impl InterestDelta {
    pub fn key(&self) -> &InterestKey {
        match self {
            Self::Add { key, .. } | Self::Remove { key, .. } => key,
        }
    }

    pub fn exclude(&self) -> &[ConnId] {
        match self {
            Self::Add { exclude, .. } | Self::Remove { exclude, .. } => exclude,
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, Self::Add { .. })
    }
}

/// Receiver of interest deltas.
///
/// Called with the registry write lock held: implementations must not block
/// and must not call back into the registry.
pub trait InterestSink: Send + Sync {
    fn interest_changed(&self, delta: &InterestDelta);
}

/// Sink that drops every delta (standalone servers)
#[derive(Debug, Default)]
pub struct NoopSink;

impl InterestSink for NoopSink {
    fn interest_changed(&self, _delta: &InterestDelta) {}
}

type LocalKey = (Arc<str>, Option<Arc<str>>);

/// Round-robin state of one queue group name
#[derive(Default)]
struct QueueGroup {
    /// Live subscriptions, local and remote, using this group name
    members: usize,
    next: AtomicUsize,
}

#[derive(Default)]
struct RegistryInner {
    sublist: Sublist,
    /// owner -> sid -> subscription
    by_owner: AHashMap<ConnId, AHashMap<Arc<str>, Arc<Subscription>>>,
    /// Local subscription count per (pattern, queue)
    local_interest: AHashMap<LocalKey, usize>,
    /// Routes each remote key was learned on
    remote_interest: AHashMap<InterestKey, SmallVec<[ConnId; 2]>>,
    /// Dropped with the last member so unique group names do not accumulate
    queue_groups: AHashMap<Arc<str>, QueueGroup>,
    local_subs: usize,
}

impl RegistryInner {
    fn key_of(local_id: &ServerId, sub: &Subscription) -> InterestKey {
        let origin = match sub.origin {
            Origin::Local => local_id.clone(),
            Origin::Remote { ref server, .. } => server.clone(),
        };
        InterestKey {
            origin,
            subject: sub.subject.clone(),
            queue: sub.queue.clone(),
        }
    }

    /// Insert into the index and account interest
    fn link(
        &mut self,
        local_id: &ServerId,
        sub: Arc<Subscription>,
    ) -> Result<Option<InterestDelta>, SubjectError> {
        self.sublist.insert(sub.clone())?;
        if let Some(ref queue) = sub.queue {
            self.queue_groups.entry(queue.clone()).or_default().members += 1;
        }
        self.by_owner
            .entry(sub.owner)
            .or_default()
            .insert(sub.sid.clone(), sub.clone());

        let delta = match sub.origin {
            Origin::Local => {
                self.local_subs += 1;
                let count = self
                    .local_interest
                    .entry((sub.subject.clone(), sub.queue.clone()))
                    .or_insert(0);
                *count += 1;
                (*count == 1).then(|| InterestDelta::Add {
                    key: Self::key_of(local_id, &sub),
                    exclude: SmallVec::new(),
                })
            }
            Origin::Remote { route, .. } => {
                let key = Self::key_of(local_id, &sub);
                let routes = self.remote_interest.entry(key.clone()).or_default();
                let first = routes.is_empty();
                if !routes.contains(&route) {
                    routes.push(route);
                }
                first.then(|| InterestDelta::Add {
                    key,
                    exclude: smallvec![route],
                })
            }
        };
        Ok(delta)
    }

    /// Remove from the index and account interest.
    ///
    /// The caller is responsible for the `by_owner` entry.
    fn unlink(&mut self, local_id: &ServerId, sub: &Subscription) -> Option<InterestDelta> {
        if !self.sublist.remove(sub) {
            return None;
        }
        if let Some(ref queue) = sub.queue {
            if let Some(group) = self.queue_groups.get_mut(queue) {
                group.members -= 1;
                if group.members == 0 {
                    self.queue_groups.remove(queue);
                }
            }
        }

        match sub.origin {
            Origin::Local => {
                self.local_subs -= 1;
                let local_key = (sub.subject.clone(), sub.queue.clone());
                let count = self.local_interest.get_mut(&local_key)?;
                *count -= 1;
                if *count > 0 {
                    return None;
                }
                self.local_interest.remove(&local_key);
                Some(InterestDelta::Remove {
                    key: Self::key_of(local_id, sub),
                    exclude: SmallVec::new(),
                })
            }
            Origin::Remote { route, .. } => {
                let key = Self::key_of(local_id, sub);
                let routes = self.remote_interest.get_mut(&key)?;
                routes.retain(|r| *r != route);
                if !routes.is_empty() {
                    return None;
                }
                self.remote_interest.remove(&key);
                Some(InterestDelta::Remove {
                    key,
                    exclude: smallvec![route],
                })
            }
        }
    }

    fn remove_sid(
        &mut self,
        local_id: &ServerId,
        owner: ConnId,
        sid: &str,
    ) -> Option<Option<InterestDelta>> {
        let subs = self.by_owner.get_mut(&owner)?;
        let sub = subs.remove(sid)?;
        if subs.is_empty() {
            self.by_owner.remove(&owner);
        }
        Some(self.unlink(local_id, &sub))
    }
}

/// Thread-safe subscription registry
pub struct SubscriptionRegistry {
    server_id: ServerId,
    inner: RwLock<RegistryInner>,
    sink: Arc<dyn InterestSink>,
}

impl SubscriptionRegistry {
    pub fn new(server_id: ServerId, sink: Arc<dyn InterestSink>) -> Self {
        Self {
            server_id,
            inner: RwLock::new(RegistryInner::default()),
            sink,
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    fn emit(&self, deltas: &[InterestDelta]) {
        for delta in deltas {
            self.sink.interest_changed(delta);
        }
    }

    /// Add a subscription.
    ///
    /// A subscription with an (owner, sid) already present replaces the old
    /// one. Returns the interest delta caused by the new subscription, if any.
    pub fn subscribe(&self, sub: Subscription) -> Result<Option<InterestDelta>, SubjectError> {
        validate_pattern(&sub.subject)?;
        if let Some(ref queue) = sub.queue {
            validate_queue(queue)?;
        }

        let sub = Arc::new(sub);
        let mut inner = self.inner.write();

        let existing = inner
            .by_owner
            .get(&sub.owner)
            .and_then(|subs| subs.get(&sub.sid))
            .cloned();

        let mut deltas: SmallVec<[InterestDelta; 2]> = SmallVec::new();
        if let Some(old) = existing {
            if let Some(subs) = inner.by_owner.get_mut(&old.owner) {
                subs.remove(&old.sid);
            }
            deltas.extend(inner.unlink(&self.server_id, &old));
        }

        let added = inner.link(&self.server_id, sub)?;

        // Replacing a subscription with the same interest is not a change
        let unchanged = matches!(
            (deltas.last(), added.as_ref()),
            (Some(InterestDelta::Remove { key, .. }), Some(add)) if key == add.key()
        );
        if unchanged {
            return Ok(None);
        }

        deltas.extend(added.clone());
        self.emit(&deltas);
        Ok(added)
    }

    /// Remove a subscription; unknown sids are ignored
    pub fn unsubscribe(&self, owner: ConnId, sid: &str) -> Option<InterestDelta> {
        let mut inner = self.inner.write();
        match inner.remove_sid(&self.server_id, owner, sid) {
            Some(delta) => {
                if let Some(ref delta) = delta {
                    self.sink.interest_changed(delta);
                }
                delta
            }
            None => {
                debug!("Unsubscribe for unknown sid {} on connection {}", sid, owner);
                None
            }
        }
    }

    /// Remove every subscription of `owner` in one critical section
    pub fn remove_owner(&self, owner: ConnId) -> Vec<InterestDelta> {
        let mut inner = self.inner.write();
        let Some(subs) = inner.by_owner.remove(&owner) else {
            return Vec::new();
        };

        let deltas: Vec<InterestDelta> = subs
            .values()
            .filter_map(|sub| inner.unlink(&self.server_id, sub))
            .collect();
        self.emit(&deltas);
        deltas
    }

    /// Record interest of `key.origin` learned over `route`
    pub fn subscribe_remote(
        &self,
        route: ConnId,
        key: &InterestKey,
    ) -> Result<Option<InterestDelta>, SubjectError> {
        self.subscribe(Subscription::remote(route, key))
    }

    /// Drop interest learned over `route`.
    ///
    /// When `authoritative` (the Unsub came from the origin server itself) the
    /// key is dropped no matter which routes contributed it.
    pub fn unsubscribe_remote(
        &self,
        route: ConnId,
        key: &InterestKey,
        authoritative: bool,
    ) -> Vec<InterestDelta> {
        let mut inner = self.inner.write();
        let routes: SmallVec<[ConnId; 2]> = if authoritative {
            inner.remote_interest.get(key).cloned().unwrap_or_default()
        } else {
            smallvec![route]
        };

        let mut deltas = Vec::new();
        for r in routes {
            let sid = Subscription::remote(r, key).sid;
            if let Some(Some(delta)) = inner.remove_sid(&self.server_id, r, &sid) {
                deltas.push(delta);
            }
        }
        self.emit(&deltas);
        deltas
    }

    /// Drop every route-learned record whose origin is `server`
    pub fn remove_origin(&self, server: &ServerId) -> Vec<InterestDelta> {
        let mut inner = self.inner.write();
        let stale: Vec<(InterestKey, SmallVec<[ConnId; 2]>)> = inner
            .remote_interest
            .iter()
            .filter(|(key, _)| key.origin == *server)
            .map(|(key, routes)| (key.clone(), routes.clone()))
            .collect();

        let mut deltas = Vec::new();
        for (key, routes) in stale {
            for r in routes {
                let sid = Subscription::remote(r, &key).sid;
                if let Some(Some(delta)) = inner.remove_sid(&self.server_id, r, &sid) {
                    deltas.push(delta);
                }
            }
        }
        self.emit(&deltas);
        deltas
    }

    /// Run `f` over the interest keys a new route to `peer` must receive.
    ///
    /// The registry stays read-locked while `f` runs, so no delta can be
    /// emitted between the snapshot and whatever `f` enqueues.
    pub fn with_interest_snapshot<R>(
        &self,
        peer: &ServerId,
        f: impl FnOnce(Vec<InterestKey>) -> R,
    ) -> R {
        let inner = self.inner.read();
        let mut keys: Vec<InterestKey> = inner
            .local_interest
            .keys()
            .map(|(subject, queue)| InterestKey {
                origin: self.server_id.clone(),
                subject: subject.clone(),
                queue: queue.clone(),
            })
            .collect();
        keys.extend(
            inner
                .remote_interest
                .keys()
                .filter(|key| key.origin != *peer)
                .cloned(),
        );
        f(keys)
    }

    /// Find all subscriptions matching `subject`
    pub fn match_subject(&self, subject: &str) -> SublistResult {
        self.inner.read().sublist.match_subject(subject)
    }

    /// Total live subscriptions, local and route-learned
    pub fn count(&self) -> usize {
        self.inner.read().sublist.count()
    }

    /// Subscriptions owned by local clients
    pub fn local_count(&self) -> usize {
        self.inner.read().local_subs
    }

    /// Subscriptions held by one client or route
    pub fn owner_count(&self, owner: ConnId) -> usize {
        self.inner
            .read()
            .by_owner
            .get(&owner)
            .map_or(0, |subs| subs.len())
    }

    /// Number of distinct interest keys (local and remote)
    pub fn interest_count(&self) -> usize {
        let inner = self.inner.read();
        inner.local_interest.len() + inner.remote_interest.len()
    }

    /// Routes a remote key was learned on
    pub fn routes_for(&self, key: &InterestKey) -> SmallVec<[ConnId; 2]> {
        self.inner
            .read()
            .remote_interest
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Pick the next round-robin index for a queue group.
    ///
    /// A group whose last member left in the meantime gets index 0.
    pub fn next_queue_index(&self, group: &str, candidates: usize) -> usize {
        if candidates <= 1 {
            return 0;
        }
        match self.inner.read().queue_groups.get(group) {
            Some(state) => state.next.fetch_add(1, Ordering::Relaxed) % candidates,
            None => 0,
        }
    }

    /// Queue group names with at least one live member
    pub fn queue_group_count(&self) -> usize {
        self.inner.read().queue_groups.len()
    }

    /// Visit every subscription under the read lock
    pub fn for_each_subscription<F>(&self, f: F)
    where
        F: FnMut(&Arc<Subscription>),
    {
        self.inner.read().sublist.for_each(f);
    }
}
