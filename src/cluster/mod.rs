//! Cluster Module
//!
//! Full-mesh route clustering. Every server keeps at most one route to every
//! peer it knows about and gossips subscription interest over it, so that a
//! message published anywhere reaches matching subscribers everywhere.
//!
//! # Architecture
//!
//! - **Route table** (`table`): established routes keyed by peer identity
//! - **Route task** (`route`): handshake, duplicate arbitration, frame I/O
//! - **Dialer** (`dialer`): one reconnecting task per configured route URL
//! - **Coordinator** (this module): accepts routes, owns dialers, applies
//!   inbound frames to the registry and dispatcher, diffs routes on reload
//!
//! # Usage
//!
//! ```toml
//! [cluster]
//! enabled = true
//! listen = "0.0.0.0:6222"
//! routes = ["nats-route://node-b:6222", "node-c:6222"]
//! ```

mod dialer;
mod error;
mod route;
mod table;

pub use dialer::{Backoff, RouteState};
pub use error::RouteError;
pub use table::{RouteHandle, RouteInfo, RouteTable};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use self::dialer::RouteDialer;
pub(crate) use self::table::PendingRoute;
use crate::broker::Dispatcher;
use crate::config::RouteUrl;
use crate::metrics::Metrics;
use crate::protocol::route::{HandshakeInfo, RouteFrame, ROUTE_PROTOCOL_VERSION};
use crate::protocol::{ConnId, ServerId};
use crate::subject::{InterestKey, SubscriptionRegistry};

// Re-export cluster config
pub use crate::config::ClusterConfig;

/// Reason sent with a duplicate rejection
pub(crate) const DUPLICATE_ROUTE: &str = "duplicate route";

/// Headroom on top of the payload limit for a route frame
const FRAME_OVERHEAD: usize = 4096;

/// Route timers and limits; changes apply to routes opened afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub connect_retry_initial: Duration,
    pub connect_retry_max: Duration,
    pub ping_interval: Duration,
    pub max_pings_out: u32,
    pub max_frame: usize,
}

impl RouteSettings {
    pub fn from_config(cluster: &ClusterConfig, max_payload: usize) -> Self {
        Self {
            connect_timeout: cluster.connect_timeout,
            handshake_timeout: cluster.handshake_timeout,
            connect_retry_initial: cluster.connect_retry_initial,
            connect_retry_max: cluster.connect_retry_max,
            ping_interval: cluster.ping_interval,
            max_pings_out: cluster.max_pings_out,
            max_frame: max_payload + FRAME_OVERHEAD,
        }
    }
}

/// Result of comparing configured route URLs
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RouteDiff {
    pub added: Vec<RouteUrl>,
    pub removed: Vec<RouteUrl>,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compare the solicited set against the configured one.
///
/// Inputs are normalized URLs; duplicates are ignored.
pub fn diff_routes(current: &[RouteUrl], desired: &[RouteUrl]) -> RouteDiff {
    let mut diff = RouteDiff::default();
    for url in desired {
        if !current.contains(url) && !diff.added.contains(url) {
            diff.added.push(url.clone());
        }
    }
    for url in current {
        if !desired.contains(url) && !diff.removed.contains(url) {
            diff.removed.push(url.clone());
        }
    }
    diff
}

/// Local identity announced in the handshake
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub server_id: ServerId,
    pub name: String,
    pub cluster_name: Option<String>,
    /// Address routes are accepted on
    pub listen: SocketAddr,
}

/// Owner of the cluster side of a server
pub struct ClusterCoordinator {
    identity: LocalIdentity,
    registry: Arc<SubscriptionRegistry>,
    routes: Arc<RouteTable>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    settings: RwLock<RouteSettings>,
    /// Dial tasks by normalized URL
    dialers: Mutex<BTreeMap<RouteUrl, RouteDialer>>,
    shutdown: CancellationToken,
}

impl ClusterCoordinator {
    pub fn new(
        identity: LocalIdentity,
        settings: RouteSettings,
        registry: Arc<SubscriptionRegistry>,
        routes: Arc<RouteTable>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            identity,
            registry,
            routes,
            dispatcher,
            metrics,
            settings: RwLock::new(settings),
            dialers: Mutex::new(BTreeMap::new()),
            shutdown,
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.identity.server_id
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn settings(&self) -> RouteSettings {
        *self.settings.read()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn local_info(&self) -> HandshakeInfo {
        HandshakeInfo {
            server_id: self.identity.server_id.to_string(),
            name: self.identity.name.clone(),
            version: ROUTE_PROTOCOL_VERSION,
            cluster: self.identity.cluster_name.clone(),
            listen: self.identity.listen.to_string(),
        }
    }

    /// Accept routes on `listener` and start dialing `routes`
    pub fn start(self: &Arc<Self>, listener: TcpListener, routes: &[RouteUrl]) {
        info!("Cluster listening on {}", self.identity.listen);

        let coord = self.clone();
        tokio::spawn(async move { coord.accept_loop(listener).await });

        let mut dialers = self.dialers.lock();
        for url in routes {
            if dialers.contains_key(url) {
                continue;
            }
            info!("RouteDialer[{}]: configured", url);
            dialers.insert(
                url.clone(),
                RouteDialer::spawn(self.clone(), url.clone(), &self.shutdown),
            );
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Starting route accept loop");
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => result,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!("Route[{}]: incoming connection", addr);
                    let coord = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = route::run_route(coord.clone(), stream, addr, None).await {
                            coord.metrics.route_attempt_failed(e.reason());
                            debug!("Route[{}]: not established: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept route connection: {}", e);
                }
            }
        }
        debug!("Route accept loop stopped");
    }

    /// Validate a peer's handshake and return its identity
    pub(crate) fn check_peer(&self, info: &HandshakeInfo) -> Result<ServerId, RouteError> {
        if info.version != ROUTE_PROTOCOL_VERSION {
            return Err(RouteError::HandshakeMismatch(format!(
                "protocol version {} (expected {})",
                info.version, ROUTE_PROTOCOL_VERSION
            )));
        }
        if info.server_id.is_empty() {
            return Err(RouteError::Protocol("empty server id".to_string()));
        }
        let peer = ServerId::from(info.server_id.as_str());
        if peer == self.identity.server_id {
            return Err(RouteError::SelfRoute);
        }
        if let (Some(ours), Some(theirs)) = (&self.identity.cluster_name, &info.cluster) {
            if ours != theirs {
                return Err(RouteError::HandshakeMismatch(format!(
                    "cluster name '{}' does not match '{}'",
                    theirs, ours
                )));
            }
        }
        Ok(peer)
    }

    /// Register a handshaken route and queue its interest dump.
    ///
    /// The arbitrating side queues `Accept` ahead of the dump. The other side
    /// only gets here after `Accept`, so a route it still holds to the same
    /// peer is stale and is retired first.
    pub(crate) fn establish(
        &self,
        pending: PendingRoute,
        arbitrator: bool,
    ) -> Result<(Arc<RouteHandle>, usize), RouteError> {
        if !arbitrator {
            if let Some(stale) = self.routes.retire(&pending.peer) {
                info!("Route[{}/{}]: replaced by a new route", stale.id(), stale.peer());
                stale.close();
                self.registry.remove_owner(stale.id());
                self.metrics.route_closed();
            }
        }

        let peer = pending.peer.clone();
        let registered = self.registry.with_interest_snapshot(&peer, |keys| {
            let mut preamble = Vec::with_capacity(keys.len() + 1);
            if arbitrator {
                preamble.push(RouteFrame::Accept);
            }
            preamble.extend(keys.into_iter().map(|key| RouteFrame::Sub {
                origin: key.origin.to_string(),
                subject: key.subject.to_string(),
                queue: key.queue.as_deref().map(str::to_string),
            }));
            let preamble_len = preamble.len();
            self.routes
                .register(pending, preamble)
                .map(|handle| (handle, preamble_len))
        })?;

        self.metrics.route_established();
        Ok(registered)
    }

    /// Release everything a closed route held
    pub(crate) fn route_closed(&self, handle: &RouteHandle) {
        let still_registered = self.routes.remove(handle.id());
        let mut removed = self.registry.remove_owner(handle.id()).len();
        if still_registered {
            removed += self.registry.remove_origin(handle.peer()).len();
            self.metrics.route_closed();
        }
        handle.close();
        debug!(
            "Route[{}/{}]: released, {} interest keys withdrawn",
            handle.id(),
            handle.peer(),
            removed
        );
    }

    /// Apply a frame received on established route `rid`
    pub fn on_route_frame(&self, rid: ConnId, frame: RouteFrame) -> Result<(), RouteError> {
        match frame {
            RouteFrame::Sub {
                origin,
                subject,
                queue,
            } => {
                let key = InterestKey::new(ServerId::from(origin), &subject, queue.as_deref());
                if key.origin == self.identity.server_id {
                    // Our own interest came back around
                    return Ok(());
                }
                self.registry
                    .subscribe_remote(rid, &key)
                    .map_err(|e| RouteError::Protocol(e.to_string()))?;
            }
            RouteFrame::Unsub {
                origin,
                subject,
                queue,
            } => {
                let key = InterestKey::new(ServerId::from(origin), &subject, queue.as_deref());
                if key.origin == self.identity.server_id {
                    return Ok(());
                }
                let authoritative = self
                    .routes
                    .get(rid)
                    .is_some_and(|handle| *handle.peer() == key.origin);
                self.registry.unsubscribe_remote(rid, &key, authoritative);
            }
            RouteFrame::Msg(msg) => {
                self.metrics.route_message_received();
                self.dispatcher.deliver_routed(rid, msg);
            }
            RouteFrame::Ping => {
                self.routes.send(rid, RouteFrame::Pong);
            }
            RouteFrame::Pong => {}
            other @ (RouteFrame::Info(_) | RouteFrame::Accept | RouteFrame::Reject { .. }) => {
                return Err(RouteError::Protocol(format!(
                    "unexpected {} on an established route",
                    other.type_name()
                )));
            }
        }
        Ok(())
    }

    /// Apply a reloaded cluster configuration.
    ///
    /// Removed URLs stop dialing and their routes close; added URLs start
    /// dialing; untouched URLs keep their dialer and route.
    pub fn on_config_reload(
        self: &Arc<Self>,
        cluster: &ClusterConfig,
        max_payload: usize,
    ) -> RouteDiff {
        *self.settings.write() = RouteSettings::from_config(cluster, max_payload);

        let desired = cluster.unique_routes();
        let mut dialers = self.dialers.lock();
        let current: Vec<RouteUrl> = dialers.keys().cloned().collect();
        let diff = diff_routes(&current, &desired);

        for url in &diff.removed {
            if let Some(dialer) = dialers.remove(url) {
                info!("RouteDialer[{}]: removed by reload", url);
                dialer.cancel();
            }
        }
        for url in &diff.added {
            info!("RouteDialer[{}]: added by reload", url);
            dialers.insert(
                url.clone(),
                RouteDialer::spawn(self.clone(), url.clone(), &self.shutdown),
            );
        }
        diff
    }

    /// Established routes, ordered by route id
    pub fn routes_snapshot(&self) -> Vec<RouteInfo> {
        self.routes
            .snapshot()
            .into_iter()
            .map(|handle| RouteInfo {
                rid: handle.id(),
                remote_id: handle.peer().to_string(),
                remote_name: handle.peer_name().to_string(),
                solicited: handle.is_solicited(),
                remote_addr: handle.remote_addr(),
                established_at: handle.established_at(),
                synced: handle.is_synced(),
                subscriptions: self.registry.owner_count(handle.id()),
            })
            .collect()
    }

    /// Configured route URLs and the state of their dialers
    pub fn dialer_states(&self) -> Vec<(RouteUrl, RouteState)> {
        self.dialers
            .lock()
            .iter()
            .map(|(url, dialer)| (url.clone(), dialer.state()))
            .collect()
    }

    /// Stop dialing and close every route
    pub fn shutdown(&self) {
        info!("Stopping cluster coordinator");
        self.shutdown.cancel();
        self.routes.close_all();
    }
}
