//! Message Dispatcher
//!
//! Turns a publish into local deliveries and route frames. Every matching
//! local plain subscription gets a copy, every queue group gets exactly one
//! member, and each remote server with interest is reached by one `Msg`
//! frame per next-hop route. Frames name the servers that must deliver and
//! the queue groups each of them owns for this message, so a queue group
//! spread across the cluster still delivers once.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::client::ClientTable;
use crate::cluster::RouteTable;
use crate::metrics::Metrics;
use crate::protocol::client::encode_msg;
use crate::protocol::route::{MsgTarget, RouteFrame, RouteMsg};
use crate::protocol::{ConnId, ServerId};
use crate::subject::{Origin, Subscription, SublistResult, SubscriptionRegistry};

/// Route hops a message may travel before it is dropped
pub const MAX_HOPS: u8 = 8;

/// Where a message entered this server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A local client; `echo == false` suppresses delivery to its own subscriptions
    Client { cid: ConnId, echo: bool },
    /// A route
    Route(ConnId),
    /// The server itself
    Server,
}

/// Outcome of a dispatch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Messages handed to local clients
    pub local: usize,
    /// Frames queued on routes
    pub forwarded: usize,
}

/// Routes each remote origin's interest was learned on
type LearnedRoutes = AHashMap<ServerId, SmallVec<[ConnId; 4]>>;

/// Queue group member chosen for one message
enum QueuePick<'a> {
    Local(&'a Arc<Subscription>),
    Remote(&'a ServerId),
}

pub struct Dispatcher {
    server_id: ServerId,
    registry: Arc<SubscriptionRegistry>,
    routes: Arc<RouteTable>,
    clients: Arc<ClientTable>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        routes: Arc<RouteTable>,
        clients: Arc<ClientTable>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            server_id: registry.server_id().clone(),
            registry,
            routes,
            clients,
            metrics,
        }
    }

    /// Dispatch a message published on this server
    pub fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
        source: Source,
    ) -> Delivery {
        let result = self.registry.match_subject(subject);
        if result.is_empty() {
            trace!("No interest in '{}'", subject);
            return Delivery::default();
        }

        let skip_owner = match source {
            Source::Client { cid, echo: false } => Some(cid),
            _ => None,
        };
        let arrival = match source {
            Source::Route(rid) => Some(rid),
            _ => None,
        };

        let mut delivery = Delivery::default();
        let mut targets: BTreeMap<ServerId, Vec<String>> = BTreeMap::new();

        for sub in &result.psubs {
            match sub.origin {
                Origin::Local => {
                    if Some(sub.owner) != skip_owner && self.deliver(sub, subject, reply, payload) {
                        delivery.local += 1;
                    }
                }
                Origin::Remote { ref server, .. } => {
                    targets.entry(server.clone()).or_default();
                }
            }
        }

        for (group, members) in sorted_groups(&result) {
            match self.pick_queue_member(group, members, skip_owner) {
                Some(QueuePick::Local(sub)) => {
                    if self.deliver(sub, subject, reply, payload) {
                        delivery.local += 1;
                    }
                }
                Some(QueuePick::Remote(server)) => {
                    targets
                        .entry(server.clone())
                        .or_default()
                        .push(group.to_string());
                }
                None => {}
            }
        }

        if !targets.is_empty() {
            let learned = learned_routes(&result);
            let origin = self.server_id.clone();
            delivery.forwarded = self.forward(
                &origin, subject, reply, payload, targets, &learned, 0, arrival,
            );
        }
        delivery
    }

    /// Handle a message that arrived on route `rid`
    pub fn deliver_routed(&self, rid: ConnId, msg: RouteMsg) -> Delivery {
        let RouteMsg {
            origin,
            subject,
            reply,
            payload,
            targets,
            hops,
        } = msg;
        let origin = ServerId::from(origin);
        let payload = Bytes::from(payload);
        let result = self.registry.match_subject(&subject);

        let mut delivery = Delivery::default();
        let mut onward: BTreeMap<ServerId, Vec<String>> = BTreeMap::new();
        for target in targets {
            if self.server_id == *target.server.as_str() {
                delivery.local +=
                    self.deliver_target(&result, &subject, reply.as_deref(), &payload, &target.queues);
            } else {
                onward
                    .entry(ServerId::from(target.server))
                    .or_default()
                    .extend(target.queues);
            }
        }

        if !onward.is_empty() {
            if hops >= MAX_HOPS {
                debug!(
                    "Dropping '{}' from {} for {} servers: hop limit reached",
                    subject,
                    origin,
                    onward.len()
                );
            } else {
                let learned = learned_routes(&result);
                delivery.forwarded = self.forward(
                    &origin,
                    &subject,
                    reply.as_deref(),
                    &payload,
                    onward,
                    &learned,
                    hops + 1,
                    Some(rid),
                );
            }
        }
        delivery
    }

    /// Deliver a message this server was named as a target for
    fn deliver_target(
        &self,
        result: &SublistResult,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
        queues: &[String],
    ) -> usize {
        let mut delivered = 0;
        for sub in result.psubs.iter().filter(|s| s.is_local()) {
            if self.deliver(sub, subject, reply, payload) {
                delivered += 1;
            }
        }

        for group in queues {
            let Some((name, members)) = result.qsubs.get_key_value(group.as_str()) else {
                debug!("Queue group '{}' has no members for '{}'", group, subject);
                continue;
            };
            let mut locals: SmallVec<[&Arc<Subscription>; 8]> =
                members.iter().filter(|s| s.is_local()).collect();
            if locals.is_empty() {
                continue;
            }
            locals.sort_by(|a, b| (a.owner, &a.sid).cmp(&(b.owner, &b.sid)));
            let idx = self.registry.next_queue_index(name, locals.len());
            if self.deliver(locals[idx], subject, reply, payload) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Choose one member of a queue group.
    ///
    /// Local members are candidates individually; each remote server counts
    /// as one candidate and picks its own member on arrival.
    fn pick_queue_member<'a>(
        &self,
        group: &Arc<str>,
        members: &'a [Arc<Subscription>],
        skip_owner: Option<ConnId>,
    ) -> Option<QueuePick<'a>> {
        let mut locals: SmallVec<[&Arc<Subscription>; 8]> = members
            .iter()
            .filter(|s| s.is_local() && Some(s.owner) != skip_owner)
            .collect();
        locals.sort_by(|a, b| (a.owner, &a.sid).cmp(&(b.owner, &b.sid)));

        let mut remotes: SmallVec<[&ServerId; 4]> = members
            .iter()
            .filter_map(|s| match s.origin {
                Origin::Remote { ref server, .. } => Some(server),
                Origin::Local => None,
            })
            .collect();
        remotes.sort();
        remotes.dedup();

        let candidates = locals.len() + remotes.len();
        if candidates == 0 {
            return None;
        }
        let idx = self.registry.next_queue_index(group, candidates);
        Some(match locals.get(idx) {
            Some(sub) => QueuePick::Local(*sub),
            None => QueuePick::Remote(remotes[idx - locals.len()]),
        })
    }

    /// Queue one `Msg` frame per next-hop route.
    ///
    /// Never sends toward the route the message arrived on, the direct route
    /// to its origin, or to the origin itself.
    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        origin: &ServerId,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
        targets: BTreeMap<ServerId, Vec<String>>,
        learned: &LearnedRoutes,
        hops: u8,
        arrival: Option<ConnId>,
    ) -> usize {
        let origin_route = if *origin == self.server_id {
            None
        } else {
            self.routes.route_id_for(origin)
        };

        let mut by_hop: BTreeMap<ConnId, Vec<MsgTarget>> = BTreeMap::new();
        for (server, queues) in targets {
            if server == *origin || server == self.server_id {
                continue;
            }
            let Some(hop) = self.next_hop(&server, learned.get(&server), arrival, origin_route)
            else {
                debug!("No route toward {} for '{}'", server, subject);
                continue;
            };
            by_hop.entry(hop).or_default().push(MsgTarget {
                server: server.to_string(),
                queues,
            });
        }

        let mut forwarded = 0;
        for (rid, targets) in by_hop {
            let msg = RouteMsg {
                origin: origin.to_string(),
                subject: subject.to_string(),
                reply: reply.map(str::to_string),
                payload: payload.to_vec(),
                targets,
                hops,
            };
            if self.routes.send(rid, RouteFrame::Msg(msg)) {
                forwarded += 1;
                self.metrics.route_message_forwarded();
            }
        }
        forwarded
    }

    /// Direct route to `server`, else the lowest live route its interest
    /// was learned on
    fn next_hop(
        &self,
        server: &ServerId,
        learned: Option<&SmallVec<[ConnId; 4]>>,
        arrival: Option<ConnId>,
        origin_route: Option<ConnId>,
    ) -> Option<ConnId> {
        let allowed = |rid: ConnId| Some(rid) != arrival && Some(rid) != origin_route;

        if let Some(direct) = self.routes.route_id_for(server) {
            if allowed(direct) {
                return Some(direct);
            }
        }
        learned
            .into_iter()
            .flatten()
            .copied()
            .filter(|&rid| allowed(rid) && self.routes.contains(rid))
            .min()
    }

    /// Encode and queue a `MSG` for a local subscription
    fn deliver(&self, sub: &Subscription, subject: &str, reply: Option<&str>, payload: &Bytes) -> bool {
        let Some(client) = self.clients.get(sub.owner) else {
            return false;
        };
        let mut buf = BytesMut::new();
        encode_msg(&mut buf, subject, &sub.sid, reply, payload);
        if client.send(buf.freeze()) {
            self.metrics.message_sent(payload.len());
            true
        } else {
            false
        }
    }
}

/// Queue groups in name order
fn sorted_groups(result: &SublistResult) -> Vec<(&Arc<str>, &[Arc<Subscription>])> {
    let mut groups: Vec<_> = result
        .qsubs
        .iter()
        .map(|(name, members)| (name, members.as_slice()))
        .collect();
    groups.sort_by(|a, b| a.0.cmp(b.0));
    groups
}

fn learned_routes(result: &SublistResult) -> LearnedRoutes {
    let mut learned = LearnedRoutes::default();
    let subs = result.psubs.iter().chain(result.qsubs.values().flatten());
    for sub in subs {
        if let Origin::Remote { ref server, route } = sub.origin {
            let routes = learned.entry(server.clone()).or_default();
            if !routes.contains(&route) {
                routes.push(route);
            }
        }
    }
    learned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::client::ClientHandle;
    use crate::cluster::PendingRoute;
    use crate::protocol::ConnIdSequence;
    use crate::subject::InterestKey;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        ids: Arc<ConnIdSequence>,
        registry: Arc<SubscriptionRegistry>,
        routes: Arc<RouteTable>,
        clients: Arc<ClientTable>,
        dispatcher: Dispatcher,
    }

    fn fixture(server: &str) -> Fixture {
        let ids = Arc::new(ConnIdSequence::new());
        let routes = Arc::new(RouteTable::new(ids.clone()));
        let registry = Arc::new(SubscriptionRegistry::new(
            ServerId::from(server),
            routes.clone(),
        ));
        let clients = Arc::new(ClientTable::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let dispatcher = Dispatcher::new(registry.clone(), routes.clone(), clients.clone(), metrics);
        Fixture {
            ids,
            registry,
            routes,
            clients,
            dispatcher,
        }
    }

    impl Fixture {
        fn client(&self) -> (ConnId, mpsc::UnboundedReceiver<Bytes>) {
            let cid = self.ids.next_id();
            let (handle, rx) = ClientHandle::new(
                cid,
                "127.0.0.1:50000".parse().unwrap(),
                0,
                CancellationToken::new(),
            );
            self.clients.insert(handle);
            (cid, rx)
        }

        fn route(&self, peer: &str) -> (ConnId, mpsc::UnboundedReceiver<RouteFrame>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let pending = PendingRoute {
                peer: ServerId::from(peer),
                peer_name: peer.to_string(),
                url: None,
                remote_addr: "127.0.0.1:6222".parse().unwrap(),
                tx,
                close: CancellationToken::new(),
            };
            let handle = self.routes.register(pending, Vec::new()).unwrap();
            (handle.id(), rx)
        }

        fn sub(&self, cid: ConnId, subject: &str, queue: Option<&str>, sid: &str) {
            self.registry
                .subscribe(Subscription::local(cid, subject, queue, sid))
                .unwrap();
        }

        fn remote_sub(&self, rid: ConnId, origin: &str, subject: &str, queue: Option<&str>) {
            let key = InterestKey::new(ServerId::from(origin), subject, queue);
            self.registry.subscribe_remote(rid, &key).unwrap();
        }
    }

    fn drain_msgs(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(data) = rx.try_recv() {
            out.push(String::from_utf8_lossy(&data).into_owned());
        }
        out
    }

    fn drain_route_msgs(rx: &mut mpsc::UnboundedReceiver<RouteFrame>) -> Vec<RouteMsg> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let RouteFrame::Msg(msg) = frame {
                out.push(msg);
            }
        }
        out
    }

    fn routed(origin: &str, subject: &str, targets: Vec<MsgTarget>, hops: u8) -> RouteMsg {
        RouteMsg {
            origin: origin.to_string(),
            subject: subject.to_string(),
            reply: None,
            payload: b"hello".to_vec(),
            targets,
            hops,
        }
    }

    #[test]
    fn test_local_plain_delivery() {
        let fx = fixture("A");
        let (c1, mut rx1) = fx.client();
        let (c2, mut rx2) = fx.client();
        fx.sub(c1, "foo.*", None, "1");
        fx.sub(c2, "foo.bar", None, "7");

        let delivery = fx.dispatcher.publish(
            "foo.bar",
            Some("_INBOX.1"),
            &Bytes::from_static(b"hi"),
            Source::Server,
        );
        assert_eq!(delivery.local, 2);
        assert_eq!(delivery.forwarded, 0);
        assert_eq!(drain_msgs(&mut rx1), vec!["MSG foo.bar 1 _INBOX.1 2\r\nhi\r\n"]);
        assert_eq!(drain_msgs(&mut rx2), vec!["MSG foo.bar 7 _INBOX.1 2\r\nhi\r\n"]);
    }

    #[test]
    fn test_no_echo_skips_publisher() {
        let fx = fixture("A");
        let (c1, mut rx1) = fx.client();
        let (c2, mut rx2) = fx.client();
        fx.sub(c1, "foo", None, "1");
        fx.sub(c2, "foo", None, "1");

        let payload = Bytes::from_static(b"x");
        fx.dispatcher
            .publish("foo", None, &payload, Source::Client { cid: c1, echo: false });
        assert!(drain_msgs(&mut rx1).is_empty());
        assert_eq!(drain_msgs(&mut rx2).len(), 1);

        fx.dispatcher
            .publish("foo", None, &payload, Source::Client { cid: c1, echo: true });
        assert_eq!(drain_msgs(&mut rx1).len(), 1);
    }

    #[test]
    fn test_queue_group_round_robin() {
        let fx = fixture("A");
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (cid, rx) = fx.client();
            fx.sub(cid, "work", Some("workers"), "1");
            receivers.push(rx);
        }

        let payload = Bytes::from_static(b"job");
        for _ in 0..9 {
            let delivery = fx.dispatcher.publish("work", None, &payload, Source::Server);
            assert_eq!(delivery.local, 1);
        }
        for rx in &mut receivers {
            assert_eq!(drain_msgs(rx).len(), 3);
        }
    }

    #[test]
    fn test_one_frame_per_route() {
        let fx = fixture("A");
        let (rid, mut rx) = fx.route("B");
        fx.remote_sub(rid, "B", "foo", None);
        fx.remote_sub(rid, "B", "foo.>", None);
        fx.remote_sub(rid, "B", "foo", Some("q"));

        let delivery = fx
            .dispatcher
            .publish("foo.bar", None, &Bytes::from_static(b"x"), Source::Server);
        assert_eq!(delivery.forwarded, 1);
        let msgs = drain_route_msgs(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].origin, "A");
        assert_eq!(msgs[0].hops, 0);
        assert_eq!(
            msgs[0].targets,
            vec![MsgTarget {
                server: "B".to_string(),
                queues: Vec::new(),
            }]
        );

        let delivery = fx
            .dispatcher
            .publish("foo", None, &Bytes::from_static(b"x"), Source::Server);
        assert_eq!(delivery.forwarded, 1);
        let msgs = drain_route_msgs(&mut rx);
        assert_eq!(msgs[0].targets[0].queues, vec!["q".to_string()]);
    }

    #[test]
    fn test_queue_group_spans_cluster_exactly_once() {
        let fx = fixture("A");
        let (rid, mut route_rx) = fx.route("B");
        let (cid, mut client_rx) = fx.client();
        fx.sub(cid, "work", Some("workers"), "1");
        fx.remote_sub(rid, "B", "work", Some("workers"));

        let payload = Bytes::from_static(b"job");
        for _ in 0..10 {
            let delivery = fx.dispatcher.publish("work", None, &payload, Source::Server);
            assert_eq!(delivery.local + delivery.forwarded, 1);
        }
        assert_eq!(drain_msgs(&mut client_rx).len(), 5);
        assert_eq!(drain_route_msgs(&mut route_rx).len(), 5);
    }

    #[test]
    fn test_routed_target_delivers_one_queue_member() {
        let fx = fixture("B");
        let (rid, mut route_rx) = fx.route("A");
        let (c1, mut rx1) = fx.client();
        let (c2, mut rx2) = fx.client();
        let (c3, mut rx3) = fx.client();
        fx.sub(c1, "work", Some("workers"), "1");
        fx.sub(c2, "work", Some("workers"), "1");
        fx.sub(c3, "work", None, "9");

        let msg = routed(
            "A",
            "work",
            vec![MsgTarget {
                server: "B".to_string(),
                queues: vec!["workers".to_string()],
            }],
            0,
        );
        let delivery = fx.dispatcher.deliver_routed(rid, msg);
        assert_eq!(delivery.local, 2);
        assert_eq!(drain_msgs(&mut rx1).len() + drain_msgs(&mut rx2).len(), 1);
        assert_eq!(drain_msgs(&mut rx3).len(), 1);
        // Nothing goes back toward the arrival route
        assert!(drain_route_msgs(&mut route_rx).is_empty());
    }

    #[test]
    fn test_routed_not_targeted_is_not_delivered() {
        let fx = fixture("B");
        let (rid, _route_rx) = fx.route("A");
        let (cid, mut rx) = fx.client();
        fx.sub(cid, "foo", None, "1");

        let msg = routed(
            "A",
            "foo",
            vec![MsgTarget {
                server: "C".to_string(),
                queues: Vec::new(),
            }],
            0,
        );
        let delivery = fx.dispatcher.deliver_routed(rid, msg);
        assert_eq!(delivery.local, 0);
        assert!(drain_msgs(&mut rx).is_empty());
    }

    #[test]
    fn test_relay_toward_target_via_learned_route() {
        // B relays for A toward C when A has no direct route to C
        let fx = fixture("B");
        let (from_a, mut rx_a) = fx.route("A");
        let (to_c, mut rx_c) = fx.route("C");
        fx.remote_sub(to_c, "C", "foo", None);

        let msg = routed(
            "A",
            "foo",
            vec![MsgTarget {
                server: "C".to_string(),
                queues: Vec::new(),
            }],
            0,
        );
        let delivery = fx.dispatcher.deliver_routed(from_a, msg);
        assert_eq!(delivery.forwarded, 1);
        let msgs = drain_route_msgs(&mut rx_c);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].origin, "A");
        assert_eq!(msgs[0].hops, 1);
        assert!(drain_route_msgs(&mut rx_a).is_empty());
    }

    #[test]
    fn test_never_forwards_to_origin() {
        let fx = fixture("B");
        let (from_c, _rx_c) = fx.route("C");
        let (_to_a, mut rx_a) = fx.route("A");

        let msg = routed(
            "A",
            "foo",
            vec![MsgTarget {
                server: "A".to_string(),
                queues: Vec::new(),
            }],
            1,
        );
        let delivery = fx.dispatcher.deliver_routed(from_c, msg);
        assert_eq!(delivery.forwarded, 0);
        assert!(drain_route_msgs(&mut rx_a).is_empty());
    }

    #[test]
    fn test_hop_limit_stops_forwarding() {
        let fx = fixture("B");
        let (from_a, _rx_a) = fx.route("A");
        let (_to_c, mut rx_c) = fx.route("C");

        let msg = routed(
            "A",
            "foo",
            vec![MsgTarget {
                server: "C".to_string(),
                queues: Vec::new(),
            }],
            MAX_HOPS,
        );
        let delivery = fx.dispatcher.deliver_routed(from_a, msg);
        assert_eq!(delivery.forwarded, 0);
        assert!(drain_route_msgs(&mut rx_c).is_empty());
    }

    #[test]
    fn test_route_source_not_sent_back() {
        let fx = fixture("A");
        let (rid, mut rx) = fx.route("B");
        fx.remote_sub(rid, "B", "foo", None);

        let delivery = fx
            .dispatcher
            .publish("foo", None, &Bytes::from_static(b"x"), Source::Route(rid));
        assert_eq!(delivery.forwarded, 0);
        assert!(drain_route_msgs(&mut rx).is_empty());
    }
}
