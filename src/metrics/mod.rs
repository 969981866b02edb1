//! Prometheus metrics for meshmq
//!
//! Exposes metrics at the /metrics endpoint of the monitoring server, next to
//! the JSON introspection endpoints.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

mod server;

pub use server::MonitorServer;

/// All meshmq metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Client connection metrics
    pub connections_total: IntCounter,
    pub connections_current: IntGauge,
    pub connections_rejected_total: IntCounterVec,
    pub slow_consumers_total: IntCounter,

    // Route metrics
    pub routes_total: IntCounter,
    pub routes_current: IntGauge,
    pub route_attempts_failed_total: IntCounterVec,

    // Message metrics
    pub messages_received: IntCounter,
    pub messages_sent: IntCounter,
    pub bytes_received: IntCounter,
    pub bytes_sent: IntCounter,

    // Cluster forwarding
    pub route_messages_forwarded: IntCounter,
    pub route_messages_received: IntCounter,

    // Subscription metrics (refreshed on scrape)
    pub subscriptions_current: IntGauge,
}

fn counter(name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    IntCounter::with_opts(Opts::new(name, help))
}

fn gauge(name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    IntGauge::with_opts(Opts::new(name, help))
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = counter(
            "meshmq_connections_total",
            "Total number of client connections since startup",
        )?;
        let connections_current = gauge(
            "meshmq_connections_current",
            "Current number of connected clients",
        )?;
        let connections_rejected_total = IntCounterVec::new(
            Opts::new(
                "meshmq_connections_rejected_total",
                "Client connections refused, by reason",
            ),
            &["reason"],
        )?;
        let slow_consumers_total = counter(
            "meshmq_slow_consumers_total",
            "Clients disconnected for exceeding the pending bytes limit",
        )?;

        let routes_total = counter(
            "meshmq_routes_total",
            "Total number of routes established since startup",
        )?;
        let routes_current = gauge("meshmq_routes_current", "Current number of routes")?;
        let route_attempts_failed_total = IntCounterVec::new(
            Opts::new(
                "meshmq_route_attempts_failed_total",
                "Route attempts that never reached the established state, by reason",
            ),
            &["reason"],
        )?;

        let messages_received = counter(
            "meshmq_messages_received_total",
            "Messages published by clients",
        )?;
        let messages_sent = counter(
            "meshmq_messages_sent_total",
            "Messages delivered to clients",
        )?;
        let bytes_received = counter(
            "meshmq_bytes_received_total",
            "Payload bytes published by clients",
        )?;
        let bytes_sent = counter(
            "meshmq_bytes_sent_total",
            "Payload bytes delivered to clients",
        )?;

        let route_messages_forwarded = counter(
            "meshmq_route_messages_forwarded_total",
            "Messages forwarded to routes",
        )?;
        let route_messages_received = counter(
            "meshmq_route_messages_received_total",
            "Messages received from routes",
        )?;

        let subscriptions_current = gauge(
            "meshmq_subscriptions_current",
            "Current number of subscriptions, local and route-learned",
        )?;

        // Register all metrics
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_current.clone()))?;
        registry.register(Box::new(connections_rejected_total.clone()))?;
        registry.register(Box::new(slow_consumers_total.clone()))?;
        registry.register(Box::new(routes_total.clone()))?;
        registry.register(Box::new(routes_current.clone()))?;
        registry.register(Box::new(route_attempts_failed_total.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;
        registry.register(Box::new(route_messages_forwarded.clone()))?;
        registry.register(Box::new(route_messages_received.clone()))?;
        registry.register(Box::new(subscriptions_current.clone()))?;

        Ok(Metrics {
            registry,
            connections_total,
            connections_current,
            connections_rejected_total,
            slow_consumers_total,
            routes_total,
            routes_current,
            route_attempts_failed_total,
            messages_received,
            messages_sent,
            bytes_received,
            bytes_sent,
            route_messages_forwarded,
            route_messages_received,
            subscriptions_current,
        })
    }

    // Helper methods for common operations

    pub fn client_connected(&self) {
        self.connections_total.inc();
        self.connections_current.inc();
    }

    pub fn client_disconnected(&self) {
        self.connections_current.dec();
    }

    pub fn connection_rejected(&self, reason: &str) {
        self.connections_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn slow_consumer(&self) {
        self.slow_consumers_total.inc();
    }

    pub fn route_established(&self) {
        self.routes_total.inc();
        self.routes_current.inc();
    }

    pub fn route_closed(&self) {
        self.routes_current.dec();
    }

    pub fn route_attempt_failed(&self, reason: &str) {
        self.route_attempts_failed_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn message_received(&self, bytes: usize) {
        self.messages_received.inc();
        self.bytes_received.inc_by(bytes as u64);
    }

    pub fn message_sent(&self, bytes: usize) {
        self.messages_sent.inc();
        self.bytes_sent.inc_by(bytes as u64);
    }

    pub fn route_message_forwarded(&self) {
        self.route_messages_forwarded.inc();
    }

    pub fn route_message_received(&self) {
        self.route_messages_received.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_metrics_register_and_encode() {
        let metrics = Metrics::new().unwrap();
        metrics.client_connected();
        metrics.route_established();
        metrics.route_attempt_failed("duplicate_route");
        metrics.message_received(5);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("meshmq_connections_current 1"));
        assert!(text.contains("meshmq_routes_total 1"));
        assert!(text.contains("meshmq_bytes_received_total 5"));
        assert!(text.contains("reason=\"duplicate_route\""));
    }

    #[test]
    fn test_route_gauge_tracks_closes() {
        let metrics = Metrics::new().unwrap();
        metrics.route_established();
        metrics.route_established();
        metrics.route_closed();
        assert_eq!(metrics.routes_current.get(), 1);
        assert_eq!(metrics.routes_total.get(), 2);
    }
}
