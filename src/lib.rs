//! meshmq - subject-based publish/subscribe broker with full-mesh clustering
//!
//! Clients speak a line-oriented text protocol (`PUB`, `SUB`, `MSG`, ...).
//! Servers connect to each other over routes, exchange subscription interest
//! and forward messages only to peers that asked for them.

pub mod broker;
pub mod cluster;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod subject;

pub use broker::{Server, ServerError};
pub use cluster::{ClusterConfig, ClusterCoordinator, RouteInfo, RouteState};
pub use config::Config;
pub use metrics::{Metrics, MonitorServer};
pub use protocol::{ConnId, ServerId};
pub use subject::SubscriptionRegistry;
