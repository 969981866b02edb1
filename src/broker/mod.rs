//! meshmq Server Core
//!
//! The server owns the shared state (connection id sequence, subscription
//! registry, route table, client table, dispatcher, metrics) and hands `Arc`s
//! of it to the client connections, the cluster coordinator and the
//! monitoring endpoint. There are no process-wide singletons: several servers
//! can run in one process, which the integration tests rely on.

mod client;
mod dispatch;

pub use client::{ClientError, ClientHandle, ClientInfo, ClientTable};
pub use dispatch::{Delivery, Dispatcher, Source, MAX_HOPS};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cluster::{ClusterCoordinator, LocalIdentity, RouteInfo, RouteSettings, RouteTable};
use crate::config::{Config, ConfigError, LimitsConfig, ReloadError};
use crate::metrics::{Metrics, MonitorServer};
use crate::protocol::client::ServerInfo;
use crate::protocol::{ConnId, ConnIdSequence, ServerId};
use crate::subject::{SubjectError, Subscription, SubscriptionRegistry};

/// Client protocol version announced in `INFO`
const CLIENT_PROTO: u8 = 1;

/// Server startup errors
#[derive(Debug)]
pub enum ServerError {
    /// A listener could not be bound
    Io(io::Error),
    /// The configuration is invalid
    Config(ConfigError),
    /// Metrics could not be registered
    Metrics(prometheus::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "IO error: {}", e),
            ServerError::Config(e) => write!(f, "Configuration error: {}", e),
            ServerError::Metrics(e) => write!(f, "Metrics error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            ServerError::Config(e) => Some(e),
            ServerError::Metrics(e) => Some(e),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

impl From<prometheus::Error> for ServerError {
    fn from(e: prometheus::Error) -> Self {
        ServerError::Metrics(e)
    }
}

/// A meshmq server
pub struct Server {
    config: RwLock<Config>,
    /// File the configuration was loaded from, used by `reload`
    config_path: Option<PathBuf>,
    server_id: ServerId,
    name: String,
    ids: Arc<ConnIdSequence>,
    registry: Arc<SubscriptionRegistry>,
    routes: Arc<RouteTable>,
    clients: Arc<ClientTable>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    coordinator: OnceLock<Arc<ClusterCoordinator>>,
    client_addr: OnceLock<SocketAddr>,
    cluster_addr: OnceLock<SocketAddr>,
    monitor_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
    started_at: SystemTime,
}

impl Server {
    /// Build a server from `config`; nothing is bound until [`Server::start`]
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Arc<Self>, ServerError> {
        config.validate()?;

        let server_id = match config.server.id {
            Some(ref id) => ServerId::from(id.as_str()),
            None => ServerId::generate(),
        };
        let name = config
            .server
            .name
            .clone()
            .unwrap_or_else(|| server_id.to_string());

        let ids = Arc::new(ConnIdSequence::new());
        let routes = Arc::new(RouteTable::new(ids.clone()));
        let registry = Arc::new(SubscriptionRegistry::new(
            server_id.clone(),
            routes.clone(),
        ));
        let clients = Arc::new(ClientTable::new());
        let metrics = Arc::new(Metrics::new()?);
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            routes.clone(),
            clients.clone(),
            metrics.clone(),
        ));

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            config_path,
            server_id,
            name,
            ids,
            registry,
            routes,
            clients,
            dispatcher,
            metrics,
            coordinator: OnceLock::new(),
            client_addr: OnceLock::new(),
            cluster_addr: OnceLock::new(),
            monitor_addr: OnceLock::new(),
            shutdown: CancellationToken::new(),
            started_at: SystemTime::now(),
        }))
    }

    /// Bind the listeners and start accepting clients and routes.
    ///
    /// Returns once everything is bound; the bound addresses are then
    /// available from [`Server::client_addr`] and friends.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        let config = self.config.read().clone();

        let listener = TcpListener::bind(config.server.bind).await?;
        let client_addr = listener.local_addr()?;
        let _ = self.client_addr.set(client_addr);
        info!(
            "Server {} ('{}') listening for clients on {}",
            self.server_id, self.name, client_addr
        );

        if config.cluster.enabled {
            let cluster_listener = TcpListener::bind(config.cluster.listen).await?;
            let cluster_addr = cluster_listener.local_addr()?;
            let _ = self.cluster_addr.set(cluster_addr);

            let coordinator = Arc::new(ClusterCoordinator::new(
                LocalIdentity {
                    server_id: self.server_id.clone(),
                    name: self.name.clone(),
                    cluster_name: config.cluster.name.clone(),
                    listen: cluster_addr,
                },
                RouteSettings::from_config(&config.cluster, config.limits.max_payload),
                self.registry.clone(),
                self.routes.clone(),
                self.dispatcher.clone(),
                self.metrics.clone(),
                self.shutdown.child_token(),
            ));
            // Published before any route can come up
            let _ = self.coordinator.set(coordinator.clone());
            coordinator.start(cluster_listener, &config.cluster.unique_routes());
        }

        if config.monitor.enabled {
            let monitor_listener = TcpListener::bind(config.monitor.bind).await?;
            let monitor_addr = monitor_listener.local_addr()?;
            let _ = self.monitor_addr.set(monitor_addr);
            info!("Monitoring on http://{}", monitor_addr);
            let monitor = MonitorServer::new(self.clone());
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { monitor.run(monitor_listener, shutdown).await });
        }

        let server = self.clone();
        tokio::spawn(async move { server.accept_loop(listener).await });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => result,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        let _ = client::run_client(server, stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept client connection: {}", e);
                }
            }
        }
        debug!("Client accept loop stopped");
    }

    /// Record a subscription of local client `owner`
    pub fn on_local_subscribe(
        &self,
        owner: ConnId,
        pattern: &str,
        queue: Option<&str>,
        sid: &str,
    ) -> Result<(), SubjectError> {
        self.registry
            .subscribe(Subscription::local(owner, pattern, queue, sid))
            .map(|_| ())
    }

    /// Drop a subscription of local client `owner`; unknown sids are ignored
    pub fn on_local_unsubscribe(&self, owner: ConnId, sid: &str) {
        self.registry.unsubscribe(owner, sid);
    }

    /// Apply a new configuration.
    ///
    /// Either the whole configuration is accepted or nothing changes.
    pub fn on_config_reload(&self, new: Config) -> Result<(), ReloadError> {
        new.validate()?;
        self.config.read().check_reloadable(&new)?;

        if let Some(coordinator) = self.coordinator.get() {
            let diff = coordinator.on_config_reload(&new.cluster, new.limits.max_payload);
            info!(
                "Configuration reloaded: {} routes added, {} removed",
                diff.added.len(),
                diff.removed.len()
            );
        } else {
            info!("Configuration reloaded");
        }
        *self.config.write() = new;
        Ok(())
    }

    /// Re-read the configuration file the server was started with
    pub fn reload(&self) -> Result<(), ReloadError> {
        match self.config_path {
            Some(ref path) => self.reload_from_path(path),
            None => Err(ReloadError::NoConfigFile),
        }
    }

    /// Load `path` and apply it; a missing file is an error
    pub fn reload_from_path(&self, path: &Path) -> Result<(), ReloadError> {
        let config = Config::load_existing(path)?;
        self.on_config_reload(config)
    }

    /// Publish a message originated by the server itself
    pub fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Delivery {
        self.dispatcher
            .publish(subject, reply, &payload, Source::Server)
    }

    /// Established routes, ordered by route id
    pub fn routes_snapshot(&self) -> Vec<RouteInfo> {
        match self.coordinator.get() {
            Some(coordinator) => coordinator.routes_snapshot(),
            None => Vec::new(),
        }
    }

    /// Live subscriptions, local and route-learned
    pub fn subscription_count(&self) -> usize {
        self.registry.count()
    }

    /// Ids of connected clients, ascending
    pub fn connections_snapshot(&self) -> Vec<ConnId> {
        self.clients.ids()
    }

    /// Last connection id handed out to a client or route
    pub fn current_cid(&self) -> ConnId {
        self.ids.current()
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr.get().copied()
    }

    pub fn cluster_addr(&self) -> Option<SocketAddr> {
        self.cluster_addr.get().copied()
    }

    pub fn monitor_addr(&self) -> Option<SocketAddr> {
        self.monitor_addr.get().copied()
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn clients(&self) -> &Arc<ClientTable> {
        &self.clients
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn coordinator(&self) -> Option<&Arc<ClusterCoordinator>> {
        self.coordinator.get()
    }

    pub(crate) fn ids(&self) -> &ConnIdSequence {
        &self.ids
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn limits(&self) -> LimitsConfig {
        self.config.read().limits.clone()
    }

    pub(crate) fn default_verbose(&self) -> bool {
        self.config.read().server.verbose
    }

    /// `INFO` payload for client `cid`
    pub(crate) fn server_info(&self, cid: ConnId) -> ServerInfo {
        let config = self.config.read();
        let addr = self.client_addr().unwrap_or(config.server.bind);
        ServerInfo {
            server_id: self.server_id.to_string(),
            server_name: self.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            max_payload: config.limits.max_payload,
            proto: CLIENT_PROTO,
            client_id: cid,
        }
    }

    /// Stop accepting, close routes and clients
    pub fn shutdown(&self) {
        info!("Shutting down server {}", self.server_id);
        if let Some(coordinator) = self.coordinator.get() {
            coordinator.shutdown();
        }
        self.clients.close_all();
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
