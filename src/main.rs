//! meshmq - subject-based publish/subscribe broker
//!
//! Usage:
//!   meshmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Configuration file path
//!   -b, --bind <ADDR>         Client bind address (default: 0.0.0.0:4222)
//!   --cluster <ADDR>          Accept routes on this address (enables clustering)
//!   -r, --routes <URL,...>    Routes to solicit
//!   -n, --name <NAME>         Server name
//!   -l, --log-level           Log level (error, warn, info, debug, trace)
//!   -h, --help                Print help
//!
//! On Unix, SIGHUP reloads the configuration file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use meshmq::config::{Config, RouteUrl};
use meshmq::Server;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// meshmq - subject-based publish/subscribe broker
#[derive(Parser, Debug)]
#[command(name = "meshmq")]
#[command(author = "MeshMQ Contributors")]
#[command(version)]
#[command(about = "Subject-based publish/subscribe broker with full-mesh clustering")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Client bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Route listen address; enables clustering
    #[arg(long)]
    cluster: Option<SocketAddr>,

    /// Routes to solicit, comma separated
    #[arg(short, long, value_delimiter = ',', value_parser = RouteUrl::parse)]
    routes: Vec<RouteUrl>,

    /// Server name
    #[arg(short, long)]
    name: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let mut config = match args.config {
        Some(ref path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref path) = args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let overrides = Overrides {
        bind: args.bind,
        cluster: args.cluster,
        routes: args.routes,
        name: args.name,
    };
    overrides.apply(&mut config);

    info!("Starting meshmq");
    info!("  Client address: {}", config.server.bind);
    info!("  Max connections: {}", config.limits.max_connections);
    info!("  Max payload: {} bytes", config.limits.max_payload);
    if config.cluster.enabled {
        info!(
            "  Cluster: enabled (listen={}, {} routes)",
            config.cluster.listen,
            config.cluster.routes.len()
        );
    } else {
        info!("  Cluster: disabled");
    }
    if config.monitor.enabled {
        info!("  Monitoring: enabled (http://{})", config.monitor.bind);
    } else {
        info!("  Monitoring: disabled");
    }

    let server = match Server::new(config, args.config.clone()) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Error initializing server: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = server.start().await {
        eprintln!("Error starting server: {}", e);
        std::process::exit(1);
    }

    #[cfg(unix)]
    if let Some(path) = args.config {
        spawn_reload_handler(server.clone(), path, overrides)?;
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    server.shutdown();

    Ok(())
}

/// Command line settings that take precedence over the configuration file
#[derive(Debug, Clone)]
struct Overrides {
    bind: Option<SocketAddr>,
    cluster: Option<SocketAddr>,
    routes: Vec<RouteUrl>,
    name: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(listen) = self.cluster {
            config.cluster.enabled = true;
            config.cluster.listen = listen;
        }
        if !self.routes.is_empty() {
            config.cluster.routes = self.routes.clone();
        }
        if self.name.is_some() {
            config.server.name = self.name.clone();
        }
    }
}

/// Reload the configuration file on SIGHUP.
///
/// Command line overrides are applied again so that they survive a reload.
#[cfg(unix)]
fn spawn_reload_handler(
    server: Arc<Server>,
    path: PathBuf,
    overrides: Overrides,
) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("Received SIGHUP, reloading {:?}", path);
            let mut config = match Config::load_existing(&path) {
                Ok(config) => config,
                Err(e) => {
                    error!("Configuration reload failed: {}", e);
                    continue;
                }
            };
            overrides.apply(&mut config);
            if let Err(e) = server.on_config_reload(config) {
                error!("Configuration reload failed: {}", e);
            }
        }
    });
    Ok(())
}
