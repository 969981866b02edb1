//! Configuration Module
//!
//! Provides TOML-based configuration for meshmq with support for:
//! - Server settings (identity, client bind address)
//! - Connection and payload limits
//! - Cluster routes and route timers
//! - Monitoring endpoint
//! - Environment variable overrides (MESHMQ__* prefix)
//!
//! A running server can be reloaded with a new configuration; see
//! [`Config::check_reloadable`] for what a reload may change.

use std::net::SocketAddr;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

// Re-export cluster config types
pub use cluster::{ClusterConfig, RouteUrl};

// Re-export monitor config types
pub use monitor::MonitorConfig;

mod cluster;
mod monitor;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Reload error types
#[derive(Debug)]
pub enum ReloadError {
    /// The new configuration could not be loaded
    Config(ConfigError),
    /// The new configuration changes a setting that requires a restart
    NotReloadable(&'static str),
    /// The server has no configuration file to reload from
    NoConfigFile,
}

impl std::fmt::Display for ReloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReloadError::Config(e) => write!(f, "{}", e),
            ReloadError::NotReloadable(field) => {
                write!(f, "config reload not supported for '{}'", field)
            }
            ReloadError::NoConfigFile => write!(f, "no configuration file to reload"),
        }
    }
}

impl std::error::Error for ReloadError {}

impl From<ConfigError> for ReloadError {
    fn from(e: ConfigError) -> Self {
        ReloadError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// Cluster configuration
    pub cluster: ClusterConfig,
    /// Monitoring configuration
    pub monitor: MonitorConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server identity (generated if not set); must be unique in the cluster
    pub id: Option<String>,
    /// Human-readable server name (defaults to the identity)
    pub name: Option<String>,
    /// Client listener bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Acknowledge client operations with +OK unless the client opts out
    #[serde(default)]
    pub verbose: bool,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4222))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            bind: default_bind(),
            verbose: false,
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum message payload in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// Maximum number of client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Outbound bytes a client may have queued before it is dropped as a
    /// slow consumer (0 = unbounded)
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
}

fn default_max_payload() -> usize {
    1024 * 1024
}
fn default_max_connections() -> usize {
    65_536
}
fn default_max_pending_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload: default_max_payload(),
            max_connections: default_max_connections(),
            max_pending_bytes: default_max_pending_bytes(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file yields the defaults. Supports two forms of environment
    /// variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MESHMQ__` prefix with double underscores for nesting:
    ///    - `MESHMQ__SERVER__BIND=0.0.0.0:4223` overrides `server.bind`
    ///    - `MESHMQ__CLUSTER__ROUTES=a:6222,b:6222` overrides `cluster.routes`
    ///    - `MESHMQ__CLUSTER__ENABLED=true` overrides `cluster.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_inner(path.as_ref(), false)
    }

    /// Like [`Config::load`], but a missing file is an error.
    ///
    /// Used on reload so that a deleted file never resets a running server
    /// to defaults.
    pub fn load_existing<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_inner(path.as_ref(), true)
    }

    fn load_inner(path: &Path, require_file: bool) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:4222")?
            .set_default("server.verbose", false)?
            .set_default("limits.max_payload", 1024 * 1024)?
            .set_default("limits.max_connections", 65_536)?
            .set_default("limits.max_pending_bytes", 64 * 1024 * 1024)?
            .set_default("cluster.enabled", false)?
            .set_default("cluster.listen", "0.0.0.0:6222")?
            .set_default("cluster.connect_timeout", "2s")?
            .set_default("cluster.handshake_timeout", "2s")?
            .set_default("cluster.connect_retry_initial", "100ms")?
            .set_default("cluster.connect_retry_max", "5s")?
            .set_default("cluster.ping_interval", "30s")?
            .set_default("cluster.max_pings_out", 2)?
            .set_default("monitor.enabled", false)?
            .set_default("monitor.bind", "127.0.0.1:8222")?;

        // Load from file with env var substitution
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !require_file => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (MESHMQ__SERVER__BIND, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MESHMQ")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cluster.routes")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_payload == 0 {
            return Err(ConfigError::Validation(
                "limits.max_payload must be greater than zero".to_string(),
            ));
        }

        if let Some(ref id) = self.server.id {
            if id.is_empty() || id.chars().any(char::is_whitespace) {
                return Err(ConfigError::Validation(format!(
                    "server.id '{}' must be non-empty and contain no whitespace",
                    id
                )));
            }
        }

        self.cluster.validate().map_err(ConfigError::Validation)?;

        Ok(())
    }

    /// Check that `new` only differs from `self` in reloadable settings.
    ///
    /// Listener addresses, identity and cluster membership settings require a
    /// restart; routes, route timers and limits may change at runtime.
    pub fn check_reloadable(&self, new: &Config) -> Result<(), ReloadError> {
        if self.server.id != new.server.id {
            return Err(ReloadError::NotReloadable("server.id"));
        }
        if self.server.name != new.server.name {
            return Err(ReloadError::NotReloadable("server.name"));
        }
        if self.server.bind != new.server.bind {
            return Err(ReloadError::NotReloadable("server.bind"));
        }
        if self.cluster.enabled != new.cluster.enabled {
            return Err(ReloadError::NotReloadable("cluster.enabled"));
        }
        if self.cluster.name != new.cluster.name {
            return Err(ReloadError::NotReloadable("cluster.name"));
        }
        if self.cluster.listen != new.cluster.listen {
            return Err(ReloadError::NotReloadable("cluster.listen"));
        }
        if self.monitor.enabled != new.monitor.enabled || self.monitor.bind != new.monitor.bind {
            return Err(ReloadError::NotReloadable("monitor"));
        }
        Ok(())
    }
}
