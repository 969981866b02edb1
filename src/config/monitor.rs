//! Monitoring endpoint configuration

use serde::Deserialize;
use std::net::SocketAddr;

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Whether the HTTP monitoring endpoint is enabled
    pub enabled: bool,
    /// HTTP bind address for `/varz`, `/connz`, `/routez`, `/subsz`, `/metrics`
    pub bind: SocketAddr,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([127, 0, 0, 1], 8222)),
        }
    }
}
