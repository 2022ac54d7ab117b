//! Configuration structures for port-relay.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Server binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address every local port is bound on.
    #[serde(default = "default_host")]
    pub host: String,

    /// Path of the route file (`alias=localPort->remoteHost:remotePort` lines).
    #[serde(default = "default_routes")]
    pub routes: PathBuf,
}

impl ServerConfig {
    /// Parse the bind host into an IP address.
    pub fn bind_ip(&self) -> Result<IpAddr> {
        self.host
            .parse()
            .map_err(|_| Error::Config(format!("invalid server.host: {}", self.host)))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            routes: default_routes(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_routes() -> PathBuf {
    PathBuf::from("config.properties")
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional).
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
