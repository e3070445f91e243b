//! Proxy configuration loaded from YAML or built programmatically.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("tunnel_backlog must be at least 1")]
    ZeroBacklog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the plain proxy listener binds to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Path to the CA certificate (PEM).
    pub ca_cert: PathBuf,

    /// Path to the CA private key (PEM).
    pub ca_key: PathBuf,

    /// Mirror relayed JSON response bodies to stdout.
    #[serde(default)]
    pub tee_json: bool,

    /// How many acknowledged tunnels may queue awaiting TLS negotiation
    /// before CONNECT handling blocks.
    #[serde(default = "default_tunnel_backlog")]
    pub tunnel_backlog: usize,
}

fn default_listen() -> SocketAddr {
    ([127, 0, 0, 1], 8888).into()
}

fn default_tunnel_backlog() -> usize {
    1
}

impl ProxyConfig {
    /// Creates a config with default settings for the given CA material.
    pub fn new(ca_cert: PathBuf, ca_key: PathBuf) -> Self {
        Self {
            listen: default_listen(),
            ca_cert,
            ca_key,
            tee_json: false,
            tunnel_backlog: default_tunnel_backlog(),
        }
    }

    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        if config.tunnel_backlog == 0 {
            return Err(ConfigError::ZeroBacklog);
        }
        Ok(config)
    }
}
