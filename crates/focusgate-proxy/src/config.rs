//! Engine and session configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::DEFAULT_PROXY_PORT;

/// Default timeout for upstream connects, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Largest first request head accepted from a client.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 64 * 1024;

/// Proxy engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Address to bind the listener to.
    pub host: IpAddr,
    /// First port to try. Incremented while the port is in use.
    pub port: u16,
    /// Upstream connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Maximum size of the first request head on a connection.
    pub max_head_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PROXY_PORT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the port (uses the configured host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the listen host.
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Sets the upstream connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Sets the maximum first request head size.
    pub fn with_max_head_bytes(mut self, max: usize) -> Self {
        self.max_head_bytes = max;
        self
    }

    /// Returns the address the listener starts binding at.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Returns the upstream connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Checks the values that would otherwise fail late.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 {
            return Err(ProxyError::Config(
                "connect_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.max_head_bytes < 1024 {
            return Err(ProxyError::Config(format!(
                "max_head_bytes must be at least 1024, got {}",
                self.max_head_bytes
            )));
        }
        Ok(())
    }
}

/// Session configuration as loaded by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Engine settings.
    pub engine: EngineConfig,
    /// Whether to point the OS proxy settings at the engine.
    pub system_proxy: bool,
    /// Sites blocked when none are given explicitly.
    pub sites: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            system_proxy: true,
            sites: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// Missing fields fall back to their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.engine.validate()?;
        Ok(config)
    }
}
