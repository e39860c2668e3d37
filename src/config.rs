//! Server configuration: TOML file values, overridden by command-line flags.

use crate::confine::Jail;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Loopback by default; a hidden service forwards to it.
    pub bind: IpAddr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: Option<PathBuf>,
    /// 0 disables the limit.
    pub max_upload_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_upload_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: crate::session::DEFAULT_SESSION_TTL.as_secs(),
            sweep_interval_secs: crate::session::DEFAULT_SWEEP_INTERVAL.as_secs(),
        }
    }
}

/// Values given on the command line; `None` keeps the file/default value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub root: Option<PathBuf>,
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub session_ttl_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub max_upload_bytes: Option<u64>,
}

impl Config {
    /// Reads a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;
        Self::parse(&raw)
            .with_context(|| format!("Failed to parse configuration file: {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(root) = overrides.root {
            self.storage.root = Some(root);
        }
        if let Some(bind) = overrides.bind {
            self.server.bind = bind;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(ttl) = overrides.session_ttl_secs {
            self.sessions.ttl_secs = ttl;
        }
        if let Some(every) = overrides.sweep_interval_secs {
            self.sessions.sweep_interval_secs = every;
        }
        if let Some(limit) = overrides.max_upload_bytes {
            self.storage.max_upload_bytes = limit;
        }
    }

    /// Checks the configuration and opens the jail on the configured root.
    pub fn validate(&self) -> Result<Jail> {
        let Some(root) = self.storage.root.as_deref() else {
            bail!("no root folder configured (use -f <folder> or [storage].root)");
        };
        if self.sessions.ttl_secs == 0 {
            bail!("session ttl must be greater than zero");
        }
        if self.sessions.sweep_interval_secs == 0 {
            bail!("sweep interval must be greater than zero");
        }
        Jail::new(root).with_context(|| format!("Invalid root path: {}", root.display()))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind, self.server.port)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.sessions.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.sweep_interval_secs)
    }

    pub fn max_upload_bytes(&self) -> Option<usize> {
        match self.storage.max_upload_bytes {
            0 => None,
            n => Some(usize::try_from(n).unwrap_or(usize::MAX)),
        }
    }
}
