//! Runtime configuration.
//!
//! Values come from an optional YAML file named by `FCGI_CONFIG`, then from
//! environment overrides:
//!
//! | Variable          | Field                           |
//! |-------------------|---------------------------------|
//! | `LISTEN`          | `listen_addr`                   |
//! | `FCGI_MAX_CONNS`  | `server.max_connections`        |
//! | `FCGI_MAX_REQS`   | `server.max_requests`           |
//! | `FCGI_MULTIPLEX`  | `server.multiplex_connections`  |

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::buffer::DEFAULT_BODY_REGION_SIZE;
use crate::server::ServerSettings;

pub const CONFIG_PATH_VAR: &str = "FCGI_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `host:port`, `tcp://host:port` or `unix:///path`.
    pub listen_addr: String,
    pub server: ServerConfig,
    pub buffers: BufferConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub max_connections: usize,
    pub max_requests: usize,
    pub multiplex_connections: bool,
    /// Seconds without a record before a connection is dropped.
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub body_region_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9000".to_string(),
            server: ServerConfig::default(),
            buffers: BufferConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_requests: 1024,
            multiplex_connections: false,
            idle_timeout_secs: None,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            body_region_size: DEFAULT_BODY_REGION_SIZE,
        }
    }
}

impl Config {
    /// Load the file named by `FCGI_CONFIG` (if set) and apply environment
    /// overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        cfg.apply_overrides(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("LISTEN") {
            self.listen_addr = addr;
        }
        if let Some(value) = lookup("FCGI_MAX_CONNS") {
            self.server.max_connections = parse_count("FCGI_MAX_CONNS", &value)?;
        }
        if let Some(value) = lookup("FCGI_MAX_REQS") {
            self.server.max_requests = parse_count("FCGI_MAX_REQS", &value)?;
        }
        if let Some(value) = lookup("FCGI_MULTIPLEX") {
            self.server.multiplex_connections = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => bail!("FCGI_MULTIPLEX must be a boolean, got {value:?}"),
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen_addr.trim().is_empty() {
            bail!("listen_addr must not be empty");
        }
        if self.server.max_connections < 1 {
            bail!("server.max_connections must be at least 1");
        }
        if self.server.max_requests < 1 {
            bail!("server.max_requests must be at least 1");
        }
        if self.server.idle_timeout_secs == Some(0) {
            bail!("server.idle_timeout_secs must be positive when set");
        }
        if self.buffers.body_region_size < 1 {
            bail!("buffers.body_region_size must be at least 1");
        }
        Ok(())
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            max_connections: self.server.max_connections,
            max_requests: self.server.max_requests,
            multiplex_connections: self.server.multiplex_connections,
            idle_timeout: self.server.idle_timeout_secs.map(Duration::from_secs),
            body_region_size: self.buffers.body_region_size,
        }
    }
}

fn parse_count(name: &str, value: &str) -> anyhow::Result<usize> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{name} must be a positive integer, got {value:?}"))
}
