//! Configuration structures.
//!
//! Configuration is loaded from a TOML file:
//!
//! ```toml
//! [server]
//! backends = ["www"]
//! model = "prefork"
//! allow_root = false
//!
//! [log]
//! type = "file"
//! path = "/var/log/forkd.log"
//!
//! [backend.www]
//! type = "http"
//! addr = "0.0.0.0:8080"
//! max_children = 16
//! start_children = 4
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::log::{Level, LogKind};
use crate::types::{Error, Result};

/// Maximum number of backends a single server may host.
pub const MAX_BACKENDS: usize = 8;

/// Global server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server-wide settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Centralized log device (optional).
    #[serde(default)]
    pub log: Option<LogConfig>,

    /// Backend sections keyed by name.
    #[serde(default, rename = "backend")]
    pub backends: BTreeMap<String, BackendConfig>,
}

/// Server-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Names of the backend sections to start, in order.
    pub backends: Vec<String>,

    /// Default process model for backends that do not set one.
    pub model: Option<String>,

    /// Directory to chroot into after binding.
    pub chroot: Option<PathBuf>,

    /// Chroot into a fresh, empty, execute-only directory created under
    /// `chroot` and removed once entered.
    pub blind_chroot: bool,

    /// User id to drop to after binding.
    pub uid: Option<u32>,

    /// Group id to drop to after binding.
    pub gid: Option<u32>,

    /// Allow running with root ids after the privilege drop.
    pub allow_root: bool,

    /// Time children get between SIGTERM and SIGKILL at shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            model: None,
            chroot: None,
            blind_chroot: false,
            uid: None,
            gid: None,
            allow_root: false,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Log device configuration (server-wide or per backend).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Device type.
    #[serde(rename = "type")]
    pub kind: LogKind,

    /// Lines below this severity are discarded.
    #[serde(default = "default_threshold")]
    pub threshold: Level,

    /// Maximum number of lines kept by a memory log.
    #[serde(default = "default_log_limit")]
    pub limit: usize,

    /// Output path of a file log.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// How often buffered devices are flushed by the parent.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl LogConfig {
    pub fn memory(limit: usize) -> Self {
        Self {
            kind: LogKind::Memory,
            threshold: default_threshold(),
            limit,
            path: None,
            flush_interval: default_flush_interval(),
        }
    }
}

/// What to do with a fork-per-connection request when the child ceiling is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Overflow {
    /// Close the connection without serving it.
    #[default]
    Reject,
    /// Serve the connection in the parent process.
    Iterative,
}

/// Per-backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Protocol prototype name (e.g. "http").
    #[serde(rename = "type")]
    pub proto: String,

    /// Listening address, `host:port`.
    pub addr: String,

    /// Process model; inherits the server default when unset.
    #[serde(default)]
    pub model: Option<String>,

    /// Listen backlog.
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// Ceiling on concurrently tracked children for this backend.
    #[serde(default = "default_max_children")]
    pub max_children: usize,

    /// Steady-state pool size in pre-fork mode.
    #[serde(default = "default_start_children")]
    pub start_children: usize,

    /// Connections a pre-fork worker serves before it is replaced.
    #[serde(default = "default_max_requests_per_child")]
    pub max_requests_per_child: usize,

    /// Fork-per-connection behaviour at the child ceiling.
    #[serde(default)]
    pub overflow: Overflow,

    /// A pre-fork worker asks for a replacement when one connection takes
    /// longer than this. Zero disables.
    #[serde(default = "default_slow_request", with = "humantime_serde")]
    pub slow_request: Duration,

    /// Response body of the `http` prototype.
    #[serde(default)]
    pub body: Option<String>,

    /// Per-backend log device.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

impl BackendConfig {
    /// Minimal configuration for `proto` listening on `addr`.
    pub fn new(proto: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            proto: proto.into(),
            addr: addr.into(),
            model: None,
            backlog: default_backlog(),
            max_children: default_max_children(),
            start_children: default_start_children(),
            max_requests_per_child: default_max_requests_per_child(),
            overflow: Overflow::default(),
            slow_request: default_slow_request(),
            body: None,
            log: None,
        }
    }
}

fn default_threshold() -> Level {
    Level::Debug
}

fn default_log_limit() -> usize {
    250
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_children() -> usize {
    8
}

fn default_start_children() -> usize {
    2
}

fn default_max_requests_per_child() -> usize {
    100
}

fn default_slow_request() -> Duration {
    Duration::from_secs(1)
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.server.backends.is_empty() {
            return Err(Error::config("server.backends lists no backend"));
        }
        if self.server.backends.len() > MAX_BACKENDS {
            return Err(Error::config(format!(
                "{} backends configured, at most {} supported",
                self.server.backends.len(),
                MAX_BACKENDS
            )));
        }

        if self.server.blind_chroot && self.server.chroot.is_none() {
            return Err(Error::config("server.blind_chroot requires server.chroot"));
        }

        for name in &self.server.backends {
            let be = self
                .backends
                .get(name)
                .ok_or_else(|| Error::config(format!("missing [backend.{}] configuration", name)))?;

            if be.max_children == 0 {
                return Err(Error::config(format!("backend {}: max_children must be > 0", name)));
            }
            if be.max_requests_per_child == 0 {
                return Err(Error::config(format!(
                    "backend {}: max_requests_per_child must be > 0",
                    name
                )));
            }
            if be.start_children > be.max_children {
                return Err(Error::config(format!(
                    "backend {}: start_children ({}) exceeds max_children ({})",
                    name, be.start_children, be.max_children
                )));
            }
            if be.backlog <= 0 {
                return Err(Error::config(format!("backend {}: backlog must be > 0", name)));
            }
            if let Some(log) = &be.log {
                log.validate()?;
            }
        }

        if let Some(log) = &self.log {
            log.validate()?;
        }

        Ok(())
    }

    /// Backend sections in the order `server.backends` lists them.
    pub fn backend_sections(&self) -> impl Iterator<Item = (&str, &BackendConfig)> {
        self.server
            .backends
            .iter()
            .filter_map(|name| self.backends.get(name).map(|be| (name.as_str(), be)))
    }
}

impl LogConfig {
    fn validate(&self) -> Result<()> {
        if self.kind == LogKind::File && self.path.is_none() {
            return Err(Error::config("file log requires a path"));
        }
        if self.kind == LogKind::Memory && self.limit == 0 {
            return Err(Error::config("memory log limit must be > 0"));
        }
        Ok(())
    }
}
