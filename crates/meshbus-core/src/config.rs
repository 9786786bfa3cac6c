//! Daemon configuration.
//!
//! Loaded from a TOML file; command-line options override file settings in
//! the binary. Durations accept humantime strings ("20s", "500ms").

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration load failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML or violates the schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
}

/// Which standard bus this daemon instance hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusType {
    /// Per-login-session bus.
    #[default]
    Session,
    /// System-wide bus.
    System,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Transport listen specs, e.g. `tcp:addr=0.0.0.0,port=9955` or
    /// `unix:path=/run/meshbus.sock`.
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Bus flavour.
    #[serde(default, rename = "type")]
    pub bus_type: BusType,

    /// Drop root privileges to this user after startup.
    #[serde(default)]
    pub user: Option<String>,

    /// Fork into the background after startup.
    #[serde(default)]
    pub fork: bool,

    /// Write the daemon pid here at startup; unlinked at shutdown.
    #[serde(default)]
    pub pidfile: Option<PathBuf>,

    /// Space-separated list of permitted authentication mechanisms. Empty
    /// means all registered mechanisms are permitted.
    #[serde(default)]
    pub auth_mechanisms: String,

    /// Operational limits.
    #[serde(default)]
    pub limits: Limits,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bus_type: BusType::default(),
            user: None,
            fork: false,
            pidfile: None,
            auth_mechanisms: String::new(),
            limits: Limits::default(),
        }
    }
}

/// Operational limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Hard deadline for the endpoint handshake.
    #[serde(default = "default_auth_timeout", with = "humantime_serde")]
    pub auth_timeout: Duration,

    /// Per-endpoint outbound queue depth.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Consecutive outbound overflows after which a bus-to-bus endpoint is
    /// torn down.
    #[serde(default = "default_b2b_overflow_limit")]
    pub b2b_overflow_limit: u32,

    /// Deadline for draining per-endpoint queues at shutdown.
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// TTL announced with name advertisements.
    #[serde(default = "default_advertise_ttl", with = "humantime_serde")]
    pub advertise_ttl: Duration,
}

const fn default_auth_timeout() -> Duration {
    Duration::from_secs(20)
}

const fn default_queue_depth() -> usize {
    64
}

const fn default_b2b_overflow_limit() -> u32 {
    8
}

const fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_advertise_ttl() -> Duration {
    Duration::from_secs(120)
}

fn default_listen() -> Vec<String> {
    vec!["unix:path=/tmp/meshbus-session.sock".to_string()]
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            auth_timeout: default_auth_timeout(),
            queue_depth: default_queue_depth(),
            b2b_overflow_limit: default_b2b_overflow_limit(),
            drain_timeout: default_drain_timeout(),
            advertise_ttl: default_advertise_ttl(),
        }
    }
}

impl BusConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    /// Standard configuration path for the given bus type.
    #[must_use]
    pub fn standard_path(bus_type: BusType) -> PathBuf {
        match bus_type {
            BusType::Session => PathBuf::from("/etc/meshbus/session.conf"),
            BusType::System => PathBuf::from("/etc/meshbus/system.conf"),
        }
    }
}
