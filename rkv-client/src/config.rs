//! # Configuration
//!
//! Purpose: Describe nodes and clusters as plain data that can be built in
//! code or loaded from JSON.
//!
//! ## Design Principles
//! 1. **Defaults Everywhere**: Every field has a default, so a config file
//!    only lists what it changes.
//! 2. **Milliseconds On The Wire**: Durations are stored as `*_ms` integers
//!    and exposed as `Duration` through accessors.
//! 3. **Validate Once**: `validate` runs when a node or cluster is built,
//!    never on the hot path.
//!
//! ```json
//! {
//!   "nodes": [
//!     { "address": "10.0.0.1:8087", "max_connections": 32 },
//!     { "address": "10.0.0.2" }
//!   ],
//!   "execution_attempts": 3,
//!   "queue_capacity": 128
//! }
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rkv_common::DEFAULT_MAX_FRAME_LEN;

use crate::error::{ClientError, ClientResult};
use crate::tls::TlsSettings;

/// Port used when an address omits one.
pub const DEFAULT_PORT: u16 = 8087;

/// Host and port of one server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerAddress {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for ServerAddress {
    type Err = ClientError;

    /// Parses `host`, `host:port` or `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ClientError::InvalidArgument("empty server address".into()));
        }

        let invalid = || ClientError::InvalidArgument(format!("invalid server address: {s}"));

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            return Ok(ServerAddress::new(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                if host.is_empty() {
                    return Err(invalid());
                }
                let port = port.parse().map_err(|_| invalid())?;
                Ok(ServerAddress::new(host, port))
            }
            // Bare IPv6 literal without brackets.
            Some(_) => Ok(ServerAddress::new(s, DEFAULT_PORT)),
            None => Ok(ServerAddress::new(s, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// How a node in `HEALTH_CHECKING` probes its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheck {
    /// A successful TCP (and TLS, if configured) connect is enough.
    #[default]
    Connect,
    /// Connect, then require a ping reply.
    Ping,
}

/// Per-node settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// `host[:port]` of the server.
    pub address: String,
    /// Connections opened at start and kept through idle eviction.
    pub min_connections: usize,
    /// Hard ceiling on open connections (idle + in use).
    pub max_connections: usize,
    /// Idle connections above the minimum are closed after this long.
    pub idle_timeout_ms: u64,
    /// Upper bound on a TCP connect plus TLS handshake.
    pub connect_timeout_ms: u64,
    /// Probe used while the node is unhealthy.
    pub health_check: HealthCheck,
    /// Delay before the first probe.
    pub health_check_base_ms: u64,
    /// Ceiling for the probe delay.
    pub health_check_max_ms: u64,
    /// Growth factor applied per consecutive failure.
    pub health_check_multiplier: f64,
    /// How long `stop` waits for in-flight commands.
    pub shutdown_timeout_ms: u64,
    /// Largest frame accepted from the server.
    pub max_frame_len: usize,
    /// TLS upgrade and optional authentication; set in code, never from JSON.
    #[serde(skip)]
    pub tls: Option<TlsSettings>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            min_connections: 1,
            max_connections: 16,
            idle_timeout_ms: 10_000,
            connect_timeout_ms: 3_000,
            health_check: HealthCheck::Connect,
            health_check_base_ms: 100,
            health_check_max_ms: 10_000,
            health_check_multiplier: 2.0,
            shutdown_timeout_ms: 5_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            tls: None,
        }
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("address", &self.address)
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("health_check", &self.health_check)
            .field("health_check_base_ms", &self.health_check_base_ms)
            .field("health_check_max_ms", &self.health_check_max_ms)
            .field("health_check_multiplier", &self.health_check_multiplier)
            .field("shutdown_timeout_ms", &self.shutdown_timeout_ms)
            .field("max_frame_len", &self.max_frame_len)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl NodeConfig {
    /// Default settings for `address`.
    pub fn new(address: impl Into<String>) -> Self {
        NodeConfig {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_connections(mut self, min: usize, max: usize) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }

    pub fn with_health_check(mut self, check: HealthCheck) -> Self {
        self.health_check = check;
        self
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Delay before the next health probe after `failures` consecutive
    /// failures: `base * multiplier^(failures - 1)`, capped at the max.
    pub fn health_check_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(64) as i32;
        let delay_ms =
            (self.health_check_base_ms as f64) * self.health_check_multiplier.powi(exponent);
        let capped = delay_ms.min(self.health_check_max_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Parses the configured address.
    pub fn server_address(&self) -> ClientResult<ServerAddress> {
        self.address.parse()
    }

    /// Checks limits and the address.
    pub fn validate(&self) -> ClientResult<()> {
        self.server_address()?;
        if self.max_connections == 0 {
            return Err(ClientError::InvalidArgument(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(ClientError::InvalidArgument(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if !(self.health_check_multiplier >= 1.0) {
            return Err(ClientError::InvalidArgument(
                "health_check_multiplier must be >= 1.0".into(),
            ));
        }
        if self.max_frame_len < 1 {
            return Err(ClientError::InvalidArgument(
                "max_frame_len must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Cluster-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    /// Attempts granted to a command that does not set its own.
    #[serde(alias = "max_retries")]
    pub execution_attempts: u32,
    /// Commands parked while every node is busy; 0 disables queueing.
    pub queue_capacity: usize,
    /// How often parked commands are offered to the nodes again.
    pub queue_submit_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            nodes: Vec::new(),
            execution_attempts: 3,
            queue_capacity: 0,
            queue_submit_interval_ms: 500,
        }
    }
}

impl ClusterConfig {
    /// Loads a cluster description from JSON.
    pub fn from_json_str(json: &str) -> ClientResult<Self> {
        let config: ClusterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn queue_submit_interval(&self) -> Duration {
        Duration::from_millis(self.queue_submit_interval_ms.max(1))
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.execution_attempts == 0 {
            return Err(ClientError::InvalidArgument(
                "execution_attempts must be at least 1".into(),
            ));
        }
        for node in &self.nodes {
            node.validate()?;
        }
        Ok(())
    }
}
