//! Fleet configuration
//!
//! Read once at startup from a JSON document:
//!
//! ```json
//! {
//!   "clients": {
//!     "alpha": {
//!       "display_name": "Alpha",
//!       "version": "1.2.0",
//!       "transport": "http",
//!       "target": "http://localhost:9000/mcp",
//!       "capabilities": { "roots": { "listChanged": true }, "experimental": {} },
//!       "options": { "headers": { "X-Team": "core" }, "timeout_secs": 30 }
//!     }
//!   },
//!   "servers": {
//!     "local": { "display_name": "Local", "transport": "socket",
//!                "options": { "host": "127.0.0.1", "port": 7010, "max_peers": 4 } }
//!   },
//!   "monitor": { "interval_secs": 30, "healthy_threshold": 0.8 }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityMap;
use crate::error::ConfigError;
use crate::transport::TransportKind;

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Retry policy for opening a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 500,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.base_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.round() as u64)
    }
}

/// Per-transport options. Fields that do not apply to a kind are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Stdio: extra arguments (the target holds the command)
    pub args: Vec<String>,
    /// Stdio: environment overrides for the child process
    pub env: HashMap<String, String>,
    /// HTTP: extra request headers
    pub headers: HashMap<String, String>,
    /// Hosting: bind host
    pub host: Option<String>,
    /// Hosting: bind port
    pub port: Option<u16>,
    /// Socket hosting: max concurrent peers
    pub max_peers: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub retry: RetryPolicy,
}

impl TransportOptions {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// `host:port` to bind when hosting.
    pub fn bind_address(&self) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("127.0.0.1"),
            self.port.unwrap_or(0)
        )
    }
}

/// Immutable configuration of one named instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Falls back to the instance name when empty
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub capabilities: CapabilityMap,
    #[serde(default)]
    pub transport: Option<TransportKind>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub options: TransportOptions,
}

impl ConnectionConfig {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            version: default_version(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityMap) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    /// Transport kind used for `target`: explicit hint, then configured kind,
    /// then inference from the target scheme.
    pub fn resolve_transport(&self, target: &str, hint: Option<TransportKind>) -> TransportKind {
        hint.or(self.transport)
            .unwrap_or_else(|| TransportKind::infer(target))
    }

    /// Kind shown in listings before any connection was made.
    pub fn nominal_transport(&self) -> Option<TransportKind> {
        self.transport
            .or_else(|| self.target.as_deref().map(TransportKind::infer))
    }

    /// Copy of this configuration with `overrides` applied.
    pub fn apply(&self, overrides: &ConfigOverride) -> ConnectionConfig {
        let mut config = self.clone();
        if let Some(display_name) = &overrides.display_name {
            config.display_name = display_name.clone();
        }
        if let Some(version) = &overrides.version {
            config.version = version.clone();
        }
        if let Some(capabilities) = &overrides.capabilities {
            config.capabilities = config.capabilities.merged(capabilities);
        }
        if overrides.transport.is_some() {
            config.transport = overrides.transport;
        }
        if let Some(target) = &overrides.target {
            config.target = Some(target.clone());
        }
        if let Some(options) = &overrides.options {
            config.options = options.clone();
        }
        config
    }
}

/// Partial configuration merged onto a [`ConnectionConfig`] by `create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverride {
    pub display_name: Option<String>,
    pub version: Option<String>,
    /// Merged entry-by-entry onto the configured map
    pub capabilities: Option<CapabilityMap>,
    pub transport: Option<TransportKind>,
    pub target: Option<String>,
    /// Replaces the configured options wholesale
    pub options: Option<TransportOptions>,
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub backoff_factor: f64,
    pub max_interval_secs: u64,
    /// Ping records kept per connection
    pub history_cap: usize,
    pub healthy_threshold: f64,
    pub lookback_minutes: u64,
    /// Records older than this are pruned by cleanup
    pub retention_minutes: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            backoff_factor: 2.0,
            max_interval_secs: 300,
            history_cap: 100,
            healthy_threshold: 0.8,
            lookback_minutes: 5,
            retention_minutes: 60,
        }
    }
}

impl MonitorConfig {
    /// Base ping interval, never shorter than one second.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_minutes.saturating_mul(60))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_minutes.saturating_mul(60))
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub servers: BTreeMap<String, ConnectionConfig>,
    pub clients: BTreeMap<String, ConnectionConfig>,
    pub monitor: MonitorConfig,
}

impl FleetConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }
}
