//! Connection state owned by each instance, and its read-only snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::CapabilityMap;
use crate::transport::TransportKind;

/// Which side of the protocol an instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRole {
    /// Hosted server instance; `connect` starts serving
    Server,
    /// Client instance; `connect` reaches out to a remote peer
    Client,
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRole::Server => f.write_str("server"),
            InstanceRole::Client => f.write_str("client"),
        }
    }
}

/// Lifecycle phase of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// Mutable state of one instance.
///
/// `connected` implies `transport` and `connected_at` are set. Counters only
/// grow during a connection and are reset by the next successful connect.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub phase: Phase,
    pub connected: bool,
    pub transport: Option<TransportKind>,
    pub target: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub local_capabilities: CapabilityMap,
    pub peer_capabilities: CapabilityMap,
    pub request_count: u64,
    pub error_count: u64,
    pub last_response_time_ms: Option<f64>,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Bumped on every successful connect; failures of calls issued on an
    /// older connection never demote a newer one.
    pub generation: u64,
}

impl ConnectionState {
    pub fn begin_connect(&mut self) {
        self.phase = Phase::Connecting;
    }

    /// Flip to connected for a fresh connection and return its generation.
    pub fn mark_connected(
        &mut self,
        transport: TransportKind,
        target: String,
        local_capabilities: CapabilityMap,
        elapsed_ms: f64,
    ) -> u64 {
        self.phase = Phase::Connected;
        self.connected = true;
        self.transport = Some(transport);
        self.target = Some(target);
        self.connected_at = Some(Utc::now());
        self.local_capabilities = local_capabilities;
        self.peer_capabilities = CapabilityMap::default();
        self.request_count = 0;
        self.error_count = 0;
        self.last_response_time_ms = Some(elapsed_ms);
        self.last_error = None;
        self.generation += 1;
        self.generation
    }

    /// A connect attempt failed; the instance ends up disconnected.
    pub fn mark_connect_failed(&mut self, error: String) {
        self.error_count += 1;
        self.last_error = Some(error);
        self.clear_connection();
    }

    /// Counters are preserved.
    pub fn mark_disconnected(&mut self) {
        self.clear_connection();
    }

    pub fn record_success(&mut self, elapsed_ms: f64) {
        self.request_count += 1;
        self.last_response_time_ms = Some(elapsed_ms);
    }

    pub fn record_error(&mut self, error: String) {
        self.error_count += 1;
        self.last_error = Some(error);
    }

    fn clear_connection(&mut self) {
        self.phase = Phase::Disconnected;
        self.connected = false;
        self.transport = None;
        self.target = None;
        self.connected_at = None;
        self.peer_capabilities = CapabilityMap::default();
    }
}

/// Serializable status snapshot of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub name: String,
    pub role: InstanceRole,
    pub display_name: String,
    pub version: String,
    pub phase: Phase,
    pub connected: bool,
    pub transport: Option<TransportKind>,
    pub target: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    /// Seconds since `connected_at`
    pub uptime_secs: Option<i64>,
    pub local_capabilities: CapabilityMap,
    pub peer_capabilities: CapabilityMap,
    pub request_count: u64,
    pub error_count: u64,
    pub last_response_time_ms: Option<f64>,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl InstanceStatus {
    pub fn from_state(
        name: &str,
        role: InstanceRole,
        display_name: &str,
        version: &str,
        state: &ConnectionState,
    ) -> Self {
        Self {
            name: name.to_string(),
            role,
            display_name: display_name.to_string(),
            version: version.to_string(),
            phase: state.phase,
            connected: state.connected,
            transport: state.transport,
            target: state.target.clone(),
            connected_at: state.connected_at,
            uptime_secs: state
                .connected_at
                .map(|at| (Utc::now() - at).num_seconds()),
            local_capabilities: state.local_capabilities.clone(),
            peer_capabilities: state.peer_capabilities.clone(),
            request_count: state.request_count,
            error_count: state.error_count,
            last_response_time_ms: state.last_response_time_ms,
            last_ping_at: state.last_ping_at,
            last_error: state.last_error.clone(),
        }
    }
}

/// One row of a registry listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    /// `connected` for clients, `running` for servers
    pub connected: bool,
    pub transport: Option<TransportKind>,
    pub display_name: String,
    pub version: String,
    /// False when the registry has not built the instance yet
    pub instantiated: bool,
    pub registered_at: Option<DateTime<Utc>>,
}
