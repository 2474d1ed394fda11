//! InstanceRegistry - named instances of one role
//!
//! The server-role registry is the Server Manager, the client-role registry is
//! the Client Manager. Instances are built lazily from configuration on first
//! request and cached; listing and status never force instantiation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mcpfleet_core::{
    CapabilityMap, ConfigOverride, ConnectionConfig, ConnectionState, Error, InstanceRole,
    InstanceStatus, InstanceSummary, Result, TransportKind, TransportOptions, TransportSet,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::instance::Instance;
use crate::safe_await::elapsed_ms;

/// Connect timeout for connection tests when none is given.
const TEST_CONNECTION_TIMEOUT_SECS: u64 = 10;

/// Per-name bookkeeping, kept even before the instance exists.
struct RegistryEntry {
    instance: Option<Arc<Instance>>,
    registered_at: DateTime<Utc>,
    last_target: Option<String>,
    last_transport: Option<TransportKind>,
    last_options: Option<TransportOptions>,
}

impl RegistryEntry {
    fn new() -> Self {
        Self {
            instance: None,
            registered_at: Utc::now(),
            last_target: None,
            last_transport: None,
            last_options: None,
        }
    }
}

/// Result of [`InstanceRegistry::test_connection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTestReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilityMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionTestReport {
    fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            transport: None,
            capabilities: None,
            response_time_ms: None,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of a bulk disconnect/stop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub disconnected: Vec<String>,
    pub failed: BTreeMap<String, String>,
}

/// Aggregate statistics of a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub role: InstanceRole,
    pub configured: usize,
    pub instantiated: usize,
    pub connected: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub instances: BTreeMap<String, InstanceStatus>,
}

pub struct InstanceRegistry {
    role: InstanceRole,
    configs: BTreeMap<String, ConnectionConfig>,
    transports: TransportSet,
    entries: DashMap<String, RegistryEntry>,
    /// Active connection markers, name → when it was connected
    active: DashMap<String, DateTime<Utc>>,
}

impl InstanceRegistry {
    pub fn new(
        role: InstanceRole,
        configs: BTreeMap<String, ConnectionConfig>,
        transports: TransportSet,
    ) -> Self {
        Self {
            role,
            configs,
            transports,
            entries: DashMap::new(),
            active: DashMap::new(),
        }
    }

    pub fn role(&self) -> InstanceRole {
        self.role
    }

    fn cached(&self, name: &str) -> Option<Arc<Instance>> {
        self.entries.get(name).and_then(|entry| entry.instance.clone())
    }

    /// Cached instance, or a new one built from configuration.
    pub fn get(&self, name: &str) -> Result<Arc<Instance>> {
        if let Some(instance) = self.cached(name) {
            return Ok(instance);
        }

        let config = self
            .configs
            .get(name)
            .ok_or_else(|| Error::ConfigurationNotFound(name.to_string()))?;

        let mut entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(RegistryEntry::new);
        if let Some(instance) = &entry.instance {
            return Ok(Arc::clone(instance));
        }

        let instance = Arc::new(Instance::new(
            name,
            self.role,
            config.clone(),
            self.transports.clone(),
        ));
        entry.instance = Some(Arc::clone(&instance));
        debug!(instance = %name, role = %self.role, "[Registry] Instance created");
        Ok(instance)
    }

    /// Build a fresh instance with `overrides` merged onto its configuration.
    ///
    /// The new instance replaces the cached one; a connected predecessor is
    /// disconnected first. Names without configuration start from defaults.
    pub async fn create(&self, name: &str, overrides: &ConfigOverride) -> Result<Arc<Instance>> {
        let base = self
            .configs
            .get(name)
            .cloned()
            .unwrap_or_else(|| ConnectionConfig::new(name));
        let instance = Arc::new(Instance::new(
            name,
            self.role,
            base.apply(overrides),
            self.transports.clone(),
        ));

        let previous = self
            .entries
            .entry(name.to_string())
            .or_insert_with(RegistryEntry::new)
            .instance
            .replace(Arc::clone(&instance));

        if let Some(previous) = previous {
            self.active.remove(name);
            if previous.is_connected() {
                if let Err(e) = previous.disconnect().await {
                    warn!(instance = %name, error = %e, "[Registry] Failed to disconnect replaced instance");
                }
            }
        }

        info!(instance = %name, role = %self.role, "[Registry] Instance created from overrides");
        Ok(instance)
    }

    /// True for configured or created names.
    pub fn exists(&self, name: &str) -> bool {
        self.configs.contains_key(name) || self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        for entry in self.entries.iter() {
            if !self.configs.contains_key(entry.key()) {
                names.push(entry.key().clone());
            }
        }
        names.sort();
        names
    }

    /// Summary of every known name. Never instantiates.
    pub fn list(&self) -> BTreeMap<String, InstanceSummary> {
        self.names()
            .into_iter()
            .map(|name| {
                let summary = self.summarize(&name);
                (name, summary)
            })
            .collect()
    }

    fn summarize(&self, name: &str) -> InstanceSummary {
        let config = self.configs.get(name);
        let entry = self.entries.get(name);
        let instance = entry.as_ref().and_then(|e| e.instance.clone());

        match instance {
            Some(instance) => {
                let state = instance.state();
                InstanceSummary {
                    connected: state.connected,
                    transport: state
                        .transport
                        .or_else(|| entry.as_ref().and_then(|e| e.last_transport))
                        .or_else(|| instance.config().nominal_transport()),
                    display_name: instance.config().display_name.clone(),
                    version: instance.config().version.clone(),
                    instantiated: true,
                    registered_at: entry.as_ref().map(|e| e.registered_at),
                }
            }
            None => InstanceSummary {
                connected: false,
                transport: entry
                    .as_ref()
                    .and_then(|e| e.last_transport)
                    .or_else(|| config.and_then(ConnectionConfig::nominal_transport)),
                display_name: config
                    .map(|c| c.display_name.clone())
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| name.to_string()),
                version: config.map(|c| c.version.clone()).unwrap_or_default(),
                instantiated: false,
                registered_at: entry.as_ref().map(|e| e.registered_at),
            },
        }
    }

    pub async fn connect(
        &self,
        name: &str,
        target: Option<&str>,
        transport_hint: Option<TransportKind>,
        options: Option<TransportOptions>,
    ) -> Result<()> {
        let instance = self.get(name)?;

        if let Some(mut entry) = self.entries.get_mut(name) {
            if target.is_some() {
                entry.last_target = target.map(str::to_string);
            }
            if transport_hint.is_some() {
                entry.last_transport = transport_hint;
            }
            if options.is_some() {
                entry.last_options = options.clone();
            }
        }

        instance.connect(target, transport_hint, options).await?;

        let state = instance.state();
        if let Some(mut entry) = self.entries.get_mut(name) {
            entry.last_target = state.target.clone();
            entry.last_transport = state.transport;
        }
        self.active.insert(name.to_string(), Utc::now());
        Ok(())
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        self.active.remove(name);
        match self.cached(name) {
            Some(instance) => instance.disconnect().await,
            None if self.exists(name) => Ok(()),
            None => Err(Error::ConfigurationNotFound(name.to_string())),
        }
    }

    /// Disconnect, then connect again with the last known target, transport
    /// and options (falling back to configuration).
    pub async fn reconnect(&self, name: &str) -> Result<()> {
        let instance = self.get(name)?;
        let (target, transport, options) = self
            .entries
            .get(name)
            .map(|e| (e.last_target.clone(), e.last_transport, e.last_options.clone()))
            .unwrap_or_default();

        if target.is_none()
            && instance.config().target.is_none()
            && self.role == InstanceRole::Client
        {
            return Err(Error::MissingTarget(name.to_string()));
        }

        if let Err(e) = self.disconnect(name).await {
            warn!(instance = %name, error = %e, "[Registry] Disconnect before reconnect failed");
        }
        info!(instance = %name, "[Registry] Reconnecting");
        self.connect(name, target.as_deref(), transport, options).await
    }

    /// Try `target` with a throwaway instance. The cache is never touched.
    pub async fn test_connection(
        &self,
        target: &str,
        transport_hint: Option<TransportKind>,
    ) -> ConnectionTestReport {
        let test_name = format!("connection-test-{}", Uuid::new_v4());
        let scratch = Instance::new(
            test_name.as_str(),
            self.role,
            ConnectionConfig::new("McpFleet connection test"),
            self.transports.clone(),
        );
        let options = TransportOptions {
            timeout_secs: Some(TEST_CONNECTION_TIMEOUT_SECS),
            ..Default::default()
        };

        let started = Instant::now();
        if let Err(e) = scratch.connect(Some(target), transport_hint, Some(options)).await {
            debug!(target = %target, error = %e, "[Registry] Connection test failed");
            return ConnectionTestReport::failed(e);
        }
        let response_time_ms = elapsed_ms(started);

        let state = scratch.state();
        if let Err(e) = scratch.disconnect().await {
            debug!(target = %target, error = %e, "[Registry] Failed to close test connection");
        }

        ConnectionTestReport {
            success: true,
            transport: state.transport,
            capabilities: Some(state.peer_capabilities),
            response_time_ms: Some(response_time_ms),
            error: None,
        }
    }

    fn instances(&self) -> Vec<Arc<Instance>> {
        self.entries
            .iter()
            .filter_map(|entry| entry.instance.clone())
            .collect()
    }

    /// Disconnect every connected instance. Failures are logged and collected.
    pub async fn disconnect_all(&self) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for instance in self.instances() {
            if !instance.is_connected() {
                continue;
            }
            let name = instance.name().to_string();
            self.active.remove(&name);
            match instance.disconnect().await {
                Ok(()) => outcome.disconnected.push(name),
                Err(e) => {
                    warn!(instance = %name, error = %e, "[Registry] Failed to disconnect");
                    outcome.failed.insert(name, e.to_string());
                }
            }
        }
        outcome.disconnected.sort();
        info!(
            role = %self.role,
            disconnected = outcome.disconnected.len(),
            failed = outcome.failed.len(),
            "[Registry] Disconnected all instances"
        );
        outcome
    }

    /// Server-role name for [`disconnect_all`](Self::disconnect_all).
    pub async fn stop_all(&self) -> BulkOutcome {
        self.disconnect_all().await
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.cached(name)
            .map(|instance| instance.is_connected())
            .unwrap_or(false)
    }

    /// Status of `name`; configured names that were never requested report
    /// an idle status without being instantiated.
    pub fn get_status(&self, name: &str) -> Result<InstanceStatus> {
        if let Some(instance) = self.cached(name) {
            return Ok(instance.status());
        }
        let config = self
            .configs
            .get(name)
            .ok_or_else(|| Error::ConfigurationNotFound(name.to_string()))?;
        let display_name = if config.display_name.is_empty() {
            name
        } else {
            config.display_name.as_str()
        };
        Ok(InstanceStatus::from_state(
            name,
            self.role,
            display_name,
            &config.version,
            &ConnectionState::default(),
        ))
    }

    pub fn get_all_statistics(&self) -> RegistryStatistics {
        let instances: BTreeMap<String, InstanceStatus> = self
            .instances()
            .into_iter()
            .map(|instance| (instance.name().to_string(), instance.status()))
            .collect();

        RegistryStatistics {
            role: self.role,
            configured: self.configs.len(),
            instantiated: instances.len(),
            connected: instances.values().filter(|s| s.connected).count(),
            total_requests: instances.values().map(|s| s.request_count).sum(),
            total_errors: instances.values().map(|s| s.error_count).sum(),
            instances,
        }
    }

    /// Names carrying an active connection marker. Markers of instances
    /// demoted by a closed connection are dropped here.
    pub fn active_connections(&self) -> Vec<String> {
        self.active.retain(|name, _| self.is_connected(name));
        let mut names: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
