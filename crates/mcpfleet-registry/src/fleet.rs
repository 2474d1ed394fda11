//! Fleet: both registries plus the health monitor, owned by one root.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use mcpfleet_core::{FleetConfig, HealthSummary, InstanceRole, Result, Scheduler, TransportSet};
use serde::Serialize;
use tracing::{info, warn};

use crate::health::{HealthMonitor, PingOperation};
use crate::registry::{BulkOutcome, InstanceRegistry, RegistryStatistics};

/// Snapshot of the whole fleet.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub servers: RegistryStatistics,
    pub clients: RegistryStatistics,
    pub health: HealthSummary,
}

pub struct Fleet {
    servers: Arc<InstanceRegistry>,
    clients: Arc<InstanceRegistry>,
    monitor: HealthMonitor,
}

impl Fleet {
    pub fn new(
        config: FleetConfig,
        server_transports: TransportSet,
        client_transports: TransportSet,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        info!(
            servers = config.servers.len(),
            clients = config.clients.len(),
            "[Fleet] Initializing"
        );
        Self {
            servers: Arc::new(InstanceRegistry::new(
                InstanceRole::Server,
                config.servers,
                server_transports,
            )),
            clients: Arc::new(InstanceRegistry::new(
                InstanceRole::Client,
                config.clients,
                client_transports,
            )),
            monitor: HealthMonitor::new(config.monitor, scheduler),
        }
    }

    pub fn registry(&self, role: InstanceRole) -> &Arc<InstanceRegistry> {
        match role {
            InstanceRole::Server => &self.servers,
            InstanceRole::Client => &self.clients,
        }
    }

    pub fn servers(&self) -> &Arc<InstanceRegistry> {
        &self.servers
    }

    pub fn clients(&self) -> &Arc<InstanceRegistry> {
        &self.clients
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Health-monitor id of an instance, e.g. `client:alpha`.
    pub fn connection_id(role: InstanceRole, name: &str) -> String {
        format!("{}:{}", role, name)
    }

    /// Ping `name` on a schedule. The instance is looked up on every tick so
    /// a replaced instance is monitored instead of the old one.
    pub fn monitor_instance(
        &self,
        role: InstanceRole,
        name: &str,
        interval: Option<Duration>,
    ) -> Result<String> {
        let registry = Arc::clone(self.registry(role));
        // Fail early for unknown names.
        registry.get(name)?;

        let id = Self::connection_id(role, name);
        let instance_name = name.to_string();
        let operation: PingOperation = Arc::new(move || -> BoxFuture<'static, Result<()>> {
            let registry = Arc::clone(&registry);
            let name = instance_name.clone();
            Box::pin(async move { registry.get(&name)?.ping().await })
        });
        self.monitor.start_monitoring(id.clone(), operation, interval);
        Ok(id)
    }

    pub fn stop_monitoring(&self, role: InstanceRole, name: &str) -> bool {
        self.monitor
            .stop_monitoring(&Self::connection_id(role, name))
    }

    pub fn is_healthy(&self, role: InstanceRole, name: &str) -> bool {
        self.monitor
            .is_healthy(&Self::connection_id(role, name), None)
    }

    pub fn system_health(&self) -> SystemHealth {
        SystemHealth {
            servers: self.servers.get_all_statistics(),
            clients: self.clients.get_all_statistics(),
            health: self.monitor.summary(),
        }
    }

    /// Stop every monitor, then disconnect clients before servers.
    pub async fn shutdown(&self) -> (BulkOutcome, BulkOutcome) {
        info!("[Fleet] Shutting down");
        self.monitor.stop_all();

        let clients = self.clients.disconnect_all().await;
        let servers = self.servers.stop_all().await;
        if !clients.failed.is_empty() || !servers.failed.is_empty() {
            warn!(
                client_failures = clients.failed.len(),
                server_failures = servers.failed.len(),
                "[Fleet] Shutdown finished with failures"
            );
        }
        (clients, servers)
    }
}
