//! rmcp handlers for fleet instances
//!
//! Client instances run a [`FleetClientHandler`]; hosted server instances run
//! a [`FleetServerHandler`]. Both declare the capability map prepared by the
//! negotiator, converted into rmcp's typed capability structs.

use mcpfleet_core::{CapabilityMap, OpenRequest};
use rmcp::model::{
    ClientCapabilities, ClientInfo, Implementation, ServerCapabilities, ServerInfo,
};
use rmcp::service::{NotificationContext, RunningService};
use rmcp::{RoleClient, ServerHandler};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Running client session
pub type FleetClient = RunningService<RoleClient, FleetClientHandler>;

/// Convert a capability map into an rmcp capability struct.
///
/// Unknown entries are ignored by the typed struct; a map that does not fit
/// the schema at all falls back to the empty declaration.
fn typed_capabilities<T>(instance: &str, capabilities: &CapabilityMap) -> T
where
    T: DeserializeOwned + Default,
{
    serde_json::from_value(capabilities.to_value()).unwrap_or_else(|e| {
        warn!(
            instance = %instance,
            error = %e,
            "Capability map does not fit the protocol schema, declaring none"
        );
        T::default()
    })
}

/// Client handler for outbound sessions
#[derive(Clone)]
pub struct FleetClientHandler {
    info: ClientInfo,
    instance: String,
}

impl std::fmt::Debug for FleetClientHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetClientHandler")
            .field("instance", &self.instance)
            .finish()
    }
}

impl FleetClientHandler {
    pub fn new(request: &OpenRequest) -> Self {
        let capabilities: ClientCapabilities =
            typed_capabilities(&request.instance, &request.capabilities);
        Self {
            info: ClientInfo {
                protocol_version: Default::default(),
                capabilities,
                client_info: Implementation {
                    name: request.display_name.clone(),
                    version: request.version.clone(),
                    title: Some(format!("McpFleet {}", request.instance)),
                    ..Default::default()
                },
                ..Default::default()
            },
            instance: request.instance.clone(),
        }
    }
}

impl rmcp::ClientHandler for FleetClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }

    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let instance = self.instance.clone();
        async move {
            debug!(instance = %instance, "[FleetClientHandler] Peer sent tools/list_changed");
        }
    }

    fn on_prompt_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let instance = self.instance.clone();
        async move {
            debug!(instance = %instance, "[FleetClientHandler] Peer sent prompts/list_changed");
        }
    }

    fn on_resource_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let instance = self.instance.clone();
        async move {
            debug!(instance = %instance, "[FleetClientHandler] Peer sent resources/list_changed");
        }
    }
}

/// Server handler for hosted instances.
///
/// Declares the configured capabilities and answers pings; tool, resource and
/// prompt execution is left to rmcp's defaults.
#[derive(Clone)]
pub struct FleetServerHandler {
    info: ServerInfo,
}

impl FleetServerHandler {
    pub fn new(request: &OpenRequest) -> Self {
        let capabilities: ServerCapabilities =
            typed_capabilities(&request.instance, &request.capabilities);
        Self {
            info: ServerInfo {
                protocol_version: Default::default(),
                capabilities,
                server_info: Implementation {
                    name: request.display_name.clone(),
                    version: request.version.clone(),
                    ..Default::default()
                },
                instructions: None,
            },
        }
    }
}

impl ServerHandler for FleetServerHandler {
    fn get_info(&self) -> ServerInfo {
        self.info.clone()
    }
}
