//! Channels backed by rmcp sessions

use async_trait::async_trait;
use mcpfleet_core::{methods, CapabilityMap, CapabilityNegotiator, Channel, ChannelError};
use rmcp::model::{
    CallToolRequestParams, ClientRequest, CompleteRequestParams, GetPromptRequestParams,
    PaginatedRequestParams, ReadResourceRequestParams,
};
use rmcp::service::{Peer, ServiceError};
use rmcp::RoleClient;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handler::FleetClient;

/// JSON-RPC "invalid params"
const INVALID_PARAMS_CODE: i32 = -32602;

/// Map an rmcp service error to a raw channel error.
pub(crate) fn channel_error(err: ServiceError) -> ChannelError {
    match err {
        ServiceError::McpError(data) => ChannelError::with_code(data.code.0, data.message.to_string()),
        ServiceError::TransportClosed => ChannelError::connection_closed("transport closed"),
        // A write to a peer that went away.
        ServiceError::TransportSend(e) => {
            ChannelError::connection_closed(format!("transport closed: {}", e))
        }
        other => ChannelError::new(other.to_string()),
    }
}

fn params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, ChannelError> {
    serde_json::from_value(params).map_err(|e| {
        ChannelError::with_code(INVALID_PARAMS_CODE, format!("invalid {} params: {}", method, e))
    })
}

/// Params for list calls; `null` means "first page".
fn page(method: &str, value: Value) -> Result<Option<PaginatedRequestParams>, ChannelError> {
    if value.is_null() {
        Ok(None)
    } else {
        params(method, value).map(Some)
    }
}

fn to_json<T: Serialize>(method: &str, result: T) -> Result<Value, ChannelError> {
    serde_json::to_value(result)
        .map_err(|e| ChannelError::new(format!("unreadable {} result: {}", method, e)))
}

/// Client session channel for any outbound transport.
pub struct RmcpClientChannel {
    description: String,
    peer: Peer<RoleClient>,
    peer_capabilities: CapabilityMap,
    session: Mutex<Option<FleetClient>>,
}

impl RmcpClientChannel {
    pub fn new(client: FleetClient, description: String) -> Self {
        let peer = client.peer().clone();
        let peer_capabilities = client
            .peer_info()
            .and_then(|info| serde_json::to_value(&info.capabilities).ok())
            .map(|value| CapabilityNegotiator::parse_peer(&value))
            .unwrap_or_default();

        debug!(
            channel = %description,
            capabilities = ?peer_capabilities.names().collect::<Vec<_>>(),
            "Client session established"
        );

        Self {
            description,
            peer,
            peer_capabilities,
            session: Mutex::new(Some(client)),
        }
    }
}

#[async_trait]
impl Channel for RmcpClientChannel {
    async fn request(&self, method: &str, value: Value) -> Result<Value, ChannelError> {
        let peer = &self.peer;
        match method {
            methods::CALL_TOOL => {
                let request: CallToolRequestParams = params(method, value)?;
                to_json(method, peer.call_tool(request).await.map_err(channel_error)?)
            }
            methods::READ_RESOURCE => {
                let request: ReadResourceRequestParams = params(method, value)?;
                to_json(method, peer.read_resource(request).await.map_err(channel_error)?)
            }
            methods::GET_PROMPT => {
                let request: GetPromptRequestParams = params(method, value)?;
                to_json(method, peer.get_prompt(request).await.map_err(channel_error)?)
            }
            methods::COMPLETE => {
                let request: CompleteRequestParams = params(method, value)?;
                to_json(method, peer.complete(request).await.map_err(channel_error)?)
            }
            methods::LIST_TOOLS => {
                let request = page(method, value)?;
                to_json(method, peer.list_tools(request).await.map_err(channel_error)?)
            }
            methods::LIST_RESOURCES => {
                let request = page(method, value)?;
                to_json(method, peer.list_resources(request).await.map_err(channel_error)?)
            }
            methods::LIST_PROMPTS => {
                let request = page(method, value)?;
                to_json(method, peer.list_prompts(request).await.map_err(channel_error)?)
            }
            methods::PING => {
                let result = peer
                    .send_request(ClientRequest::PingRequest(Default::default()))
                    .await
                    .map_err(channel_error)?;
                to_json(method, result)
            }
            other => Err(ChannelError::method_not_found(other)),
        }
    }

    async fn peer_capabilities(&self) -> Result<CapabilityMap, ChannelError> {
        if self.session.lock().await.is_none() {
            return Err(ChannelError::connection_closed("session cancelled"));
        }
        Ok(self.peer_capabilities.clone())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session
                .cancel()
                .await
                .map_err(|e| ChannelError::new(format!("failed to cancel session: {}", e)))?;
            debug!(channel = %self.description, "Client session cancelled");
        }
        Ok(())
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

/// Channel standing for a hosted server instance.
///
/// `ping` reports whether the host task is still serving; other requests are
/// not routed to hosted peers.
pub struct HostedChannel {
    description: String,
    shutdown: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HostedChannel {
    pub fn new(
        description: String,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            description,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    async fn is_serving(&self) -> bool {
        match self.task.lock().await.as_ref() {
            Some(task) => !task.is_finished() && !self.shutdown.is_cancelled(),
            None => false,
        }
    }
}

#[async_trait]
impl Channel for HostedChannel {
    async fn request(&self, method: &str, _params: Value) -> Result<Value, ChannelError> {
        if method != methods::PING {
            return Err(ChannelError::method_not_found(method));
        }
        if self.is_serving().await {
            Ok(Value::Object(Map::new()))
        } else {
            Err(ChannelError::connection_closed(format!(
                "{} stopped serving",
                self.description
            )))
        }
    }

    async fn peer_capabilities(&self) -> Result<CapabilityMap, ChannelError> {
        Ok(CapabilityMap::default())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.shutdown.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(host = %self.description, error = %e, "Host task ended abnormally");
            }
        }
        Ok(())
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}
