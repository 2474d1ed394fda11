//! Transport contracts
//!
//! A [`Transport`] opens a [`Channel`] for one instance; the channel carries
//! opaque request/response payloads. Adapters only establish and tear down
//! channels. They never classify failures.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::CapabilityMap;
use crate::config::TransportOptions;
use crate::error::{ChannelError, TransportError};
use crate::state::InstanceRole;

/// Protocol method names routed through [`Channel::request`].
pub mod methods {
    pub const CALL_TOOL: &str = "tools/call";
    pub const LIST_TOOLS: &str = "tools/list";
    pub const READ_RESOURCE: &str = "resources/read";
    pub const LIST_RESOURCES: &str = "resources/list";
    pub const GET_PROMPT: &str = "prompts/get";
    pub const LIST_PROMPTS: &str = "prompts/list";
    pub const COMPLETE: &str = "completion/complete";
    pub const PING: &str = "ping";
}

/// Channel mechanism used to carry protocol traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Standard-stream pipe (child process, or own stdio when hosting)
    #[serde(alias = "pipe")]
    Stdio,
    /// Streamable HTTP
    Http,
    /// Persistent websocket
    #[serde(alias = "websocket", alias = "ws")]
    Socket,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [
        TransportKind::Stdio,
        TransportKind::Http,
        TransportKind::Socket,
    ];

    /// Infer the transport from a target address scheme.
    ///
    /// `http(s)://` is HTTP, `ws(s)://` is a socket, anything else (including
    /// a bare command line) is stdio.
    pub fn infer(target: &str) -> Self {
        match url::Url::parse(target) {
            Ok(url) => match url.scheme() {
                "http" | "https" => TransportKind::Http,
                "ws" | "wss" => TransportKind::Socket,
                _ => TransportKind::Stdio,
            },
            Err(_) => TransportKind::Stdio,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Socket => "socket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" | "pipe" => Ok(TransportKind::Stdio),
            "http" => Ok(TransportKind::Http),
            "socket" | "websocket" | "ws" => Ok(TransportKind::Socket),
            other => Err(format!("unknown transport kind: {}", other)),
        }
    }
}

/// Everything an adapter needs to open a channel for one instance.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub instance: String,
    pub role: InstanceRole,
    pub target: String,
    pub display_name: String,
    pub version: String,
    /// Local capabilities, already prepared by the negotiator
    pub capabilities: CapabilityMap,
    pub options: TransportOptions,
}

/// An open protocol channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send one request and await its response.
    async fn request(&self, method: &str, params: Value) -> Result<Value, ChannelError>;

    /// Capabilities the peer declared during the handshake.
    async fn peer_capabilities(&self) -> Result<CapabilityMap, ChannelError>;

    /// Close the channel. Closing twice is not an error.
    async fn close(&self) -> Result<(), ChannelError>;

    /// Short description for logging
    fn description(&self) -> String;
}

/// Adapter for one transport kind.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Establish a raw channel.
    async fn open(&self, request: &OpenRequest) -> Result<Arc<dyn Channel>, TransportError>;

    /// Tear down a channel opened by this adapter.
    async fn close(&self, channel: Arc<dyn Channel>) -> Result<(), TransportError> {
        channel.close().await.map_err(TransportError::from)
    }
}

/// Adapters available to a registry, keyed by kind.
#[derive(Clone, Default)]
pub struct TransportSet {
    adapters: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl TransportSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one of the same kind.
    pub fn with(mut self, adapter: Arc<dyn Transport>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: TransportKind) -> Result<Arc<dyn Transport>, TransportError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or(TransportError::Unsupported(kind))
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for TransportSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSet")
            .field("kinds", &self.kinds())
            .finish()
    }
}
