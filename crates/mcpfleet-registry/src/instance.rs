//! Connection state machine for one named instance
//!
//! `Idle → Connecting → Connected → Disconnected → Connecting …`
//!
//! State lives behind a `parking_lot::RwLock` that is never held across an
//! await. `connect` and `disconnect` serialize on an async mutex so only one
//! transport `open` runs at a time per instance.

use std::sync::Arc;
use std::time::Instant;

use mcpfleet_core::{
    methods, CapabilityNegotiator, Channel, ConnectionConfig, ConnectionState, Error,
    InstanceRole, InstanceStatus, OpenRequest, Result, TransportError, TransportKind,
    TransportOptions, TransportSet, UniformError,
};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::safe_await::{classify_transport, elapsed_ms};

/// Arguments of the most recent connect attempt, replayed by `reconnect`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectArgs {
    pub target: Option<String>,
    pub transport: Option<TransportKind>,
    pub options: Option<TransportOptions>,
}

pub struct Instance {
    name: String,
    role: InstanceRole,
    config: ConnectionConfig,
    transports: TransportSet,
    pub(crate) state: RwLock<ConnectionState>,
    pub(crate) channel: RwLock<Option<Arc<dyn Channel>>>,
    connect_lock: Mutex<()>,
    last_connect: RwLock<Option<ConnectArgs>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Instance {
    pub fn new(
        name: impl Into<String>,
        role: InstanceRole,
        config: ConnectionConfig,
        transports: TransportSet,
    ) -> Self {
        let name = name.into();
        let mut config = config;
        if config.display_name.is_empty() {
            config.display_name = name.clone();
        }
        Self {
            name,
            role,
            config,
            transports,
            state: RwLock::new(ConnectionState::default()),
            channel: RwLock::new(None),
            connect_lock: Mutex::new(()),
            last_connect: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> InstanceRole {
        self.role
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    /// Copy of the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus::from_state(
            &self.name,
            self.role,
            &self.config.display_name,
            &self.config.version,
            &self.state.read(),
        )
    }

    pub fn last_connect(&self) -> Option<ConnectArgs> {
        self.last_connect.read().clone()
    }

    /// Connect (client) or start serving (server).
    ///
    /// A no-op when already connected. The target falls back to the
    /// configured one; hosted servers may also bind the configured host/port.
    pub async fn connect(
        &self,
        target: Option<&str>,
        transport_hint: Option<TransportKind>,
        options: Option<TransportOptions>,
    ) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        if self.is_connected() {
            debug!(instance = %self.name, "Already connected, skipping connect");
            return Ok(());
        }

        *self.last_connect.write() = Some(ConnectArgs {
            target: target.map(str::to_string),
            transport: transport_hint,
            options: options.clone(),
        });

        let options = options.unwrap_or_else(|| self.config.options.clone());
        let target = target
            .map(str::to_string)
            .or_else(|| self.config.target.clone())
            .or_else(|| match self.role {
                InstanceRole::Server => Some(options.bind_address()),
                InstanceRole::Client => None,
            })
            .ok_or_else(|| Error::MissingTarget(self.name.clone()))?;

        let kind = self.config.resolve_transport(&target, transport_hint);
        let capabilities = CapabilityNegotiator::prepare(&self.config.capabilities);
        let request = OpenRequest {
            instance: self.name.clone(),
            role: self.role,
            target: target.clone(),
            display_name: self.config.display_name.clone(),
            version: self.config.version.clone(),
            capabilities: capabilities.clone(),
            options,
        };

        info!(
            instance = %self.name,
            role = %self.role,
            transport = %kind,
            target = %target,
            "Connecting"
        );
        self.state.write().begin_connect();
        let started = Instant::now();

        let channel = match self.open_with_retry(kind, &request).await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(instance = %self.name, transport = %kind, error = %err, "Connect failed");
                self.state.write().mark_connect_failed(err.to_string());
                let error_kind = classify_transport(&err);
                return Err(UniformError::new(error_kind, self.name.as_str(), "connect", err).into());
            }
        };

        let elapsed = elapsed_ms(started);
        let generation = {
            let mut state = self.state.write();
            *self.channel.write() = Some(Arc::clone(&channel));
            state.mark_connected(kind, target, capabilities, elapsed)
        };

        match channel.peer_capabilities().await {
            Ok(peer_capabilities) => {
                let mut state = self.state.write();
                if state.generation == generation {
                    state.peer_capabilities = peer_capabilities;
                }
            }
            Err(e) => {
                warn!(instance = %self.name, error = %e, "Failed to read peer capabilities");
            }
        }

        info!(
            instance = %self.name,
            channel = %channel.description(),
            "Connected"
        );
        Ok(())
    }

    async fn open_with_retry(
        &self,
        kind: TransportKind,
        request: &OpenRequest,
    ) -> std::result::Result<Arc<dyn Channel>, TransportError> {
        let adapter = self.transports.get(kind)?;
        let policy = &request.options.retry;
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = match request.options.connect_timeout() {
                Some(limit) => tokio::time::timeout(limit, adapter.open(request))
                    .await
                    .unwrap_or_else(|_| Err(TransportError::Timeout(limit))),
                None => adapter.open(request).await,
            };

            match result {
                Ok(channel) => return Ok(channel),
                Err(err) if attempt < attempts => {
                    let delay = policy.delay_after(attempt);
                    debug!(
                        instance = %self.name,
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Open failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Close the channel. Idempotent; counters are preserved.
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;

        let (channel, kind) = {
            let mut state = self.state.write();
            let channel = self.channel.write().take();
            if !state.connected && channel.is_none() {
                return Ok(());
            }
            let kind = state.transport;
            state.mark_disconnected();
            (channel, kind)
        };

        if let Some(channel) = channel {
            debug!(instance = %self.name, channel = %channel.description(), "Closing channel");
            let closed = match kind.and_then(|kind| self.transports.get(kind).ok()) {
                Some(adapter) => adapter.close(channel).await,
                None => channel.close().await.map_err(TransportError::from),
            };
            closed.map_err(|e| {
                let kind = classify_transport(&e);
                UniformError::new(kind, self.name.as_str(), "disconnect", e)
            })?;
        }

        info!(instance = %self.name, "Disconnected");
        Ok(())
    }

    /// Disconnect, then replay the last connect arguments.
    pub async fn reconnect(&self) -> Result<()> {
        let last = self.last_connect().unwrap_or(ConnectArgs {
            target: None,
            transport: None,
            options: None,
        });
        if let Err(e) = self.disconnect().await {
            warn!(instance = %self.name, error = %e, "Disconnect before reconnect failed");
        }
        self.connect(last.target.as_deref(), last.transport, last.options)
            .await
    }

    /// Lock order is state, then channel.
    fn current_channel(&self) -> Result<(Arc<dyn Channel>, u64)> {
        let state = self.state.read();
        if !state.connected {
            return Err(Error::NotConnected(self.name.clone()));
        }
        self.channel
            .read()
            .clone()
            .map(|channel| (channel, state.generation))
            .ok_or_else(|| Error::NotConnected(self.name.clone()))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let (channel, generation) = self.current_channel()?;
        self.safe_await(method, generation, channel.request(method, params))
            .await
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let mut params = Map::new();
        params.insert("name".to_string(), Value::String(name.to_string()));
        if let Some(arguments) = arguments {
            params.insert("arguments".to_string(), arguments);
        }
        self.call(methods::CALL_TOOL, Value::Object(params)).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.call(methods::READ_RESOURCE, json!({ "uri": uri })).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let mut params = Map::new();
        params.insert("name".to_string(), Value::String(name.to_string()));
        if let Some(arguments) = arguments {
            params.insert("arguments".to_string(), arguments);
        }
        self.call(methods::GET_PROMPT, Value::Object(params)).await
    }

    pub async fn list_tools(&self) -> Result<Value> {
        self.call(methods::LIST_TOOLS, Value::Null).await
    }

    pub async fn list_resources(&self) -> Result<Value> {
        self.call(methods::LIST_RESOURCES, Value::Null).await
    }

    pub async fn list_prompts(&self) -> Result<Value> {
        self.call(methods::LIST_PROMPTS, Value::Null).await
    }

    /// Ask the peer to complete `value` for a prompt argument.
    pub async fn complete_text(&self, prompt: &str, argument: &str, value: &str) -> Result<Value> {
        let params = json!({
            "ref": { "type": "ref/prompt", "name": prompt },
            "argument": { "name": argument, "value": value },
        });
        self.call(methods::COMPLETE, params).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.call(methods::PING, Value::Null).await?;
        self.state.write().last_ping_at = Some(chrono::Utc::now());
        Ok(())
    }
}
