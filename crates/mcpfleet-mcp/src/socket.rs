//! Persistent websocket transport
//!
//! One JSON-RPC message per text frame. The websocket halves are adapted into
//! the sink/stream pair rmcp accepts as a transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use mcpfleet_core::{Channel, OpenRequest, Transport, TransportError, TransportKind};
use rmcp::model::{ClientJsonRpcMessage, ServerJsonRpcMessage};
use rmcp::ServiceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_async, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{HostedChannel, RmcpClientChannel};
use crate::handler::{FleetClientHandler, FleetServerHandler};
use crate::resolve_bind_address;

/// Concurrent peers a socket host accepts when no cap is configured.
pub const DEFAULT_MAX_PEERS: usize = 16;

/// Pause after a failed accept so persistent errors (EMFILE) do not spin.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Failure writing a message to the websocket.
#[derive(Debug, Error)]
pub enum SocketFrameError {
    #[error("websocket error: {0}")]
    Websocket(#[from] tungstenite::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

fn encode_frame<T: Serialize>(message: T) -> Result<Message, SocketFrameError> {
    Ok(Message::Text(serde_json::to_string(&message)?))
}

fn decode_frame<T: DeserializeOwned>(frame: Result<Message, tungstenite::Error>) -> Option<T> {
    let decoded = match frame {
        Ok(Message::Text(text)) => serde_json::from_str(&text),
        Ok(Message::Binary(bytes)) => serde_json::from_slice(&bytes),
        Ok(_) => return None,
        Err(e) => {
            debug!(error = %e, "Websocket read failed");
            return None;
        }
    };
    decoded
        .map_err(|e| warn!(error = %e, "Dropping undecodable websocket frame"))
        .ok()
}

/// Connect flavour: websocket client (`ws://`, `wss://`)
#[derive(Debug, Default)]
pub struct SocketConnector;

#[async_trait]
impl Transport for SocketConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn open(&self, request: &OpenRequest) -> Result<Arc<dyn Channel>, TransportError> {
        let url = url::Url::parse(&request.target).map_err(|e| TransportError::InvalidTarget {
            target: request.target.clone(),
            reason: e.to_string(),
        })?;

        debug!(instance = %request.instance, url = %url, "Connecting to websocket MCP server");

        let (ws, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect {
                    target: request.target.clone(),
                    reason: e.to_string(),
                })?;

        let (sink, stream) = ws.split();
        let sink = Box::pin(
            sink.sink_map_err(SocketFrameError::from)
                .with(|message: ClientJsonRpcMessage| future::ready(encode_frame(message))),
        );
        let stream = Box::pin(
            stream.filter_map(|frame| future::ready(decode_frame::<ServerJsonRpcMessage>(frame))),
        );

        let session = FleetClientHandler::new(request)
            .serve((sink, stream))
            .await
            .map_err(|e| TransportError::Handshake {
                target: request.target.clone(),
                reason: e.to_string(),
            })?;

        info!(instance = %request.instance, url = %url, "Websocket MCP server connected");
        Ok(Arc::new(RmcpClientChannel::new(
            session,
            format!("socket:{}", request.target),
        )))
    }
}

/// Releases a peer slot when the peer's session ends.
struct PeerSlot(Arc<AtomicUsize>);

impl PeerSlot {
    fn acquire(active: &Arc<AtomicUsize>, max_peers: usize) -> Option<Self> {
        if active.fetch_add(1, Ordering::SeqCst) >= max_peers {
            active.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self(Arc::clone(active)))
    }
}

impl Drop for PeerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve_peer(
    instance: String,
    handler: FleetServerHandler,
    tcp: TcpStream,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
    _slot: PeerSlot,
) {
    let ws = match accept_async(tcp).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(instance = %instance, peer = %peer_addr, error = %e, "Websocket upgrade failed");
            return;
        }
    };

    let (sink, stream) = ws.split();
    let sink = Box::pin(
        sink.sink_map_err(SocketFrameError::from)
            .with(|message: ServerJsonRpcMessage| future::ready(encode_frame(message))),
    );
    let stream = Box::pin(
        stream.filter_map(|frame| future::ready(decode_frame::<ClientJsonRpcMessage>(frame))),
    );

    match handler.serve_with_ct((sink, stream), shutdown).await {
        Ok(running) => {
            debug!(instance = %instance, peer = %peer_addr, "Websocket peer initialized");
            let reason = running.waiting().await;
            debug!(instance = %instance, peer = %peer_addr, reason = ?reason, "Websocket peer left");
        }
        Err(e) => debug!(instance = %instance, peer = %peer_addr, error = %e, "Websocket handshake failed"),
    }
}

async fn accepted_or_pause<T>(instance: &str, accepted: std::io::Result<T>) -> Option<T> {
    match accepted {
        Ok(accepted) => Some(accepted),
        Err(e) => {
            error!(instance = %instance, error = %e, "Websocket accept failed");
            tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
            None
        }
    }
}

/// Host flavour: websocket listener on `host:port` with a peer cap
#[derive(Debug, Default)]
pub struct SocketHost;

#[async_trait]
impl Transport for SocketHost {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn open(&self, request: &OpenRequest) -> Result<Arc<dyn Channel>, TransportError> {
        let address = resolve_bind_address(&request.target, &request.options);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| TransportError::Bind {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            address: address.clone(),
            reason: e.to_string(),
        })?;

        let max_peers = request.options.max_peers.unwrap_or(DEFAULT_MAX_PEERS);
        let handler = FleetServerHandler::new(request);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let instance = request.instance.clone();

        let task = tokio::spawn(async move {
            let active = Arc::new(AtomicUsize::new(0));
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let Some((tcp, peer_addr)) = accepted_or_pause(&instance, accepted).await else {
                    continue;
                };

                let Some(slot) = PeerSlot::acquire(&active, max_peers) else {
                    warn!(
                        instance = %instance,
                        peer = %peer_addr,
                        max_peers,
                        "Rejecting websocket peer, host is full"
                    );
                    continue;
                };

                tokio::spawn(serve_peer(
                    instance.clone(),
                    handler.clone(),
                    tcp,
                    peer_addr,
                    token.child_token(),
                    slot,
                ));
            }
            debug!(instance = %instance, "Websocket host stopped accepting");
        });

        let url = format!("ws://{}", local_addr);
        info!(instance = %request.instance, url = %url, max_peers, "Serving MCP over websocket");
        Ok(Arc::new(HostedChannel::new(
            format!("socket-host:{}", url),
            shutdown,
            task,
        )))
    }
}
