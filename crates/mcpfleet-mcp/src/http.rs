//! Streamable HTTP transport
//!
//! Client instances connect with rmcp's Streamable HTTP client on top of a
//! reqwest client carrying the configured headers. Server instances serve an
//! axum router with the MCP service nested at `/mcp`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcpfleet_core::{Channel, OpenRequest, Transport, TransportError, TransportKind};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::channel::{HostedChannel, RmcpClientChannel};
use crate::handler::{FleetClientHandler, FleetServerHandler};
use crate::resolve_bind_address;

/// Path the MCP service is mounted at when hosting.
pub const MCP_PATH: &str = "/mcp";

/// Build a header map from configured headers.
pub fn build_default_headers(headers: &HashMap<String, String>) -> Result<HeaderMap, String> {
    let mut header_map = HeaderMap::new();
    for (key, value) in headers {
        let header_name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| format!("Invalid header name '{}': {}", key, e))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| format!("Invalid header value for '{}': {}", key, e))?;
        header_map.insert(header_name, header_value);
    }
    Ok(header_map)
}

/// Connect flavour: Streamable HTTP client
#[derive(Debug, Default)]
pub struct HttpConnector;

#[async_trait]
impl Transport for HttpConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn open(&self, request: &OpenRequest) -> Result<Arc<dyn Channel>, TransportError> {
        let invalid = |reason: String| TransportError::InvalidTarget {
            target: request.target.clone(),
            reason,
        };

        url::Url::parse(&request.target).map_err(|e| invalid(e.to_string()))?;
        let header_map = build_default_headers(&request.options.headers).map_err(invalid)?;

        debug!(
            instance = %request.instance,
            url = %request.target,
            header_count = header_map.len(),
            "Connecting to Streamable HTTP server"
        );

        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .build()
            .map_err(|e| TransportError::Connect {
                target: request.target.clone(),
                reason: format!("Failed to build HTTP client: {}", e),
            })?;

        let transport = StreamableHttpClientTransport::with_client(
            client,
            StreamableHttpClientTransportConfig::with_uri(request.target.as_str()),
        );

        let session = FleetClientHandler::new(request)
            .serve(transport)
            .await
            .map_err(|e| {
                error!(instance = %request.instance, error = %e, "HTTP connection failed");
                TransportError::Connect {
                    target: request.target.clone(),
                    reason: e.to_string(),
                }
            })?;

        info!(instance = %request.instance, url = %request.target, "HTTP MCP server connected");
        Ok(Arc::new(RmcpClientChannel::new(
            session,
            format!("http:{}", request.target),
        )))
    }
}

/// Host flavour: Streamable HTTP server on `host:port` at [`MCP_PATH`]
#[derive(Debug, Default)]
pub struct HttpHost;

#[async_trait]
impl Transport for HttpHost {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn open(&self, request: &OpenRequest) -> Result<Arc<dyn Channel>, TransportError> {
        let address = resolve_bind_address(&request.target, &request.options);
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .map_err(|e| TransportError::Bind {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            address: address.clone(),
            reason: e.to_string(),
        })?;

        let shutdown = CancellationToken::new();
        let handler = FleetServerHandler::new(request);
        let service = StreamableHttpService::new(
            move || Ok(handler.clone()),
            Arc::new(LocalSessionManager::default()),
            StreamableHttpServerConfig {
                stateful_mode: true,
                sse_keep_alive: Some(Duration::from_secs(15)),
                sse_retry: Some(Duration::from_secs(3)),
                cancellation_token: shutdown.child_token(),
            },
        );
        let router = axum::Router::new().nest_service(MCP_PATH, service);

        let token = shutdown.clone();
        let instance = request.instance.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(instance = %instance, error = %e, "HTTP host stopped with error");
            }
        });

        let url = format!("http://{}{}", local_addr, MCP_PATH);
        info!(instance = %request.instance, url = %url, "Serving MCP over Streamable HTTP");
        Ok(Arc::new(HostedChannel::new(
            format!("http-host:{}", url),
            shutdown,
            task,
        )))
    }
}
