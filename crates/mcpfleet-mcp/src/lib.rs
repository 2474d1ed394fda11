//! McpFleet MCP - transport adapters over rmcp
//!
//! Every transport kind comes in two flavours:
//! - connectors open outbound client sessions (client instances)
//! - hosts serve a server handler (server instances)
//!
//! Use [`client_transports`] and [`host_transports`] to get the full set for
//! a registry.

pub mod channel;
pub mod handler;
pub mod http;
pub mod socket;
pub mod stdio;

use std::sync::Arc;

use mcpfleet_core::{TransportOptions, TransportSet};

pub use channel::{HostedChannel, RmcpClientChannel};
pub use handler::{FleetClient, FleetClientHandler, FleetServerHandler};
pub use http::{HttpConnector, HttpHost, MCP_PATH};
pub use socket::{SocketConnector, SocketHost, DEFAULT_MAX_PEERS};
pub use stdio::{parse_command, StdioConnector, StdioHost};

/// Adapters for client instances.
pub fn client_transports() -> TransportSet {
    TransportSet::new()
        .with(Arc::new(StdioConnector))
        .with(Arc::new(HttpConnector))
        .with(Arc::new(SocketConnector))
}

/// Adapters for hosted server instances.
pub fn host_transports() -> TransportSet {
    TransportSet::new()
        .with(Arc::new(StdioHost))
        .with(Arc::new(HttpHost))
        .with(Arc::new(SocketHost))
}

/// Address a host binds to for `target`.
///
/// A URL contributes its host and port, a bare `host:port` is used as-is, and
/// anything else falls back to the configured host/port.
pub(crate) fn resolve_bind_address(target: &str, options: &TransportOptions) -> String {
    if let Ok(url) = url::Url::parse(target) {
        if let Some(host) = url.host_str() {
            let port = url.port_or_known_default().or(options.port).unwrap_or(0);
            return format!("{}:{}", host, port);
        }
    }
    if target.parse::<std::net::SocketAddr>().is_ok() {
        return target.to_string();
    }
    options.bind_address()
}
