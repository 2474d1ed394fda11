//! Transport adapter integration tests
//!
//! Real rmcp peers on loopback:
//! - Streamable HTTP client against an axum-hosted tool server
//! - hosted HTTP and websocket servers reached by fleet clients
//! - capability negotiation across the wire
