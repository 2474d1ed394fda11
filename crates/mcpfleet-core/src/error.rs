//! Error taxonomy shared by every McpFleet crate.
//!
//! Raw failures come in two shapes: [`TransportError`] (a channel could not be
//! opened or closed) and [`ChannelError`] (a request on an open channel
//! failed). Neither escapes the instance layer as-is: both are classified and
//! re-raised as a [`UniformError`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportKind;

/// Protocol error code a peer (or the local SDK) uses for "the channel is gone".
pub const CONNECTION_CLOSED_CODE: i32 = -32000;

/// Protocol error code for "method not found".
pub const METHOD_NOT_FOUND_CODE: i32 = -32601;

/// A failed request on an open channel.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ChannelError {
    /// Protocol error code, when the peer (or SDK) supplied one
    pub code: Option<i32>,
    pub message: String,
}

impl ChannelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// The peer or the local transport closed the channel.
    pub fn connection_closed(detail: impl fmt::Display) -> Self {
        Self::with_code(CONNECTION_CLOSED_CODE, format!("connection closed: {}", detail))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::with_code(
            METHOD_NOT_FOUND_CODE,
            format!("method not available: {}", method),
        )
    }
}

/// Failure to establish or tear down a raw channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no {0} transport adapter is registered")]
    Unsupported(TransportKind),

    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("failed to reach {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("MCP handshake with {target} failed: {reason}")]
    Handshake { target: String, reason: String },

    #[error("failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to close channel: {0}")]
    Close(#[from] ChannelError),
}

/// Classification of a failure observed by the safe-await step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The peer closed the channel; the instance has been demoted
    ConnectionClosed,
    /// Any other failure; instance state was preserved
    OperationFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ConnectionClosed => f.write_str("connection closed"),
            ErrorKind::OperationFailed => f.write_str("operation failed"),
        }
    }
}

/// The single error shape raised for classified transport/protocol failures.
#[derive(Debug, Error)]
#[error("{operation} on '{instance}' failed ({kind}): {cause}")]
pub struct UniformError {
    pub kind: ErrorKind,
    pub instance: String,
    pub operation: String,
    #[source]
    pub cause: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl UniformError {
    pub fn new(
        kind: ErrorKind,
        instance: impl Into<String>,
        operation: impl Into<String>,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            kind,
            instance: instance.into(),
            operation: operation.into(),
            cause: cause.into(),
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        self.kind == ErrorKind::ConnectionClosed
    }

    /// Protocol code of the underlying channel failure, if any.
    pub fn code(&self) -> Option<i32> {
        self.cause
            .downcast_ref::<ChannelError>()
            .and_then(|e| e.code)
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level error for registry and instance operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no configuration found for instance '{0}'")]
    ConfigurationNotFound(String),

    #[error("instance '{0}' is not connected")]
    NotConnected(String),

    #[error("instance '{0}' has no target to connect to")]
    MissingTarget(String),

    #[error(transparent)]
    Uniform(#[from] UniformError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Classification of the failure, for errors that went through safe-await.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Uniform(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        self.kind() == Some(ErrorKind::ConnectionClosed)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
