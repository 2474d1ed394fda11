//! McpFleet Core - domain types shared by the registry, adapters and CLI
//!
//! This crate contains:
//! - Capability maps and the negotiator
//! - Fleet configuration
//! - Connection state and status snapshots
//! - Transport and channel contracts
//! - The error taxonomy

pub mod capability;
pub mod config;
pub mod error;
pub mod ping;
pub mod scheduler;
pub mod state;
pub mod transport;

pub use capability::{CapabilityMap, CapabilityNegotiator};
pub use config::{
    ConfigOverride, ConnectionConfig, FleetConfig, MonitorConfig, RetryPolicy, TransportOptions,
};
pub use error::{
    ChannelError, ConfigError, Error, ErrorKind, Result, TransportError, UniformError,
    CONNECTION_CLOSED_CODE, METHOD_NOT_FOUND_CODE,
};
pub use ping::{HealthSummary, PingRecord};
pub use scheduler::Scheduler;
pub use state::{ConnectionState, InstanceRole, InstanceStatus, InstanceSummary, Phase};
pub use transport::{methods, Channel, OpenRequest, Transport, TransportKind, TransportSet};
