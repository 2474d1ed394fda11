//! McpFleet registry - instance lifecycle, registries, and health monitoring
//!
//! - [`Instance`]: connection state machine for one named endpoint
//! - [`InstanceRegistry`]: name-keyed, lazily instantiated instances of one role
//! - [`HealthMonitor`]: periodic pings with backoff and bounded history
//! - [`Fleet`]: owns a server registry, a client registry and the monitor

pub mod fleet;
pub mod health;
pub mod instance;
pub mod registry;
pub mod safe_await;

pub use fleet::{Fleet, SystemHealth};
pub use health::{HealthMonitor, PingOperation, TokioScheduler};
pub use instance::{ConnectArgs, Instance};
pub use registry::{BulkOutcome, ConnectionTestReport, InstanceRegistry, RegistryStatistics};
pub use safe_await::{classify, classify_message, classify_transport};
