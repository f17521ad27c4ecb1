pub mod client;
pub mod config;
pub mod coordinator;
pub mod derive;
pub mod entity;
pub mod model;
pub mod setup;
pub mod snapshot;

#[cfg(test)]
mod fake;

pub use client::{HttpZmClient, MonitorDescriptor, ZmApi, ZmError};
pub use config::{BridgeConfig, ConfigError, CoordinatorConfig, ServerConfig, ServerOptions};
pub use coordinator::{Coordinator, SharedClient};
pub use entity::{CommandError, DeviceInfo, Entity, EntityCommand, EntityKind, EntityState, StateValue};
pub use model::{ApiShape, MonitorFunction, PtzCommand, RunState, TimePeriod};
pub use setup::{validate_connection, Hub, Server, ServiceError, SetupError, ValidationError};
pub use snapshot::{EventQuery, Freshness, MonitorSnapshot, RefreshState, ServerSnapshot};
