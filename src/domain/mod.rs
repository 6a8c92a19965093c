//! Domain types for the meshkit runtime.
//!
//! This module contains the core data structures:
//! - Service: Definitions, the typed method table, live instances
//! - Events: Messages carried by the event bus
//! - Health: Per-service health state

pub mod events;
pub mod health;
pub mod service;

// Re-export commonly used types
pub use events::{event_types, payload, AlertType, Event, Payload};
pub use health::{HealthState, HealthStatus};
pub use service::{CallArgs, Service, ServiceDefinition, ServiceDefinitionBuilder, ServiceInstance};
