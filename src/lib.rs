//! meshkit - In-process service orchestration runtime
//!
//! A small microkernel for coordinating many loosely coupled services
//! inside one process.
//!
//! # Architecture
//!
//! Three components, built once and wired together by [`Runtime`]:
//! - `ServiceRegistry`: lazy, dependency-ordered construction of services,
//!   health tracking and one circuit breaker per service
//! - `ServiceMesh`: calls between services through rate limit, circuit
//!   breaker, bulkhead, timeout and retry-with-backoff
//! - `EventBus`: publish/subscribe with schema validation, middleware,
//!   delivery retries and a dead-letter queue
//!
//! # Modules
//!
//! - `core`: Registry, mesh, runtime, topology and snapshots
//! - `bus`: Event bus, schemas, middleware, dead letters
//! - `resilience`: Circuit breaker, retry, rate limit, bulkhead, presets
//! - `domain`: Data structures (ServiceDefinition, Event, HealthStatus)
//! - `adapters`: Simulated services used by topologies
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Validate a topology and print the load order
//! meshkit check topology.yaml
//!
//! # Run its scripted calls against simulated services
//! meshkit run topology.yaml
//! ```

pub mod adapters;
pub mod bus;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod resilience;

// Re-export main types at crate root for convenience
pub use bus::{EventBus, Filter};
pub use config::RuntimeConfig;
pub use core::{
    CallOptions, CancelToken, ConfigurationError, MeshError, Runtime, ServiceMesh,
    ServiceRegistry,
};
pub use domain::{Event, Service, ServiceDefinition, ServiceInstance};
