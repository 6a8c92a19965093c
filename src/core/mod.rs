//! Core orchestration logic.
//!
//! This module contains:
//! - ServiceRegistry: Lazy, dependency-ordered service loading
//! - ServiceMesh: Resilient calls between services
//! - Runtime: Application root wiring registry, mesh and event bus
//! - Topology: Simulated service topologies for the CLI
//! - Snapshot: Periodic persistence of runtime state

pub mod error;
pub mod graph;
pub mod mesh;
pub mod monitor;
pub mod registry;
pub mod runtime;
pub mod snapshot;
pub mod tasks;
pub mod topology;

// Re-export commonly used types
pub use error::{BusError, ConfigurationError, MeshError, UnavailableReason};
pub use mesh::{CallOptions, MeshConfig, MeshMetrics, ServiceCallMetrics, ServiceMesh};
pub use monitor::{AlertConfig, AlertMonitor, ErrorRateAlert};
pub use registry::{
    LoadFailure, LoadReport, RegistryConfig, RegistryMetrics, ServiceLoadMetrics, ServiceRegistry,
};
pub use runtime::Runtime;
pub use snapshot::{RuntimeSnapshot, SnapshotConfig};
pub use tasks::{CancelToken, TaskSet};
pub use topology::{CallSpec, ServiceSpec, Topology};
