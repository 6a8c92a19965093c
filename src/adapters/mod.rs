//! Service implementations that plug into the registry.
//!
//! The runtime itself never constructs services; adapters provide
//! ready-made definitions. `simulated` backs the topology files run by
//! the CLI.

pub mod simulated;

pub use simulated::{MethodBehavior, SimulatedService, SimulatedSpec};
