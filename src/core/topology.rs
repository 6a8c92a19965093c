//! Topology definitions and loading.
//!
//! A topology is a YAML file describing simulated services and a script of
//! calls to run against them. The CLI uses it to exercise a runtime end to
//! end without real services.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::mesh::CallOptions;
use crate::adapters::{MethodBehavior, SimulatedSpec};
use crate::domain::ServiceDefinition;

/// A complete topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    /// Topology name (shown in CLI output)
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub services: Vec<ServiceSpec>,

    /// Scripted calls, run in order
    #[serde(default)]
    pub calls: Vec<CallSpec>,
}

impl Topology {
    /// Load a topology from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read topology file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a topology from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse topology YAML")
    }

    /// Check names and call targets. Dependency problems are left to the registry.
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            anyhow::bail!("Topology must define at least one service");
        }

        let mut seen = HashSet::new();
        for (i, service) in self.services.iter().enumerate() {
            if service.name.is_empty() {
                anyhow::bail!("Service {} has an empty name", i);
            }
            if !seen.insert(service.name.as_str()) {
                anyhow::bail!("Service '{}' is defined twice", service.name);
            }
            for (method, behavior) in &service.methods {
                if !(0.0..=1.0).contains(&behavior.failure_rate) {
                    anyhow::bail!(
                        "Method '{}.{}' has failure_rate {} outside 0.0..=1.0",
                        service.name,
                        method,
                        behavior.failure_rate
                    );
                }
            }
        }

        for (i, call) in self.calls.iter().enumerate() {
            let Some(service) = self.get_service(&call.service) else {
                anyhow::bail!("Call {} targets unknown service '{}'", i, call.service);
            };
            if !service.methods.contains_key(&call.method) {
                anyhow::bail!(
                    "Call {} targets unknown method '{}.{}'",
                    i,
                    call.service,
                    call.method
                );
            }
            if call.count == 0 {
                anyhow::bail!("Call {} has a count of 0", i);
            }
        }

        Ok(())
    }

    /// Get a service by name
    pub fn get_service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Registry definitions for every service
    pub fn definitions(&self) -> Vec<ServiceDefinition> {
        self.services
            .iter()
            .map(|s| s.simulated().definition())
            .collect()
    }
}

/// One simulated service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub critical: bool,

    #[serde(default = "default_lazy")]
    pub lazy: bool,

    #[serde(default)]
    pub init_delay_ms: u64,

    #[serde(default)]
    pub fail_init: bool,

    #[serde(default)]
    pub methods: BTreeMap<String, MethodBehavior>,
}

fn default_lazy() -> bool {
    true
}

impl ServiceSpec {
    fn simulated(&self) -> SimulatedSpec {
        SimulatedSpec {
            name: self.name.clone(),
            dependencies: self.dependencies.clone(),
            priority: self.priority,
            critical: self.critical,
            lazy: self.lazy,
            init_delay_ms: self.init_delay_ms,
            fail_init: self.fail_init,
            methods: self
                .methods
                .iter()
                .map(|(name, behavior)| (name.clone(), behavior.clone()))
                .collect(),
        }
    }
}

/// A scripted call, repeated `count` times
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSpec {
    pub service: String,
    pub method: String,

    #[serde(default = "default_count")]
    pub count: u32,

    #[serde(default)]
    pub args: Vec<Value>,

    pub retry_policy: Option<String>,
    pub timeout_policy: Option<String>,
    pub rate_limit_policy: Option<String>,
    pub bulkhead_policy: Option<String>,
}

fn default_count() -> u32 {
    1
}

impl CallSpec {
    /// Mesh options for this call
    pub fn options(&self) -> CallOptions {
        CallOptions {
            retry_policy: self.retry_policy.clone(),
            timeout_policy: self.timeout_policy.clone(),
            rate_limit_policy: self.rate_limit_policy.clone(),
            bulkhead_policy: self.bulkhead_policy.clone(),
            cancel: None,
        }
    }
}
