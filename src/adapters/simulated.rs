//! Simulated services driven by topology files.
//!
//! Each method has a fixed latency and can be told to fail its first N
//! calls or to fail at random with a given probability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::domain::{CallArgs, Service, ServiceDefinition};

/// Behavior of one simulated method
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodBehavior {
    /// Time each call takes
    #[serde(default)]
    pub latency_ms: u64,

    /// Number of initial calls that fail
    #[serde(default)]
    pub fail_first: u32,

    /// Probability (0.0 - 1.0) that any later call fails
    #[serde(default)]
    pub failure_rate: f64,
}

/// A service whose behavior is scripted rather than real
#[derive(Debug)]
pub struct SimulatedService {
    name: String,
    init_delay: Duration,
    fail_init: bool,
    methods: HashMap<String, MethodBehavior>,
    calls: HashMap<String, AtomicU32>,
    health_failures: AtomicU32,
}

impl SimulatedService {
    pub fn new(
        name: impl Into<String>,
        init_delay: Duration,
        fail_init: bool,
        methods: HashMap<String, MethodBehavior>,
    ) -> Self {
        let calls = methods
            .keys()
            .map(|m| (m.clone(), AtomicU32::new(0)))
            .collect();
        Self {
            name: name.into(),
            init_delay,
            fail_init,
            methods,
            calls,
            health_failures: AtomicU32::new(0),
        }
    }

    /// Calls made to `method` so far
    pub fn call_count(&self, method: &str) -> u32 {
        self.calls
            .get(method)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Make the next `n` health checks report unhealthy
    pub fn fail_health_checks(&self, n: u32) {
        self.health_failures.store(n, Ordering::SeqCst);
    }

    async fn handle(&self, method: &str, args: CallArgs) -> Result<Value> {
        let Some(behavior) = self.methods.get(method) else {
            bail!("{} has no method '{}'", self.name, method);
        };
        let call = self
            .calls
            .get(method)
            .map(|c| c.fetch_add(1, Ordering::SeqCst) + 1)
            .unwrap_or(1);

        if behavior.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(behavior.latency_ms)).await;
        }

        if call <= behavior.fail_first {
            bail!(
                "{}.{} failed (call {} of {} scripted failures)",
                self.name,
                method,
                call,
                behavior.fail_first
            );
        }
        if behavior.failure_rate > 0.0
            && rand::thread_rng().gen_bool(behavior.failure_rate.min(1.0))
        {
            bail!("{}.{} failed at random", self.name, method);
        }

        debug!(service = %self.name, method, call, "Simulated call");
        Ok(json!({
            "service": self.name,
            "method": method,
            "call": call,
            "args": args,
        }))
    }
}

#[async_trait]
impl Service for SimulatedService {
    async fn initialize(&self) -> Result<()> {
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        if self.fail_init {
            bail!("{} failed to initialize", self.name);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let pending = self.health_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.health_failures.store(pending - 1, Ordering::SeqCst);
            return Ok(false);
        }
        Ok(true)
    }
}

/// Blueprint for a simulated service definition
#[derive(Debug, Clone, Default)]
pub struct SimulatedSpec {
    pub name: String,
    pub dependencies: Vec<String>,
    pub priority: i32,
    pub critical: bool,
    pub lazy: bool,
    pub init_delay_ms: u64,
    pub fail_init: bool,
    pub methods: HashMap<String, MethodBehavior>,
}

impl SimulatedSpec {
    /// Build a registry definition whose method table mirrors `methods`
    pub fn definition(&self) -> ServiceDefinition {
        let name = self.name.clone();
        let init_delay = Duration::from_millis(self.init_delay_ms);
        let fail_init = self.fail_init;
        let methods = self.methods.clone();

        let mut builder = ServiceDefinition::builder(self.name.clone(), move || {
            SimulatedService::new(name.clone(), init_delay, fail_init, methods.clone())
        })
        .depends_on(self.dependencies.iter().cloned())
        .priority(self.priority)
        .critical(self.critical)
        .lazy(self.lazy);

        for method in self.methods.keys() {
            let method = method.clone();
            builder = builder.method(method.clone(), move |svc: Arc<SimulatedService>, args| {
                let method = method.clone();
                async move { svc.handle(&method, args).await }
            });
        }

        builder.build()
    }
}
