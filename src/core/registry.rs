//! Service registry: definitions, lazy loading, health and breakers.
//!
//! Each service lives in its own slot. A slot holds the loaded instance in a
//! `OnceLock`, the shared in-flight load future that coalesces concurrent
//! first-time callers, the service's circuit breaker, and its health and
//! load statistics. Nothing here takes a registry-wide lock except
//! registration and the short read of the slot map.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, try_join_all, BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::error::{ConfigurationError, MeshError, UnavailableReason};
use super::graph::{self, GraphNode};
use crate::domain::{HealthState, HealthStatus, ServiceDefinition, ServiceInstance};
use crate::resilience::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};

type LoadFuture = Shared<BoxFuture<'static, Result<ServiceInstance, MeshError>>>;

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Breaker settings applied to every service
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Interval of the background health check in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Load durations kept per service for averaging
    #[serde(default = "default_load_history")]
    pub load_history: usize,
}

fn default_health_interval() -> u64 {
    30_000
}
fn default_load_history() -> usize {
    100
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check_interval_ms: default_health_interval(),
            load_history: default_load_history(),
        }
    }
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Outcome of a batch load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<LoadFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadFailure {
    pub service: String,
    pub error: String,
}

impl LoadReport {
    /// True when nothing failed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Load statistics for one service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceLoadMetrics {
    pub loads: u64,
    pub failures: u64,
    pub average_load_time_ms: f64,
    pub last_load_time_ms: Option<u64>,
}

/// Registry-wide metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryMetrics {
    pub total_services: usize,
    pub loaded: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub load_failures: u64,
    pub average_load_time_ms: f64,
    pub open_circuits: Vec<String>,
    pub services: BTreeMap<String, ServiceLoadMetrics>,
}

#[derive(Debug, Default)]
struct LoadStats {
    load_times: VecDeque<u64>,
    loads: u64,
    failures: u64,
}

/// Health and statistics shared by every generation of a slot
#[derive(Debug)]
struct SlotState {
    health: AtomicU8,
    status: Mutex<HealthStatus>,
    stats: Mutex<LoadStats>,
}

impl SlotState {
    fn new() -> Self {
        Self {
            health: AtomicU8::new(HealthState::Unknown.as_u8()),
            status: Mutex::new(HealthStatus::unknown()),
            stats: Mutex::new(LoadStats::default()),
        }
    }

    fn health(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::Acquire))
    }

    fn set(&self, state: HealthState, error: Option<String>) {
        let mut status = self.status.lock();
        status.state = state;
        status.last_check = Some(Utc::now());
        status.error = error;
        self.health.store(state.as_u8(), Ordering::Release);
    }

    fn record_load(&self, elapsed_ms: u64, keep: usize) {
        {
            let mut stats = self.stats.lock();
            stats.loads += 1;
            stats.load_times.push_back(elapsed_ms);
            while stats.load_times.len() > keep {
                stats.load_times.pop_front();
            }
        }
        self.status.lock().load_time_ms = Some(elapsed_ms);
        self.set(HealthState::Healthy, None);
    }

    fn record_load_failure(&self, error: String) {
        self.stats.lock().failures += 1;
        self.set(HealthState::Unhealthy, Some(error));
    }

    fn metrics(&self) -> ServiceLoadMetrics {
        let stats = self.stats.lock();
        let average = if stats.load_times.is_empty() {
            0.0
        } else {
            stats.load_times.iter().sum::<u64>() as f64 / stats.load_times.len() as f64
        };
        ServiceLoadMetrics {
            loads: stats.loads,
            failures: stats.failures,
            average_load_time_ms: average,
            last_load_time_ms: stats.load_times.back().copied(),
        }
    }
}

struct Loaded {
    instance: ServiceInstance,
    /// Transitive dependencies, checked on every cache hit
    dependencies: Vec<(String, Arc<SlotState>)>,
}

enum Resolution<'a> {
    Ready(&'a Loaded),
    Pending(LoadFuture),
}

struct ServiceSlot {
    definition: ServiceDefinition,
    breaker: Arc<CircuitBreaker>,
    state: Arc<SlotState>,
    loaded: OnceLock<Loaded>,
    loading: Mutex<Option<LoadFuture>>,
}

impl ServiceSlot {
    fn new(definition: ServiceDefinition, breaker: CircuitBreakerConfig) -> Self {
        Self {
            breaker: Arc::new(CircuitBreaker::new(definition.name.clone(), breaker)),
            state: Arc::new(SlotState::new()),
            definition,
            loaded: OnceLock::new(),
            loading: Mutex::new(None),
        }
    }

    /// Fresh generation without an instance, keeping breaker and statistics
    fn reset(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            breaker: self.breaker.clone(),
            state: self.state.clone(),
            loaded: OnceLock::new(),
            loading: Mutex::new(None),
        }
    }
}

struct RegistryInner {
    config: RegistryConfig,
    slots: RwLock<HashMap<String, Arc<ServiceSlot>>>,
}

/// Cheaply cloneable handle to one service registry
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                slots: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Add a definition.
    ///
    /// Fails on duplicate names and on any registration that would close a
    /// dependency cycle. Dependencies may be registered later; `validate`
    /// reports those that never are.
    pub fn register(&self, definition: ServiceDefinition) -> Result<(), ConfigurationError> {
        let mut slots = self.inner.slots.write();
        if slots.contains_key(&definition.name) {
            return Err(ConfigurationError::DuplicateService(definition.name));
        }

        let cycle = {
            let mut nodes: Vec<GraphNode<'_>> =
                slots.values().map(|s| node(&s.definition)).collect();
            nodes.push(node(&definition));
            graph::find_cycle(&nodes)
        };
        if let Some(cycle) = cycle {
            return Err(ConfigurationError::CyclicDependency { cycle });
        }

        debug!(
            service = %definition.name,
            dependencies = ?definition.dependencies,
            critical = definition.critical,
            "Service registered"
        );
        let slot = ServiceSlot::new(definition, self.inner.config.circuit_breaker.clone());
        slots.insert(slot.definition.name.clone(), Arc::new(slot));
        Ok(())
    }

    /// Every dependency is registered and the graph is acyclic
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let slots = self.inner.slots.read();
        let nodes: Vec<GraphNode<'_>> = slots.values().map(|s| node(&s.definition)).collect();
        graph::check_dependencies(&nodes)?;
        match graph::find_cycle(&nodes) {
            Some(cycle) => Err(ConfigurationError::CyclicDependency { cycle }),
            None => Ok(()),
        }
    }

    /// Dependencies first; ties broken by priority then name
    pub fn load_order(&self) -> Result<Vec<String>, ConfigurationError> {
        let slots = self.inner.slots.read();
        let nodes: Vec<GraphNode<'_>> = slots.values().map(|s| node(&s.definition)).collect();
        graph::topological_order(&nodes)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.slots.read().contains_key(name)
    }

    /// Registered service names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.slots.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definition(&self, name: &str) -> Option<ServiceDefinition> {
        self.inner
            .slots
            .read()
            .get(name)
            .map(|s| s.definition.clone())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.slot(name)
            .map(|s| s.loaded.get().is_some())
            .unwrap_or(false)
    }

    /// Resolve a service, loading it and its dependencies on first use.
    ///
    /// Concurrent first-time callers share one load. An instance is only
    /// returned while every transitive dependency is healthy.
    pub async fn get(&self, name: &str) -> Result<ServiceInstance, MeshError> {
        let slot = self.slot(name)?;
        let loaded = match self.resolve(&slot) {
            Resolution::Ready(loaded) => loaded,
            Resolution::Pending(load) => return load.await,
        };

        // dependencies unloaded since this instance was cached load again
        for (dependency, state) in &loaded.dependencies {
            if state.health() != HealthState::Unloaded {
                continue;
            }
            let dependency = self.slot(dependency)?;
            if let Resolution::Pending(load) = self.resolve(&dependency) {
                if let Err(e) = load.await {
                    debug!(service = %name, error = %e, "Dependency reload failed");
                }
            }
        }

        check_dependencies(name, loaded)
    }

    /// Load every critical service, lowest priority first, concurrently.
    ///
    /// A failed service is reported, unrelated services still load.
    #[instrument(skip(self))]
    pub async fn load_critical(&self) -> Result<LoadReport, MeshError> {
        self.validate()?;

        let mut critical: Vec<ServiceDefinition> = self
            .definitions()
            .into_iter()
            .filter(|d| d.critical)
            .collect();
        critical.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

        let results = join_all(critical.iter().map(|d| self.get(&d.name))).await;

        let mut report = LoadReport::default();
        for (definition, result) in critical.iter().zip(results) {
            match result {
                Ok(_) => report.loaded.push(definition.name.clone()),
                Err(MeshError::Configuration(e)) => return Err(e.into()),
                Err(e) => {
                    error!(
                        service = %definition.name,
                        error = %e,
                        "Critical service failed to load"
                    );
                    report.failed.push(LoadFailure {
                        service: definition.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Critical services loaded"
        );
        Ok(report)
    }

    /// Preload non-critical services that are not lazy, in priority order
    pub async fn load_background(&self) -> LoadReport {
        let mut eager: Vec<ServiceDefinition> = self
            .definitions()
            .into_iter()
            .filter(|d| !d.critical && !d.lazy)
            .collect();
        eager.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

        let mut report = LoadReport::default();
        for definition in eager {
            match self.get(&definition.name).await {
                Ok(_) => report.loaded.push(definition.name),
                Err(e) => {
                    warn!(service = %definition.name, error = %e, "Background load failed");
                    report.failed.push(LoadFailure {
                        service: definition.name,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.loaded.is_empty() || !report.failed.is_empty() {
            info!(
                loaded = report.loaded.len(),
                failed = report.failed.len(),
                "Background services loaded"
            );
        }
        report
    }

    /// Health of one service; `Unknown` when never loaded or not registered
    pub fn health(&self, name: &str) -> HealthStatus {
        self.slot(name)
            .map(|s| s.state.status.lock().clone())
            .unwrap_or_default()
    }

    pub fn all_health(&self) -> HashMap<String, HealthStatus> {
        self.slots()
            .into_iter()
            .map(|s| (s.definition.name.clone(), s.state.status.lock().clone()))
            .collect()
    }

    /// Run `health_check` on every loaded service. Returns how many are healthy.
    pub async fn check_health(&self) -> usize {
        let loaded: Vec<Arc<ServiceSlot>> = self
            .slots()
            .into_iter()
            .filter(|s| s.loaded.get().is_some())
            .collect();

        let results = join_all(loaded.iter().map(|slot| evaluate(slot))).await;
        let healthy = results.into_iter().filter(|ok| *ok).count();
        debug!(checked = loaded.len(), healthy, "Health check finished");
        healthy
    }

    /// Re-evaluate one loaded service
    pub async fn refresh_health(&self, name: &str) -> HealthState {
        match self.slot(name) {
            Ok(slot) if slot.loaded.get().is_some() => {
                evaluate(&slot).await;
                slot.state.health()
            }
            Ok(slot) => slot.state.health(),
            Err(_) => HealthState::Unknown,
        }
    }

    /// Mark a service unhealthy without running its health check
    pub fn mark_unhealthy(&self, name: &str, error: String) {
        if let Ok(slot) = self.slot(name) {
            slot.state.set(HealthState::Unhealthy, Some(error));
        }
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.slot(name).ok().map(|s| s.breaker.clone())
    }

    pub fn circuit_states(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.slots()
            .into_iter()
            .map(|s| (s.definition.name.clone(), s.breaker.snapshot()))
            .collect()
    }

    pub fn metrics(&self) -> RegistryMetrics {
        let slots = self.slots();
        let mut metrics = RegistryMetrics {
            total_services: slots.len(),
            ..Default::default()
        };

        let mut load_time_sum = 0.0;
        let mut with_loads = 0usize;
        for slot in &slots {
            let name = slot.definition.name.clone();
            if slot.loaded.get().is_some() {
                metrics.loaded += 1;
            }
            match slot.state.health() {
                HealthState::Healthy => metrics.healthy += 1,
                HealthState::Unhealthy => metrics.unhealthy += 1,
                _ => {}
            }
            if slot.breaker.state() == CircuitState::Open {
                metrics.open_circuits.push(name.clone());
            }

            let service = slot.state.metrics();
            metrics.load_failures += service.failures;
            if service.last_load_time_ms.is_some() {
                load_time_sum += service.average_load_time_ms;
                with_loads += 1;
            }
            metrics.services.insert(name, service);
        }

        metrics.open_circuits.sort();
        if with_loads > 0 {
            metrics.average_load_time_ms = load_time_sum / with_loads as f64;
        }
        metrics
    }

    /// Drop a loaded instance; the next `get` loads it again
    pub fn unload(&self, name: &str) -> bool {
        let mut slots = self.inner.slots.write();
        let Some(slot) = slots.get(name) else {
            return false;
        };
        if slot.loaded.get().is_none() {
            return false;
        }

        let fresh = Arc::new(slot.reset());
        fresh.state.set(HealthState::Unloaded, None);
        slots.insert(name.to_string(), fresh);
        info!(service = %name, "Service unloaded");
        true
    }

    /// Drop every loaded instance
    pub fn unload_all(&self) -> usize {
        self.names().iter().filter(|n| self.unload(n)).count()
    }

    fn definitions(&self) -> Vec<ServiceDefinition> {
        self.slots().into_iter().map(|s| s.definition.clone()).collect()
    }

    fn slots(&self) -> Vec<Arc<ServiceSlot>> {
        self.inner.slots.read().values().cloned().collect()
    }

    fn slot(&self, name: &str) -> Result<Arc<ServiceSlot>, MeshError> {
        self.inner
            .slots
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownService(name.to_string()).into())
    }

    /// The cached instance, or the load to wait on. Only a miss takes the lock.
    fn resolve<'a>(&self, slot: &'a Arc<ServiceSlot>) -> Resolution<'a> {
        if let Some(loaded) = slot.loaded.get() {
            return Resolution::Ready(loaded);
        }

        let mut loading = slot.loading.lock();
        if let Some(loaded) = slot.loaded.get() {
            return Resolution::Ready(loaded);
        }
        let load = match loading.as_ref() {
            Some(load) => load.clone(),
            None => {
                let load = self.start_load(slot.clone());
                *loading = Some(load.clone());
                load
            }
        };
        Resolution::Pending(load)
    }

    fn start_load(&self, slot: Arc<ServiceSlot>) -> LoadFuture {
        let registry = self.clone();
        async move {
            let result = registry.load(&slot).await;
            *slot.loading.lock() = None;
            result
        }
        .boxed()
        .shared()
    }

    async fn load(&self, slot: &ServiceSlot) -> Result<ServiceInstance, MeshError> {
        let name = slot.definition.name.as_str();

        if slot.breaker.is_open() {
            debug!(service = %name, "Circuit open, refusing to load");
            return Err(MeshError::unavailable(name, UnavailableReason::CircuitOpen));
        }

        for dependency in &slot.definition.dependencies {
            if !self.contains(dependency) {
                return Err(ConfigurationError::UnknownDependency {
                    service: name.to_string(),
                    dependency: dependency.clone(),
                }
                .into());
            }
        }

        slot.state.set(HealthState::Loading, None);

        let resolved = try_join_all(slot.definition.dependencies.iter().map(|dep| async move {
            self.get(dep).await.map_err(|e| (dep.clone(), e))
        }))
        .await;

        if let Err((dependency, err)) = resolved {
            if let MeshError::Configuration(_) = err {
                slot.state.set(HealthState::Unknown, None);
                return Err(err);
            }
            let message = format!("dependency '{}' unavailable: {}", dependency, err);
            warn!(
                service = %name,
                dependency = %dependency,
                error = %err,
                "Dependency unavailable"
            );
            slot.state.set(HealthState::Unhealthy, Some(message));
            return Err(MeshError::unavailable(
                name,
                UnavailableReason::DependencyUnhealthy(dependency),
            ));
        }

        let dependencies = self.transitive_dependencies(&slot.definition);
        if let Some((dependency, _)) = dependencies
            .iter()
            .find(|(_, state)| state.health() != HealthState::Healthy)
        {
            slot.state.set(
                HealthState::Unhealthy,
                Some(format!("dependency '{}' is not healthy", dependency)),
            );
            return Err(MeshError::unavailable(
                name,
                UnavailableReason::DependencyUnhealthy(dependency.clone()),
            ));
        }

        let started = Instant::now();
        let instance = slot.definition.instantiate();
        let initialized = AssertUnwindSafe(instance.service().initialize())
            .catch_unwind()
            .await;

        let failure = match initialized {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(_) => Some("initialize panicked".to_string()),
        };

        if let Some(message) = failure {
            slot.breaker.record_failure();
            slot.state.record_load_failure(message.clone());
            error!(service = %name, error = %message, "Service failed to load");
            return Err(MeshError::unavailable(
                name,
                UnavailableReason::LoadFailed(message),
            ));
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        slot.state.record_load(elapsed_ms, self.inner.config.load_history);
        slot.breaker.record_success();

        let _ = slot.loaded.set(Loaded {
            instance: instance.clone(),
            dependencies,
        });
        info!(service = %name, load_ms = elapsed_ms, "Service loaded");
        Ok(instance)
    }

    /// Health handles of every transitive dependency, nearest first
    fn transitive_dependencies(
        &self,
        definition: &ServiceDefinition,
    ) -> Vec<(String, Arc<SlotState>)> {
        let slots = self.inner.slots.read();
        let mut seen: Vec<(String, Arc<SlotState>)> = Vec::new();
        let mut queue: VecDeque<&String> = definition.dependencies.iter().collect();

        while let Some(dep) = queue.pop_front() {
            if seen.iter().any(|(n, _)| n == dep) {
                continue;
            }
            if let Some(slot) = slots.get(dep) {
                seen.push((dep.clone(), slot.state.clone()));
                queue.extend(slot.definition.dependencies.iter());
            }
        }
        seen
    }
}

fn node(definition: &ServiceDefinition) -> GraphNode<'_> {
    GraphNode {
        name: &definition.name,
        priority: definition.priority,
        dependencies: &definition.dependencies,
    }
}

fn check_dependencies(name: &str, loaded: &Loaded) -> Result<ServiceInstance, MeshError> {
    for (dependency, state) in &loaded.dependencies {
        if state.health() != HealthState::Healthy {
            return Err(MeshError::unavailable(
                name,
                UnavailableReason::DependencyUnhealthy(dependency.clone()),
            ));
        }
    }
    Ok(loaded.instance.clone())
}

/// Run one service's health check and record the result
async fn evaluate(slot: &ServiceSlot) -> bool {
    let Some(loaded) = slot.loaded.get() else {
        return false;
    };
    let name = &slot.definition.name;
    let was = slot.state.health();

    let checked = AssertUnwindSafe(loaded.instance.service().health_check())
        .catch_unwind()
        .await;
    let (healthy, error) = match checked {
        Ok(Ok(true)) => (true, None),
        Ok(Ok(false)) => (false, Some("health check reported unhealthy".to_string())),
        Ok(Err(e)) => (false, Some(format!("{:#}", e))),
        Err(_) => (false, Some("health check panicked".to_string())),
    };

    if healthy {
        slot.state.set(HealthState::Healthy, None);
        if was == HealthState::Unhealthy {
            info!(service = %name, "Service recovered");
        }
    } else {
        if was != HealthState::Unhealthy {
            warn!(service = %name, error = ?error, "Service unhealthy");
        }
        slot.state.set(HealthState::Unhealthy, error);
    }
    healthy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Service;
    use anyhow::bail;
    use async_trait::async_trait;

    struct Plain;
    impl Service for Plain {}

    struct Broken;

    #[async_trait]
    impl Service for Broken {
        async fn initialize(&self) -> anyhow::Result<()> {
            bail!("no config")
        }
    }

    fn plain(name: &str, deps: &[&str]) -> ServiceDefinition {
        ServiceDefinition::builder(name, || Plain)
            .depends_on(deps.iter().copied())
            .build()
    }

    #[tokio::test]
    async fn test_cache_hit_skips_load_lock() {
        let registry = ServiceRegistry::default();
        registry.register(plain("a", &[])).unwrap();
        registry.get("a").await.unwrap();

        // a hit must not wait on the per-slot load lock
        let slot = registry.slot("a").unwrap();
        let _held = slot.loading.lock();
        let hit = registry.get("a").now_or_never();
        assert!(matches!(hit, Some(Ok(_))));
    }

    #[test]
    fn test_rejects_duplicates_and_cycles() {
        let registry = ServiceRegistry::default();
        registry.register(plain("a", &["b"])).unwrap();

        assert_eq!(
            registry.register(plain("a", &[])),
            Err(ConfigurationError::DuplicateService("a".into()))
        );
        assert!(matches!(
            registry.register(plain("b", &["a"])),
            Err(ConfigurationError::CyclicDependency { .. })
        ));
        assert!(!registry.contains("b"));
    }

    #[test]
    fn test_validate_reports_missing_dependency() {
        let registry = ServiceRegistry::default();
        registry.register(plain("a", &["ghost"])).unwrap();

        assert_eq!(
            registry.validate(),
            Err(ConfigurationError::UnknownDependency {
                service: "a".into(),
                dependency: "ghost".into()
            })
        );
    }

    #[tokio::test]
    async fn test_get_loads_once_and_caches() {
        let registry = ServiceRegistry::default();
        registry.register(plain("a", &[])).unwrap();
        registry.register(plain("b", &["a"])).unwrap();

        let first = registry.get("b").await.unwrap();
        let second = registry.get("b").await.unwrap();
        assert!(first.same_instance(&second));
        assert!(registry.is_loaded("a"));
        assert_eq!(registry.health("b").state, HealthState::Healthy);
        assert_eq!(registry.metrics().loaded, 2);
    }

    #[tokio::test]
    async fn test_failed_load_counts_on_breaker() {
        let registry = ServiceRegistry::default();
        registry
            .register(ServiceDefinition::builder("broken", || Broken).build())
            .unwrap();

        let err = registry.get("broken").await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::ServiceUnavailable {
                reason: UnavailableReason::LoadFailed(_),
                ..
            }
        ));
        assert_eq!(registry.breaker("broken").unwrap().failures(), 1);
        assert_eq!(registry.health("broken").state, HealthState::Unhealthy);
        assert_eq!(registry.metrics().load_failures, 1);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let registry = ServiceRegistry::default();
        assert!(matches!(
            registry.get("nope").await,
            Err(MeshError::Configuration(ConfigurationError::UnknownService(_)))
        ));
        assert_eq!(registry.health("nope").state, HealthState::Unknown);
    }

    #[tokio::test]
    async fn test_unload_forces_reload() {
        let registry = ServiceRegistry::default();
        registry.register(plain("a", &[])).unwrap();

        let first = registry.get("a").await.unwrap();
        assert!(registry.unload("a"));
        assert_eq!(registry.health("a").state, HealthState::Unloaded);
        assert!(!registry.unload("a"));

        let second = registry.get("a").await.unwrap();
        assert!(!first.same_instance(&second));
        assert_eq!(registry.metrics().services["a"].loads, 2);
    }
}
