//! Service mesh: resilient calls between services.
//!
//! Every call runs through: rate limit → circuit breaker → registry lookup
//! → bulkhead (optional) → timeout, inside a retry loop with backoff.
//! Outcomes are published on the event bus as `service_call_success` and
//! `service_call_failure`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::{ConfigurationError, MeshError, UnavailableReason};
use super::monitor::{AlertConfig, AlertMonitor};
use super::registry::ServiceRegistry;
use super::tasks::CancelToken;
use crate::bus::EventBus;
use crate::domain::{event_types, payload, AlertType, CallArgs, Payload};
use crate::resilience::{
    Bulkhead, BulkheadPolicy, CircuitBreaker, CircuitState, PolicyCatalog, RateLimitPolicy,
    RateLimiter, RetryPolicy, TimeoutPolicy, DEFAULT_POLICY,
};

/// Mesh configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Named presets, layered over the built-in ones
    #[serde(default)]
    pub policies: PolicyCatalog,

    /// Interval of metrics aggregation in milliseconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_ms: u64,

    /// Window for throughput and recent error rate, in milliseconds
    #[serde(default = "default_recent_window")]
    pub recent_window_ms: u64,

    #[serde(default)]
    pub alerts: AlertConfig,

    /// Publish call outcome and alert events on the bus
    #[serde(default = "default_emit_events")]
    pub emit_events: bool,
}

fn default_metrics_interval() -> u64 {
    60_000
}
fn default_recent_window() -> u64 {
    60_000
}
fn default_emit_events() -> bool {
    true
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            policies: PolicyCatalog::default(),
            metrics_interval_ms: default_metrics_interval(),
            recent_window_ms: default_recent_window(),
            alerts: AlertConfig::default(),
            emit_events: default_emit_events(),
        }
    }
}

impl MeshConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

/// Per-call policy selection by preset name; `None` means "default"
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub retry_policy: Option<String>,
    pub timeout_policy: Option<String>,
    pub rate_limit_policy: Option<String>,
    /// No bulkhead unless a preset is named
    pub bulkhead_policy: Option<String>,
    pub cancel: Option<CancelToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, preset: impl Into<String>) -> Self {
        self.retry_policy = Some(preset.into());
        self
    }

    pub fn timeout(mut self, preset: impl Into<String>) -> Self {
        self.timeout_policy = Some(preset.into());
        self
    }

    pub fn rate_limit(mut self, preset: impl Into<String>) -> Self {
        self.rate_limit_policy = Some(preset.into());
        self
    }

    pub fn bulkhead(mut self, preset: impl Into<String>) -> Self {
        self.bulkhead_policy = Some(preset.into());
        self
    }

    pub fn cancel_with(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

struct ResolvedPolicies {
    retry: RetryPolicy,
    timeout: TimeoutPolicy,
    rate_limit: RateLimitPolicy,
    bulkhead: Option<(String, BulkheadPolicy)>,
}

/// Call metrics for one service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceCallMetrics {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_duration_ms: f64,
    pub requests_last_window: u64,
    pub errors_last_window: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub rate_limited: u64,
    pub bulkhead_rejections: u64,
    pub circuit_rejections: u64,
    pub last_request: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Mesh-wide aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMetrics {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_response_time_ms: f64,
    /// Requests in the recent window, all services
    pub throughput: u64,
    pub open_circuits: Vec<String>,
    pub services: BTreeMap<String, ServiceCallMetrics>,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CallStats {
    total: u64,
    successful: u64,
    failed: u64,
    total_duration_ms: u64,
    retries: u64,
    timeouts: u64,
    rate_limited: u64,
    bulkhead_rejections: u64,
    circuit_rejections: u64,
    recent: VecDeque<(Instant, bool)>,
    last_request: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl CallStats {
    fn record(&mut self, success: bool, duration_ms: u64, error: Option<String>) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
            self.last_error = error;
        }
        self.total_duration_ms += duration_ms;
        self.recent.push_back((Instant::now(), success));
        self.last_request = Some(Utc::now());
    }

    fn snapshot(&mut self, window: Duration) -> ServiceCallMetrics {
        let now = Instant::now();
        while let Some((at, _)) = self.recent.front() {
            if now.duration_since(*at) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        ServiceCallMetrics {
            total_requests: self.total,
            successful: self.successful,
            failed: self.failed,
            average_duration_ms: if self.total == 0 {
                0.0
            } else {
                self.total_duration_ms as f64 / self.total as f64
            },
            requests_last_window: self.recent.len() as u64,
            errors_last_window: self.recent.iter().filter(|(_, ok)| !ok).count() as u64,
            retries: self.retries,
            timeouts: self.timeouts,
            rate_limited: self.rate_limited,
            bulkhead_rejections: self.bulkhead_rejections,
            circuit_rejections: self.circuit_rejections,
            last_request: self.last_request,
            last_error: self.last_error.clone(),
        }
    }
}

/// Mesh-side state for one service, each part behind its own lock
#[derive(Default)]
struct ServiceLane {
    limiter: Mutex<RateLimiter>,
    bulkheads: Mutex<HashMap<String, Arc<Bulkhead>>>,
    stats: Mutex<CallStats>,
}

impl ServiceLane {
    fn bulkhead(&self, preset: &str, policy: &BulkheadPolicy) -> Arc<Bulkhead> {
        self.bulkheads
            .lock()
            .entry(preset.to_string())
            .or_insert_with(|| Arc::new(Bulkhead::new(policy.clone())))
            .clone()
    }
}

struct MeshInner {
    config: MeshConfig,
    policies: PolicyCatalog,
    registry: ServiceRegistry,
    bus: EventBus,
    lanes: RwLock<HashMap<String, Arc<ServiceLane>>>,
    monitor: AlertMonitor,
}

/// Cheaply cloneable handle to the service mesh
#[derive(Clone)]
pub struct ServiceMesh {
    inner: Arc<MeshInner>,
}

impl std::fmt::Debug for ServiceMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMesh")
            .field("registry", &self.inner.registry)
            .finish()
    }
}

impl ServiceMesh {
    pub fn new(config: MeshConfig, registry: ServiceRegistry, bus: EventBus) -> Self {
        let mut policies = PolicyCatalog::default();
        policies.merge(config.policies.clone());

        Self {
            inner: Arc::new(MeshInner {
                monitor: AlertMonitor::new(config.alerts.clone()),
                policies,
                registry,
                bus,
                lanes: RwLock::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    /// Effective presets (built-in plus configured)
    pub fn policies(&self) -> &PolicyCatalog {
        &self.inner.policies
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Call `method` on `service` through the resilience pipeline
    #[instrument(skip(self, args, options), fields(service = %service, method = %method))]
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        args: CallArgs,
        options: CallOptions,
    ) -> Result<Value, MeshError> {
        let policies = self.resolve(&options)?;
        if !self.inner.registry.contains(service) {
            return Err(ConfigurationError::UnknownService(service.to_string()).into());
        }

        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let lane = self.lane(service);

        let limit = policies.rate_limit.requests_per_minute;
        let admitted = lane.limiter.lock().try_admit(limit);
        if !admitted {
            lane.stats.lock().rate_limited += 1;
            warn!(limit, "Rate limit exceeded");
            self.alert(
                service,
                AlertType::RateLimitThrottle,
                json!({ "limit": limit, "requestId": request_id.to_string() }),
            )
            .await;
            let err = MeshError::RateLimitExceeded {
                service: service.to_string(),
                limit,
            };
            return Err(self.fail(service, method, &lane, request_id, started, 0, err).await);
        }

        let cancel = options.cancel.as_ref();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let result = self
                .attempt(service, method, &args, &policies, &lane, cancel)
                .await;

            let err = match result {
                Ok(value) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    lane.stats.lock().record(true, duration_ms, None);
                    debug!(attempt, duration_ms, "Call succeeded");
                    self.emit(
                        event_types::SERVICE_CALL_SUCCESS,
                        json!({
                            "serviceName": service,
                            "method": method,
                            "durationMs": duration_ms,
                            "attempts": attempt,
                            "requestId": request_id.to_string(),
                            "timestamp": Utc::now().to_rfc3339(),
                        }),
                    )
                    .await;
                    return Ok(value);
                }
                Err(err) => err,
            };

            let retry = err.is_retryable() && policies.retry.should_retry(attempt);
            if !retry {
                return Err(self
                    .fail(service, method, &lane, request_id, started, attempt, err)
                    .await);
            }

            let delay = policies.retry.delay_for_attempt(attempt - 1);
            lane.stats.lock().retries += 1;
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Call failed, retrying"
            );

            let cancelled = tokio::select! {
                _ = wait_cancelled(cancel) => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                let err = MeshError::Cancelled {
                    service: service.to_string(),
                };
                return Err(self
                    .fail(service, method, &lane, request_id, started, attempt, err)
                    .await);
            }
        }
    }

    /// One pass through breaker, lookup, bulkhead and timeout
    async fn attempt(
        &self,
        service: &str,
        method: &str,
        args: &CallArgs,
        policies: &ResolvedPolicies,
        lane: &ServiceLane,
        cancel: Option<&CancelToken>,
    ) -> Result<Value, MeshError> {
        if cancel.map_or(false, CancelToken::is_cancelled) {
            return Err(MeshError::Cancelled {
                service: service.to_string(),
            });
        }

        let breaker = self
            .inner
            .registry
            .breaker(service)
            .ok_or_else(|| ConfigurationError::UnknownService(service.to_string()))?;

        if breaker.try_acquire().is_err() {
            lane.stats.lock().circuit_rejections += 1;
            return Err(MeshError::unavailable(service, UnavailableReason::CircuitOpen));
        }

        let trips_before = breaker.snapshot().trips;
        let loaded = tokio::select! {
            loaded = self.inner.registry.get(service) => loaded,
            _ = wait_cancelled(cancel) => {
                return Err(MeshError::Cancelled {
                    service: service.to_string(),
                });
            }
        };
        let instance = match loaded {
            Ok(instance) => instance,
            Err(err) => {
                // load failures are already counted by the registry
                if let MeshError::ServiceUnavailable {
                    reason: UnavailableReason::DependencyUnhealthy(_),
                    ..
                } = err
                {
                    breaker.record_failure();
                }
                if breaker.snapshot().trips > trips_before {
                    self.breaker_opened(service, &breaker).await;
                }
                return Err(err);
            }
        };

        if !instance.has_method(method) {
            return Err(MeshError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            });
        }

        let permit = match &policies.bulkhead {
            Some((preset, policy)) => tokio::select! {
                entered = self.enter_bulkhead(service, lane, preset, policy) => Some(entered?),
                _ = wait_cancelled(cancel) => {
                    return Err(MeshError::Cancelled {
                        service: service.to_string(),
                    });
                }
            },
            None => None,
        };

        let Some(invocation) = instance.invoke(method, args.clone()) else {
            return Err(MeshError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            });
        };

        let mut task = tokio::spawn(async move {
            let _permit = permit;
            invocation.await
        });

        let timeout = policies.timeout.duration();
        let outcome = tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(MeshError::ServiceFailed {
                    service: service.to_string(),
                    message: format!("{:#}", e),
                }),
                Err(join_err) => Err(MeshError::ServiceFailed {
                    service: service.to_string(),
                    message: if join_err.is_panic() {
                        format!("method '{}' panicked", method)
                    } else {
                        format!("method '{}' was aborted", method)
                    },
                }),
            },
            _ = tokio::time::sleep(timeout) => {
                // the invocation keeps running detached; its result is discarded
                lane.stats.lock().timeouts += 1;
                Err(MeshError::Timeout {
                    service: service.to_string(),
                    method: method.to_string(),
                    timeout_ms: policies.timeout.timeout_ms,
                })
            }
            _ = wait_cancelled(cancel) => {
                task.abort();
                return Err(MeshError::Cancelled {
                    service: service.to_string(),
                });
            }
        };

        match outcome {
            Ok(value) => {
                breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                if breaker.record_failure() {
                    self.breaker_opened(service, &breaker).await;
                }
                self.inner.registry.refresh_health(service).await;
                Err(err)
            }
        }
    }

    async fn enter_bulkhead(
        &self,
        service: &str,
        lane: &ServiceLane,
        preset: &str,
        policy: &BulkheadPolicy,
    ) -> Result<OwnedSemaphorePermit, MeshError> {
        let bulkhead = lane.bulkhead(preset, policy);
        match bulkhead.acquire().await {
            Ok(permit) => Ok(permit),
            Err(rejected) => {
                lane.stats.lock().bulkhead_rejections += 1;
                warn!(
                    service = %service,
                    max_concurrency = rejected.max_concurrency,
                    queued = rejected.queued,
                    "Bulkhead full"
                );
                self.alert(
                    service,
                    AlertType::BulkheadOverload,
                    json!({
                        "maxConcurrency": rejected.max_concurrency,
                        "queued": rejected.queued,
                    }),
                )
                .await;
                Err(MeshError::BulkheadFull {
                    service: service.to_string(),
                    max_concurrency: rejected.max_concurrency,
                })
            }
        }
    }

    /// Record a failed call, publish the failure event, hand the error back
    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        service: &str,
        method: &str,
        lane: &ServiceLane,
        request_id: Uuid,
        started: Instant,
        attempts: u32,
        err: MeshError,
    ) -> MeshError {
        let duration_ms = started.elapsed().as_millis() as u64;
        lane.stats
            .lock()
            .record(false, duration_ms, Some(err.to_string()));

        error!(
            service = %service,
            method = %method,
            attempts,
            duration_ms,
            error = %err,
            "Call failed"
        );

        self.emit(
            event_types::SERVICE_CALL_FAILURE,
            json!({
                "serviceName": service,
                "method": method,
                "durationMs": duration_ms,
                "errorMessage": err.to_string(),
                "errorKind": err.kind(),
                "attempts": attempts,
                "requestId": request_id.to_string(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;
        err
    }

    async fn breaker_opened(&self, service: &str, breaker: &CircuitBreaker) {
        let snapshot = breaker.snapshot();
        self.alert(
            service,
            AlertType::CircuitBreakerOpen,
            json!({
                "failures": snapshot.failures,
                "threshold": breaker.config().failure_threshold,
                "resetTimeoutMs": breaker.config().reset_timeout_ms,
            }),
        )
        .await;
    }

    /// Call metrics for one service
    pub fn service_metrics(&self, service: &str) -> Option<ServiceCallMetrics> {
        let lane = self.inner.lanes.read().get(service).cloned()?;
        let window = self.recent_window();
        let snapshot = lane.stats.lock().snapshot(window);
        Some(snapshot)
    }

    /// Fold per-service metrics into one view
    pub fn metrics(&self) -> MeshMetrics {
        let window = self.recent_window();
        let lanes: Vec<(String, Arc<ServiceLane>)> = self
            .inner
            .lanes
            .read()
            .iter()
            .map(|(name, lane)| (name.clone(), lane.clone()))
            .collect();

        let mut services = BTreeMap::new();
        let (mut total, mut successful, mut failed, mut throughput) = (0, 0, 0, 0);
        let mut weighted_duration = 0.0;
        for (name, lane) in lanes {
            let snapshot = lane.stats.lock().snapshot(window);
            total += snapshot.total_requests;
            successful += snapshot.successful;
            failed += snapshot.failed;
            throughput += snapshot.requests_last_window;
            weighted_duration += snapshot.average_duration_ms * snapshot.total_requests as f64;
            services.insert(name, snapshot);
        }

        let open_circuits = self
            .inner
            .registry
            .circuit_states()
            .into_iter()
            .filter(|(_, s)| s.state == CircuitState::Open)
            .map(|(name, _)| name)
            .collect();

        MeshMetrics {
            total_requests: total,
            successful,
            failed,
            average_response_time_ms: if total == 0 {
                0.0
            } else {
                weighted_duration / total as f64
            },
            throughput,
            open_circuits,
            services,
            collected_at: Utc::now(),
        }
    }

    /// Aggregate metrics and raise `monitoring_alert` for services over the error threshold
    pub async fn aggregate_metrics(&self) -> MeshMetrics {
        let metrics = self.metrics();

        for (name, service) in &metrics.services {
            let Some(alert) = self.inner.monitor.evaluate(
                name,
                service.requests_last_window,
                service.errors_last_window,
            ) else {
                continue;
            };

            warn!(
                service = %name,
                error_rate = alert.error_rate,
                requests = alert.requests,
                "High error rate"
            );
            let mut body = payload(json!({
                "errorRate": alert.error_rate,
                "requests": alert.requests,
                "threshold": alert.threshold,
            }));
            stamp(&mut body, name, AlertType::HighErrorRate);
            self.publish(event_types::MONITORING_ALERT, body).await;
        }

        info!(
            total_requests = metrics.total_requests,
            average_ms = metrics.average_response_time_ms,
            throughput = metrics.throughput,
            open_circuits = metrics.open_circuits.len(),
            "Mesh metrics aggregated"
        );
        metrics
    }

    fn resolve(&self, options: &CallOptions) -> Result<ResolvedPolicies, MeshError> {
        let catalog = &self.inner.policies;
        let pick =
            |name: &Option<String>| name.clone().unwrap_or_else(|| DEFAULT_POLICY.to_string());
        let unknown = |kind: &'static str, name: String| MeshError::UnknownPolicy { kind, name };

        let name = pick(&options.retry_policy);
        let retry = catalog.retry(&name).cloned().ok_or_else(|| unknown("retry", name))?;

        let name = pick(&options.timeout_policy);
        let timeout = catalog
            .timeout(&name)
            .cloned()
            .ok_or_else(|| unknown("timeout", name))?;

        let name = pick(&options.rate_limit_policy);
        let rate_limit = catalog
            .rate_limit(&name)
            .cloned()
            .ok_or_else(|| unknown("rate_limit", name))?;

        let bulkhead = match &options.bulkhead_policy {
            Some(name) => {
                let policy = catalog
                    .bulkhead(name)
                    .cloned()
                    .ok_or_else(|| unknown("bulkhead", name.clone()))?;
                Some((name.clone(), policy))
            }
            None => None,
        };

        Ok(ResolvedPolicies {
            retry,
            timeout,
            rate_limit,
            bulkhead,
        })
    }

    fn lane(&self, service: &str) -> Arc<ServiceLane> {
        if let Some(lane) = self.inner.lanes.read().get(service) {
            return lane.clone();
        }
        self.inner
            .lanes
            .write()
            .entry(service.to_string())
            .or_default()
            .clone()
    }

    fn recent_window(&self) -> Duration {
        Duration::from_millis(self.inner.config.recent_window_ms)
    }

    async fn alert(&self, service: &str, alert_type: AlertType, details: Value) {
        let mut body = payload(details);
        stamp(&mut body, service, alert_type);
        self.publish(event_types::RESILIENCE_ALERT, body).await;
    }

    async fn emit(&self, event_type: &str, body: Value) {
        self.publish(event_type, payload(body)).await;
    }

    async fn publish(&self, event_type: &str, body: Payload) {
        if !self.inner.config.emit_events {
            return;
        }
        if let Err(e) = self.inner.bus.publish(event_type, body).await {
            warn!(event_type, error = %e, "Failed to publish mesh event");
        }
    }
}

fn stamp(body: &mut Payload, service: &str, alert_type: AlertType) {
    body.insert("serviceName".to_string(), Value::from(service));
    body.insert("alertType".to_string(), Value::from(alert_type.as_str()));
    body.insert("timestamp".to_string(), Value::from(Utc::now().to_rfc3339()));
}

async fn wait_cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::core::registry::RegistryConfig;
    use crate::domain::{Service, ServiceDefinition};

    struct Echo;
    impl Service for Echo {}

    fn mesh() -> ServiceMesh {
        let registry = ServiceRegistry::new(RegistryConfig::default());
        registry
            .register(
                ServiceDefinition::builder("echo", || Echo)
                    .method("say", |_svc: Arc<Echo>, args: CallArgs| async move {
                        Ok(args.into_iter().next().unwrap_or(Value::Null))
                    })
                    .build(),
            )
            .unwrap();
        ServiceMesh::new(MeshConfig::default(), registry, EventBus::new(BusConfig::default()))
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let mesh = mesh();
        let value = mesh
            .call("echo", "say", vec![json!("hi")], CallOptions::new())
            .await
            .unwrap();
        assert_eq!(value, json!("hi"));

        let metrics = mesh.service_metrics("echo").unwrap();
        assert_eq!(metrics.successful, 1);
        assert_eq!(metrics.requests_last_window, 1);
    }

    #[tokio::test]
    async fn test_unknown_preset_is_rejected() {
        let mesh = mesh();
        let err = mesh
            .call("echo", "say", vec![], CallOptions::new().retry("reckless"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::UnknownPolicy { kind: "retry", .. }));
        assert!(mesh.service_metrics("echo").is_none());
    }

    #[tokio::test]
    async fn test_method_not_found_is_not_retried() {
        let mesh = mesh();
        let err = mesh
            .call("echo", "shout", vec![], CallOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::MethodNotFound { .. }));
        assert_eq!(mesh.service_metrics("echo").unwrap().retries, 0);
        assert_eq!(mesh.registry().breaker("echo").unwrap().failures(), 0);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let mesh = mesh();
        let err = mesh
            .call("nope", "say", vec![], CallOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::Configuration(ConfigurationError::UnknownService(_))
        ));
    }

    #[test]
    fn test_config_merges_presets() {
        let config: MeshConfig = serde_yaml::from_str(
            r#"
policies:
  timeout:
    instant:
      timeout_ms: 5
"#,
        )
        .unwrap();
        let mesh = ServiceMesh::new(config, ServiceRegistry::default(), EventBus::default());
        assert_eq!(mesh.policies().timeout("instant").unwrap().timeout_ms, 5);
        assert_eq!(mesh.policies().timeout("fast").unwrap().timeout_ms, 10_000);
    }
}
