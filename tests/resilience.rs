//! Resilience Integration Tests
//!
//! Breaker recovery, bulkhead queueing and the rate limit window, mostly
//! driven through mesh calls on a paused clock.

use std::collections::HashMap;
use std::time::Duration;

use meshkit::adapters::{MethodBehavior, SimulatedSpec};
use meshkit::bus::EventBus;
use meshkit::core::{
    CallOptions, CancelToken, MeshConfig, MeshError, RegistryConfig, UnavailableReason,
};
use meshkit::resilience::{
    Bulkhead, BulkheadPolicy, CircuitBreakerConfig, CircuitState, PolicyCatalog,
    RateLimitPolicy,
};
use meshkit::{ServiceMesh, ServiceRegistry};
use tokio_test::{assert_err, assert_ok, assert_pending, assert_ready, task};

fn mesh(behavior: MethodBehavior) -> ServiceMesh {
    let registry = ServiceRegistry::new(RegistryConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout_ms: 30_000,
        },
        ..Default::default()
    });
    let spec = SimulatedSpec {
        name: "svc".to_string(),
        methods: HashMap::from([("work".to_string(), behavior)]),
        ..Default::default()
    };
    registry.register(spec.definition()).unwrap();

    let mut config = MeshConfig::default();
    config.policies.bulkhead.insert(
        "pair".into(),
        BulkheadPolicy {
            max_concurrency: 1,
            max_queue: 1,
        },
    );
    config
        .policies
        .rate_limit
        .insert("two".into(), RateLimitPolicy { requests_per_minute: 2 });
    ServiceMesh::new(config, registry, EventBus::default())
}

fn no_retry() -> CallOptions {
    CallOptions::new().retry("none")
}

fn is_circuit_open(err: &MeshError) -> bool {
    matches!(
        err,
        MeshError::ServiceUnavailable {
            reason: UnavailableReason::CircuitOpen,
            ..
        }
    )
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_after_reset_timeout() {
    let mesh = mesh(MethodBehavior {
        fail_first: 2,
        ..Default::default()
    });
    let breaker = mesh.registry().breaker("svc").unwrap();

    for _ in 0..2 {
        assert!(mesh.call("svc", "work", vec![], no_retry()).await.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = mesh.call("svc", "work", vec![], no_retry()).await.unwrap_err();
    assert!(is_circuit_open(&err));

    tokio::time::sleep(Duration::from_secs(30)).await;

    // the first call after the reset timeout is the probe
    mesh.call("svc", "work", vec![], no_retry()).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failures(), 0);
    assert!(mesh.metrics().open_circuits.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens() {
    let mesh = mesh(MethodBehavior {
        fail_first: 3,
        ..Default::default()
    });
    let breaker = mesh.registry().breaker("svc").unwrap();

    for _ in 0..2 {
        let _ = mesh.call("svc", "work", vec![], no_retry()).await;
    }
    tokio::time::sleep(Duration::from_secs(30)).await;

    let err = mesh.call("svc", "work", vec![], no_retry()).await.unwrap_err();
    assert!(matches!(err, MeshError::ServiceFailed { .. }));
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.snapshot().trips, 2);

    let err = mesh.call("svc", "work", vec![], no_retry()).await.unwrap_err();
    assert!(is_circuit_open(&err));
}

#[tokio::test(start_paused = true)]
async fn test_bulkhead_queues_then_rejects() {
    let mesh = mesh(MethodBehavior {
        latency_ms: 1_000,
        ..Default::default()
    });

    let spawn_call = || {
        let mesh = mesh.clone();
        tokio::spawn(async move {
            mesh.call("svc", "work", vec![], CallOptions::new().bulkhead("pair"))
                .await
        })
    };

    let running = spawn_call();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let queued = spawn_call();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = mesh
        .call("svc", "work", vec![], CallOptions::new().bulkhead("pair"))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::BulkheadFull { .. }));

    assert!(running.await.unwrap().is_ok());
    assert!(queued.await.unwrap().is_ok());
    assert_eq!(mesh.service_metrics("svc").unwrap().bulkhead_rejections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_leaves_bulkhead_queue() {
    let mesh = mesh(MethodBehavior {
        latency_ms: 1_000,
        ..Default::default()
    });
    let pair = || CallOptions::new().bulkhead("pair");

    let running = {
        let mesh = mesh.clone();
        tokio::spawn(async move { mesh.call("svc", "work", vec![], pair()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let token = CancelToken::new();
    let queued = {
        let mesh = mesh.clone();
        let token = token.clone();
        tokio::spawn(async move {
            mesh.call("svc", "work", vec![], pair().cancel_with(token))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    token.cancel();

    let err = queued.await.unwrap().unwrap_err();
    assert!(matches!(err, MeshError::Cancelled { .. }));

    // the cancelled caller gave its queue slot back
    let next = {
        let mesh = mesh.clone();
        tokio::spawn(async move { mesh.call("svc", "work", vec![], pair()).await })
    };
    assert!(running.await.unwrap().is_ok());
    assert!(next.await.unwrap().is_ok());
    assert_eq!(mesh.service_metrics("svc").unwrap().bulkhead_rejections, 0);
}

#[test]
fn test_bulkhead_waiter_wakes_on_release() {
    let bulkhead = Bulkhead::new(BulkheadPolicy {
        max_concurrency: 1,
        max_queue: 1,
    });

    let held = assert_ok!(tokio_test::block_on(bulkhead.acquire()));
    let mut waiter = task::spawn(bulkhead.acquire());
    assert_pending!(waiter.poll());

    // queue is full now
    assert_err!(tokio_test::block_on(bulkhead.acquire()));

    drop(held);
    assert!(waiter.is_woken());
    let _permit = assert_ok!(assert_ready!(waiter.poll()));
    assert_eq!(bulkhead.in_flight(), 1);
}

#[test]
fn test_aborted_waiter_leaves_queue() {
    let bulkhead = Bulkhead::new(BulkheadPolicy {
        max_concurrency: 1,
        max_queue: 1,
    });

    let held = assert_ok!(tokio_test::block_on(bulkhead.acquire()));
    let mut waiter = task::spawn(bulkhead.acquire());
    assert_pending!(waiter.poll());
    drop(waiter);

    drop(held);
    let _held = assert_ok!(tokio_test::block_on(bulkhead.acquire()));

    // the aborted caller no longer occupies the only queue slot
    let mut next = task::spawn(bulkhead.acquire());
    assert_pending!(next.poll());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_window_slides() {
    let mesh = mesh(MethodBehavior::default());
    let limited = || CallOptions::new().rate_limit("two");

    mesh.call("svc", "work", vec![], limited()).await.unwrap();
    mesh.call("svc", "work", vec![], limited()).await.unwrap();
    let err = mesh.call("svc", "work", vec![], limited()).await.unwrap_err();
    assert!(matches!(err, MeshError::RateLimitExceeded { limit: 2, .. }));

    tokio::time::sleep(Duration::from_secs(61)).await;
    mesh.call("svc", "work", vec![], limited()).await.unwrap();
}

#[test]
fn test_catalog_yaml_overrides() {
    let yaml = r#"
retry:
  default:
    max_retries: 7
timeout:
  fast:
    timeout_ms: 500
"#;
    let overrides: PolicyCatalog = serde_yaml::from_str(yaml).unwrap();
    let mut catalog = PolicyCatalog::default();
    catalog.merge(overrides);

    assert_eq!(catalog.retry("default").unwrap().max_retries, 7);
    assert_eq!(catalog.timeout("fast").unwrap().timeout_ms, 500);
    assert_eq!(catalog.timeout("slow").unwrap().timeout_ms, 60_000);
    assert_eq!(catalog.bulkhead("critical").unwrap().max_concurrency, 2);
    assert!(catalog.retry("missing").is_none());
}
