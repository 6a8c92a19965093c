//! Runtime Integration Tests
//!
//! Tests for startup ordering, background preload, topologies run through
//! a runtime, and dead-letter persistence across restarts.

use std::time::Duration;

use anyhow::bail;
use meshkit::core::{RuntimeSnapshot, Topology};
use meshkit::domain::{payload, Event, HealthState};
use meshkit::{Runtime, RuntimeConfig};
use serde_json::json;
use tempfile::TempDir;

const TOPOLOGY_YAML: &str = r#"
name: shop
services:
  - name: storage
    critical: true
    methods:
      read: {}
  - name: cache
    lazy: false
    dependencies: [storage]
    methods:
      get: {}
  - name: api
    dependencies: [storage]
    methods:
      work:
        fail_first: 1
calls:
  - service: api
    method: work
    count: 2
    retry_policy: none
"#;

fn runtime_with(home: &TempDir, yaml: &str) -> (Runtime, Topology) {
    let topology = Topology::from_yaml(yaml).unwrap();
    topology.validate().unwrap();

    let runtime = Runtime::new(RuntimeConfig::new(home.path()));
    for definition in topology.definitions() {
        runtime.register(definition).unwrap();
    }
    (runtime, topology)
}

async fn offline_worker(_: Event) -> anyhow::Result<()> {
    bail!("worker offline")
}

async fn wait_until_loaded(runtime: &Runtime, name: &str) -> bool {
    for _ in 0..100 {
        if runtime.registry().is_loaded(name) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_topology_runs_through_runtime() {
    let home = TempDir::new().unwrap();
    let (runtime, topology) = runtime_with(&home, TOPOLOGY_YAML);

    let report = runtime.start().await.unwrap();
    assert_eq!(report.loaded, vec!["storage".to_string()]);
    assert!(report.is_complete());

    // eager non-critical services load in the background, lazy ones wait
    assert!(wait_until_loaded(&runtime, "cache").await);
    assert!(!runtime.registry().is_loaded("api"));

    let mut results = Vec::new();
    for call in &topology.calls {
        for _ in 0..call.count {
            results.push(
                runtime
                    .mesh()
                    .call(&call.service, &call.method, call.args.clone(), call.options())
                    .await,
            );
        }
    }
    assert!(results[0].is_err());
    assert_eq!(results[1].as_ref().unwrap()["call"], json!(2));

    let snapshot = runtime.snapshot();
    assert_eq!(snapshot.mesh.total_requests, 2);
    assert_eq!(snapshot.mesh.failed, 1);
    assert_eq!(snapshot.registry.loaded, 3);
    assert_eq!(snapshot.health["api"].state, HealthState::Healthy);
    assert_eq!(snapshot.circuits["api"].failures, 0);

    runtime.shutdown().await.unwrap();
    assert_eq!(runtime.active_tasks(), 0);
}

#[tokio::test]
async fn test_failed_critical_service_skips_preload() {
    let yaml = TOPOLOGY_YAML.replace("critical: true", "critical: true\n    fail_init: true");
    let home = TempDir::new().unwrap();
    let (runtime, _) = runtime_with(&home, &yaml);

    let report = runtime.start().await.unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.failed[0].service, "storage");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!runtime.registry().is_loaded("cache"));
    assert_eq!(runtime.registry().health("cache").state, HealthState::Unknown);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_dependency_fails_start() {
    let yaml = TOPOLOGY_YAML.replace(
        "dependencies: [storage]\n    methods:\n      work",
        "dependencies: [billing]\n    methods:\n      work",
    );
    let home = TempDir::new().unwrap();
    let (runtime, _) = runtime_with(&home, &yaml);

    let err = runtime.start().await.unwrap_err();
    assert!(format!("{:#}", err).contains("billing"));

    // register what was missing and start again
    let billing = Topology::from_yaml(
        r#"
name: billing
services:
  - name: billing
    methods:
      charge: {}
"#,
    )
    .unwrap();
    for definition in billing.definitions() {
        runtime.register(definition).unwrap();
    }

    let report = runtime.start().await.unwrap();
    assert_eq!(report.loaded, vec!["storage".to_string()]);
    assert!(runtime.start().await.is_err());
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dead_letters_survive_restart() {
    let home = TempDir::new().unwrap();

    let first = Runtime::new(RuntimeConfig::new(home.path()));
    first.start().await.unwrap();
    first
        .bus()
        .subscribe("job", offline_worker, None)
        .unwrap();
    let event_id = first
        .bus()
        .publish("job", payload(json!({ "task": "reindex" })))
        .await
        .unwrap();
    assert_eq!(first.bus().dead_letter_queue().len(), 1);
    first.shutdown().await.unwrap();

    let saved = RuntimeSnapshot::load(&home.path().join("snapshot.json"))
        .unwrap()
        .unwrap();
    assert_eq!(saved.dead_letters.len(), 1);
    assert_eq!(saved.bus.dead_lettered, 1);

    let second = Runtime::new(RuntimeConfig::new(home.path()));
    second.start().await.unwrap();
    let restored = second.bus().dead_letter_queue();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].event.id, event_id);
    assert!(restored[0].error.contains("worker offline"));
    // counters start fresh
    assert_eq!(second.bus().metrics().dead_lettered, 0);
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restore_can_be_disabled() {
    let home = TempDir::new().unwrap();

    let first = Runtime::new(RuntimeConfig::new(home.path()));
    first.start().await.unwrap();
    first
        .bus()
        .subscribe("job", offline_worker, None)
        .unwrap();
    first.bus().publish("job", payload(json!({}))).await.unwrap();
    let path = first.save_snapshot().await.unwrap();
    assert!(path.exists());
    first.shutdown().await.unwrap();

    let mut config = RuntimeConfig::new(home.path());
    config.snapshot.restore = false;
    let second = Runtime::new(config);
    second.start().await.unwrap();
    assert!(second.bus().dead_letter_queue().is_empty());
    second.shutdown().await.unwrap();
}
