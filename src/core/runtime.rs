//! Application root: builds and wires the bus, registry and mesh.
//!
//! The runtime owns the background loops (health checks, dead-letter sweep,
//! metrics aggregation, snapshots). They run on one `TaskSet` and stop
//! together on `shutdown`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::error::ConfigurationError;
use super::mesh::ServiceMesh;
use super::registry::{LoadReport, ServiceRegistry};
use super::snapshot::RuntimeSnapshot;
use super::tasks::TaskSet;
use crate::bus::EventBus;
use crate::config::RuntimeConfig;
use crate::domain::ServiceDefinition;

/// One bus, one registry and one mesh, plus their background loops
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    bus: EventBus,
    registry: ServiceRegistry,
    mesh: ServiceMesh,
    tasks: TaskSet,
    started: AtomicBool,
}

impl Runtime {
    /// Build the components, leaves first
    pub fn new(config: RuntimeConfig) -> Self {
        let bus = EventBus::new(config.bus.clone());
        let registry = ServiceRegistry::new(config.registry.clone());
        let mesh = ServiceMesh::new(config.mesh.clone(), registry.clone(), bus.clone());

        Self {
            config,
            bus,
            registry,
            mesh,
            tasks: TaskSet::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn mesh(&self) -> &ServiceMesh {
        &self.mesh
    }

    pub fn register(&self, definition: ServiceDefinition) -> Result<(), ConfigurationError> {
        self.registry.register(definition)
    }

    /// Background loops currently running
    pub fn active_tasks(&self) -> usize {
        self.tasks.active()
    }

    /// Restore state, load critical services and start the background loops
    pub async fn start(&self) -> Result<LoadReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("Runtime already started");
        }

        if self.config.snapshot.enabled && self.config.snapshot.restore {
            self.restore().await;
        }

        let report = match self.registry.load_critical().await {
            Ok(report) => report,
            Err(e) => {
                // a failed start can be retried once the definitions are fixed
                self.started.store(false, Ordering::SeqCst);
                return Err(e).context("Failed to load critical services");
            }
        };

        if report.is_complete() {
            let registry = self.registry.clone();
            self.tasks.spawn(async move {
                registry.load_background().await;
            });
        } else {
            warn!(
                failed = report.failed.len(),
                "Skipping background preload, critical services failed"
            );
        }

        self.spawn_loops();

        info!(
            services = self.registry.names().len(),
            loaded = report.loaded.len(),
            "Runtime started"
        );
        Ok(report)
    }

    fn spawn_loops(&self) {
        let registry = self.registry.clone();
        self.tasks.spawn_interval(
            "health_check",
            self.config.registry.health_check_interval(),
            move || {
                let registry = registry.clone();
                async move {
                    registry.check_health().await;
                }
            },
        );

        let bus = self.bus.clone();
        self.tasks
            .spawn_interval("dead_letter_sweep", self.config.bus.sweep_interval(), move || {
                let bus = bus.clone();
                async move {
                    bus.reprocess_dead_letters().await;
                }
            });

        let mesh = self.mesh.clone();
        self.tasks.spawn_interval(
            "metrics_aggregation",
            self.config.mesh.metrics_interval(),
            move || {
                let mesh = mesh.clone();
                async move {
                    mesh.aggregate_metrics().await;
                }
            },
        );

        if self.config.snapshot.enabled {
            let writer = self.writer();
            self.tasks
                .spawn_interval("snapshot", self.config.snapshot.interval(), move || {
                    let writer = writer.clone();
                    async move {
                        if let Err(e) = writer.write().await {
                            warn!(error = %format!("{:#}", e), "Snapshot failed");
                        }
                    }
                });
        }
    }

    async fn restore(&self) {
        let path = self.config.snapshot_path();
        let loaded = tokio::task::spawn_blocking({
            let path = path.clone();
            move || RuntimeSnapshot::load(&path)
        })
        .await;

        match loaded {
            Ok(Ok(Some(snapshot))) => {
                let restored = self.bus.restore_dead_letters(snapshot.dead_letters);
                info!(
                    path = %path.display(),
                    taken_at = %snapshot.taken_at,
                    restored,
                    "Restored dead-letter queue from snapshot"
                );
            }
            Ok(Ok(None)) => debug!(path = %path.display(), "No snapshot to restore"),
            Ok(Err(e)) => warn!(error = %format!("{:#}", e), "Ignoring unreadable snapshot"),
            Err(e) => warn!(error = %e, "Snapshot restore task failed"),
        }
    }

    /// Current state of every component
    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.writer().capture()
    }

    /// Write a snapshot now. Returns where it was written.
    pub async fn save_snapshot(&self) -> Result<PathBuf> {
        let writer = self.writer();
        writer.write().await?;
        Ok(writer.path)
    }

    fn writer(&self) -> SnapshotWriter {
        SnapshotWriter {
            path: self.config.snapshot_path(),
            registry: self.registry.clone(),
            mesh: self.mesh.clone(),
            bus: self.bus.clone(),
        }
    }

    /// Stop the loops and pending bus retries, write a final snapshot, unload services
    pub async fn shutdown(&self) -> Result<()> {
        self.tasks.shutdown();
        self.bus.shutdown();

        let saved = if self.config.snapshot.enabled {
            self.save_snapshot().await.map(Some)
        } else {
            Ok(None)
        };

        let unloaded = self.registry.unload_all();
        info!(unloaded, "Runtime stopped");

        if let Some(path) = saved.context("Failed to write final snapshot")? {
            debug!(path = %path.display(), "Final snapshot written");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SnapshotWriter {
    path: PathBuf,
    registry: ServiceRegistry,
    mesh: ServiceMesh,
    bus: EventBus,
}

impl SnapshotWriter {
    fn capture(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            taken_at: Utc::now(),
            registry: self.registry.metrics(),
            health: self.registry.all_health(),
            circuits: self.registry.circuit_states(),
            mesh: self.mesh.metrics(),
            bus: self.bus.metrics(),
            dead_letters: self.bus.dead_letter_queue(),
        }
    }

    async fn write(&self) -> Result<()> {
        let snapshot = self.capture();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || snapshot.save(&path))
            .await
            .context("Snapshot task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Service;
    use tempfile::TempDir;

    struct Plain;
    impl Service for Plain {}

    fn runtime(home: &TempDir) -> Runtime {
        Runtime::new(RuntimeConfig::new(home.path()))
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let home = TempDir::new().unwrap();
        let runtime = runtime(&home);
        runtime.start().await.unwrap();
        assert!(runtime.start().await.is_err());
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_writes_snapshot_and_unloads() {
        let home = TempDir::new().unwrap();
        let runtime = runtime(&home);
        runtime
            .register(
                ServiceDefinition::builder("core", || Plain)
                    .critical(true)
                    .build(),
            )
            .unwrap();

        let report = runtime.start().await.unwrap();
        assert_eq!(report.loaded, vec!["core".to_string()]);
        assert!(runtime.active_tasks() > 0);

        runtime.shutdown().await.unwrap();
        assert!(home.path().join("snapshot.json").exists());
        assert!(!runtime.registry().is_loaded("core"));
        assert_eq!(runtime.active_tasks(), 0);
    }
}
