//! Periodic JSON snapshot of runtime state.
//!
//! The snapshot is written to a temp file in the same directory and renamed
//! into place while an exclusive lock is held on `<path>.lock`, so readers
//! never observe a half-written file.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::mesh::MeshMetrics;
use super::registry::RegistryMetrics;
use crate::bus::{BusMetrics, DeadLetterEntry};
use crate::domain::HealthStatus;
use crate::resilience::BreakerSnapshot;

/// Snapshot settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Interval between snapshots in milliseconds
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Override for `<home>/snapshot.json`
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Restore the dead-letter queue from the last snapshot on start
    #[serde(default = "default_enabled")]
    pub restore: bool,
}

fn default_enabled() -> bool {
    true
}
fn default_interval() -> u64 {
    60_000
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_ms: default_interval(),
            path: None,
            restore: default_enabled(),
        }
    }
}

impl SnapshotConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Snapshot file for a runtime rooted at `home`
    pub fn resolve_path(&self, home: &Path) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| home.join("snapshot.json"))
    }
}

/// Everything written to disk by one snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub taken_at: DateTime<Utc>,
    pub registry: RegistryMetrics,
    pub health: HashMap<String, HealthStatus>,
    pub circuits: BTreeMap<String, BreakerSnapshot>,
    pub mesh: MeshMetrics,
    pub bus: BusMetrics,
    #[serde(default)]
    pub dead_letters: Vec<DeadLetterEntry>,
}

impl RuntimeSnapshot {
    /// Write the snapshot atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create snapshot directory: {}", dir.display()))?;

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path(path))
            .with_context(|| format!("Failed to open snapshot lock for {}", path.display()))?;
        lock.lock_exclusive()
            .context("Failed to acquire snapshot lock")?;

        let json = serde_json::to_vec_pretty(self).context("Failed to serialize snapshot")?;

        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&json).context("Failed to write snapshot")?;
        tmp.as_file().sync_all().context("Failed to sync snapshot")?;
        tmp.persist(path)
            .with_context(|| format!("Failed to move snapshot into place: {}", path.display()))?;

        // Lock is released when `lock` is dropped
        Ok(())
    }

    /// Read the last snapshot; `None` when there is none yet
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path(path))
            .with_context(|| format!("Failed to open snapshot lock for {}", path.display()))?;
        lock.lock_shared()
            .context("Failed to acquire snapshot lock")?;

        let content = fs::read(path)
            .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
        let snapshot = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;

        Ok(Some(snapshot))
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DeadLetterEntry;
    use crate::domain::Event;
    use serde_json::Map;
    use tempfile::TempDir;

    fn snapshot(dead_letters: Vec<DeadLetterEntry>) -> RuntimeSnapshot {
        RuntimeSnapshot {
            taken_at: Utc::now(),
            registry: RegistryMetrics::default(),
            health: HashMap::new(),
            circuits: BTreeMap::new(),
            mesh: MeshMetrics {
                total_requests: 3,
                successful: 2,
                failed: 1,
                average_response_time_ms: 12.5,
                throughput: 3,
                open_circuits: vec![],
                services: BTreeMap::new(),
                collected_at: Utc::now(),
            },
            bus: BusMetrics::default(),
            dead_letters,
        }
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(RuntimeSnapshot::load(&dir.path().join("snapshot.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("snapshot.json");

        let event = Event::new("user_message", Map::new());
        let entry = DeadLetterEntry::new(event.clone(), "boom".to_string(), None);
        snapshot(vec![entry]).save(&path).unwrap();

        let loaded = RuntimeSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded.mesh.total_requests, 3);
        assert_eq!(loaded.dead_letters.len(), 1);
        assert_eq!(loaded.dead_letters[0].event.id, event.id);
    }

    #[test]
    fn test_save_replaces_previous() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.json");

        let entry = DeadLetterEntry::new(Event::new("x", Map::new()), "e".to_string(), None);
        snapshot(vec![entry]).save(&path).unwrap();
        snapshot(vec![]).save(&path).unwrap();

        let loaded = RuntimeSnapshot::load(&path).unwrap().unwrap();
        assert!(loaded.dead_letters.is_empty());
    }

    #[test]
    fn test_path_resolution() {
        let config = SnapshotConfig::default();
        assert_eq!(
            config.resolve_path(Path::new("/tmp/mk")),
            PathBuf::from("/tmp/mk/snapshot.json")
        );
    }
}
