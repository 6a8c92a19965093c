//! Runtime configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (MESHKIT_HOME, MESHKIT_CONFIG)
//! 2. Config file (.meshkit/config.yaml)
//! 3. Defaults (~/.meshkit)
//!
//! Config file discovery:
//! - MESHKIT_CONFIG names the file explicitly
//! - Otherwise searches current directory and parents for .meshkit/config.yaml
//! - `paths.home` in the config file is relative to the .meshkit/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bus::BusConfig;
use crate::core::{MeshConfig, RegistryConfig, SnapshotConfig};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<RuntimeConfig, String>> = OnceLock::new();

pub const HOME_ENV: &str = "MESHKIT_HOME";
pub const CONFIG_ENV: &str = "MESHKIT_CONFIG";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Runtime state directory (relative to .meshkit/)
    pub home: Option<String>,
}

/// Resolved configuration handed to `Runtime::new`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeConfig {
    /// Absolute path to the runtime's state directory
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub registry: RegistryConfig,
    pub mesh: MeshConfig,
    pub bus: BusConfig,
    pub snapshot: SnapshotConfig,
}

impl RuntimeConfig {
    /// Defaults for every component, rooted at `home`
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            config_file: None,
            registry: RegistryConfig::default(),
            mesh: MeshConfig::default(),
            bus: BusConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }

    /// Where snapshots are written
    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot.resolve_path(&self.home)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(explicit));
    }

    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".meshkit").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn default_home() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".meshkit"))
}

/// Build the resolved configuration from an optional config file
fn resolve(config_file: Option<PathBuf>) -> Result<RuntimeConfig> {
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let home = if let Ok(env_home) = std::env::var(HOME_ENV) {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(config_path)) = (&file.paths.home, &config_file) {
        let meshkit_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(meshkit_dir, home_path)
    } else {
        default_home()?
    };

    Ok(RuntimeConfig {
        home,
        config_file,
        registry: file.registry,
        mesh: file.mesh,
        bus: file.bus,
        snapshot: file.snapshot,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<RuntimeConfig> {
    resolve(find_config_file())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static RuntimeConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration, bypassing the cache
pub fn reload_config() -> Result<RuntimeConfig> {
    load_config()
}

/// Load configuration from a specific file, bypassing discovery and the cache
pub fn load_config_from(path: &Path) -> Result<RuntimeConfig> {
    resolve(Some(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(temp: &TempDir, body: &str) -> PathBuf {
        let meshkit_dir = temp.path().join(".meshkit");
        std::fs::create_dir_all(&meshkit_dir).unwrap();

        let config_path = meshkit_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", body).unwrap();
        config_path
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1.0"
registry:
  circuit_breaker:
    failure_threshold: 3
mesh:
  policies:
    rate_limit:
      burst:
        requests_per_minute: 5
  alerts:
    error_rate_threshold: 0.2
bus:
  max_history: 50
  metrics_middleware: false
  retry_policies:
    user_message:
      max_retries: 1
snapshot:
  enabled: false
"#,
        );

        let file = load_config_file(&config_path).unwrap();
        assert_eq!(file.version.as_deref(), Some("1.0"));
        assert_eq!(file.registry.circuit_breaker.failure_threshold, 3);
        assert_eq!(file.registry.circuit_breaker.reset_timeout_ms, 30_000);
        assert_eq!(
            file.mesh.policies.rate_limit["burst"].requests_per_minute,
            5
        );
        assert_eq!(file.mesh.alerts.error_rate_threshold, 0.2);
        assert_eq!(file.bus.max_history, 50);
        assert!(!file.bus.metrics_middleware);
        assert_eq!(file.bus.retry_policies["user_message"].max_retries, 1);
        assert!(!file.snapshot.enabled);
    }

    #[test]
    fn test_load_config_from_resolves_home() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
paths:
  home: ./state
"#,
        );

        let config = load_config_from(&config_path).unwrap();
        assert_eq!(config.config_file.as_deref(), Some(config_path.as_path()));
        if std::env::var(HOME_ENV).is_err() {
            assert_eq!(config.home, temp.path().join(".meshkit").join("state"));
        }
        assert_eq!(config.registry, RegistryConfig::default());
    }

    #[test]
    fn test_defaults_for_empty_file() {
        let file: ConfigFile = serde_yaml::from_str("{}").unwrap();
        assert_eq!(file.bus.max_dead_letters, 1000);
        assert_eq!(file.mesh.metrics_interval_ms, 60_000);
        assert!(file.snapshot.enabled);
    }

    #[test]
    fn test_snapshot_path_under_home() {
        let config = RuntimeConfig::new("/srv/meshkit");
        assert_eq!(
            config.snapshot_path(),
            PathBuf::from("/srv/meshkit/snapshot.json")
        );
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
