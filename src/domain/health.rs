//! Service health as tracked by the registry.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle and health state of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Never loaded
    Unknown,

    /// Construction or `initialize()` in progress
    Loading,

    /// Loaded and passing health checks
    Healthy,

    /// Load failed, a health check failed, or calls are failing
    Unhealthy,

    /// Instance dropped by `unload`
    Unloaded,
}

impl HealthState {
    /// Compact encoding for lock-free reads on the lookup path
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            HealthState::Unknown => 0,
            HealthState::Loading => 1,
            HealthState::Healthy => 2,
            HealthState::Unhealthy => 3,
            HealthState::Unloaded => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => HealthState::Loading,
            2 => HealthState::Healthy,
            3 => HealthState::Unhealthy,
            4 => HealthState::Unloaded,
            _ => HealthState::Unknown,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Unknown => "unknown",
            HealthState::Loading => "loading",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Unloaded => "unloaded",
        };
        write!(f, "{}", s)
    }
}

/// Health report for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: HealthState,

    /// Last time the state was evaluated
    pub last_check: Option<DateTime<Utc>>,

    /// Last error seen while loading or checking
    pub error: Option<String>,

    /// Duration of the most recent successful load
    pub load_time_ms: Option<u64>,
}

impl HealthStatus {
    pub fn unknown() -> Self {
        Self {
            state: HealthState::Unknown,
            last_check: None,
            error: None,
            load_time_ms: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::unknown()
    }
}
