//! Error-rate alerting over aggregated mesh metrics.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Thresholds for `monitoring_alert`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Recent error rate (0.0 - 1.0) above which a service alerts
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Minimum recent requests before the rate is considered
    #[serde(default = "default_min_requests")]
    pub min_requests: u64,

    /// Minimum time between two alerts for the same service, in milliseconds
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
}

fn default_error_rate_threshold() -> f64 {
    0.5
}
fn default_min_requests() -> u64 {
    10
}
fn default_cooldown() -> u64 {
    5 * 60 * 1000
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            error_rate_threshold: default_error_rate_threshold(),
            min_requests: default_min_requests(),
            cooldown_ms: default_cooldown(),
        }
    }
}

/// A service crossing the error-rate threshold
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRateAlert {
    pub service: String,
    pub error_rate: f64,
    pub requests: u64,
    pub threshold: f64,
}

/// Tracks the last alert per service to enforce the cooldown
#[derive(Debug)]
pub struct AlertMonitor {
    config: AlertConfig,
    last_alert: Mutex<HashMap<String, Instant>>,
}

impl AlertMonitor {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Check one service's recent counts; returns an alert at most once per cooldown
    pub fn evaluate(&self, service: &str, requests: u64, errors: u64) -> Option<ErrorRateAlert> {
        if requests == 0 || requests < self.config.min_requests {
            return None;
        }

        let error_rate = errors as f64 / requests as f64;
        if error_rate <= self.config.error_rate_threshold {
            return None;
        }

        let now = Instant::now();
        let cooldown = Duration::from_millis(self.config.cooldown_ms);
        let mut last_alert = self.last_alert.lock();
        if let Some(last) = last_alert.get(service) {
            if now.duration_since(*last) < cooldown {
                return None;
            }
        }
        last_alert.insert(service.to_string(), now);

        Some(ErrorRateAlert {
            service: service.to_string(),
            error_rate,
            requests,
            threshold: self.config.error_rate_threshold,
        })
    }
}
