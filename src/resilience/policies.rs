//! Named policy presets used by the mesh.
//!
//! Callers pick presets by name through `CallOptions`; configuration can add
//! presets or override the built-in ones.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bulkhead::BulkheadPolicy;
use super::rate_limit::RateLimitPolicy;
use super::retry::RetryPolicy;

/// Name of the preset used when a call does not pick one
pub const DEFAULT_POLICY: &str = "default";

/// Per-call timeout preset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub timeout_ms: u64,
}

impl TimeoutPolicy {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// All named presets, keyed by kind and name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyCatalog {
    #[serde(default)]
    pub retry: HashMap<String, RetryPolicy>,
    #[serde(default)]
    pub timeout: HashMap<String, TimeoutPolicy>,
    #[serde(default)]
    pub rate_limit: HashMap<String, RateLimitPolicy>,
    #[serde(default)]
    pub bulkhead: HashMap<String, BulkheadPolicy>,
}

impl Default for PolicyCatalog {
    fn default() -> Self {
        let retry = [
            ("default", RetryPolicy::default()),
            (
                "aggressive",
                RetryPolicy {
                    max_retries: 5,
                    base_delay_ms: 500,
                    max_delay_ms: 5000,
                    backoff_multiplier: 1.5,
                    jitter: true,
                },
            ),
            (
                "conservative",
                RetryPolicy {
                    max_retries: 1,
                    base_delay_ms: 2000,
                    max_delay_ms: 20000,
                    backoff_multiplier: 3.0,
                    jitter: true,
                },
            ),
            ("none", RetryPolicy::none()),
        ];

        let timeout = [
            ("default", 30_000),
            ("fast", 10_000),
            ("slow", 60_000),
        ];

        let rate_limit = [("default", 100), ("strict", 10), ("relaxed", 1000)];

        let bulkhead = [
            ("default", 10, 100),
            ("high", 20, 200),
            ("low", 5, 50),
            ("critical", 2, 20),
        ];

        Self {
            retry: retry
                .into_iter()
                .map(|(name, policy)| (name.to_string(), policy))
                .collect(),
            timeout: timeout
                .into_iter()
                .map(|(name, timeout_ms)| (name.to_string(), TimeoutPolicy { timeout_ms }))
                .collect(),
            rate_limit: rate_limit
                .into_iter()
                .map(|(name, requests_per_minute)| {
                    (name.to_string(), RateLimitPolicy { requests_per_minute })
                })
                .collect(),
            bulkhead: bulkhead
                .into_iter()
                .map(|(name, max_concurrency, max_queue)| {
                    (
                        name.to_string(),
                        BulkheadPolicy {
                            max_concurrency,
                            max_queue,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl PolicyCatalog {
    /// Layer `overrides` on top of this catalog; same-named presets are replaced
    pub fn merge(&mut self, overrides: PolicyCatalog) {
        self.retry.extend(overrides.retry);
        self.timeout.extend(overrides.timeout);
        self.rate_limit.extend(overrides.rate_limit);
        self.bulkhead.extend(overrides.bulkhead);
    }

    pub fn retry(&self, name: &str) -> Option<&RetryPolicy> {
        self.retry.get(name)
    }

    pub fn timeout(&self, name: &str) -> Option<&TimeoutPolicy> {
        self.timeout.get(name)
    }

    pub fn rate_limit(&self, name: &str) -> Option<&RateLimitPolicy> {
        self.rate_limit.get(name)
    }

    pub fn bulkhead(&self, name: &str) -> Option<&BulkheadPolicy> {
        self.bulkhead.get(name)
    }
}
