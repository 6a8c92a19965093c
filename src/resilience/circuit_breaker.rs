//! Per-service circuit breaker.
//!
//! ```text
//!            failures >= threshold
//!   CLOSED ─────────────────────────► OPEN
//!     ▲                                │ reset_timeout elapsed,
//!     │ probe succeeds                 │ next call is the probe
//!     │                                ▼
//!     └─────────────────────────── HALF_OPEN
//!                  probe fails: back to OPEN
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Calls are rejected until the reset timeout elapses
    Open,
    /// One probe call decides between closed and open
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time in milliseconds before an open circuit admits a probe
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Returned by `try_acquire` when the breaker rejects a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRejected {
    pub state: CircuitState,
}

/// Point-in-time view of a breaker, for status output and snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub trips: u64,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    trips: u64,
}

/// Failure-counting guard for one service
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                probe_started: None,
                last_failure: None,
                trips: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state without side effects
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Whether the breaker rejects work right now.
    ///
    /// An open breaker whose reset timeout elapsed moves to half-open here,
    /// so a service load can act as the probe.
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open && self.reset_elapsed(&inner) {
            self.enter_half_open(&mut inner);
        }
        inner.state == CircuitState::Open
    }

    /// Admit one call.
    ///
    /// In half-open only a single probe is admitted; a probe that never
    /// reported back is replaced once the reset timeout passes again.
    pub fn try_acquire(&self) -> Result<(), BreakerRejected> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if self.reset_elapsed(&inner) {
                    self.enter_half_open(&mut inner);
                    inner.probe_started = Some(Instant::now());
                    Ok(())
                } else {
                    debug!(service = %self.name, "Circuit breaker is open, rejecting call");
                    Err(BreakerRejected {
                        state: CircuitState::Open,
                    })
                }
            }
            CircuitState::HalfOpen => {
                let stale = inner
                    .probe_started
                    .map(|started| started.elapsed() >= self.config.reset_timeout())
                    .unwrap_or(true);
                if stale {
                    inner.probe_started = Some(Instant::now());
                    Ok(())
                } else {
                    Err(BreakerRejected {
                        state: CircuitState::HalfOpen,
                    })
                }
            }
        }
    }

    /// Record a successful call. Returns true if the circuit closed.
    pub fn record_success(&self) -> bool {
        let mut inner = self.inner.lock();
        let was = inner.state;
        inner.failures = 0;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.probe_started = None;

        if was != CircuitState::Closed {
            info!(service = %self.name, from = %was, "Circuit breaker closed");
            return true;
        }
        false
    }

    /// Record a failed attempt. Returns true if this failure tripped the circuit.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Utc::now());

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failures >= self.config.failure_threshold,
            // already open: keep the original opening time
            CircuitState::Open => false,
        };

        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_started = None;
            inner.trips += 1;
            warn!(
                service = %self.name,
                failures = inner.failures,
                threshold = self.config.failure_threshold,
                "Circuit breaker opened"
            );
        }
        trip
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failures: inner.failures,
            trips: inner.trips,
            last_failure: inner.last_failure,
        }
    }

    fn reset_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .opened_at
            .map(|opened| opened.elapsed() >= self.config.reset_timeout())
            .unwrap_or(true)
    }

    fn enter_half_open(&self, inner: &mut BreakerInner) {
        info!(service = %self.name, "Circuit breaker transitioning to half-open");
        inner.state = CircuitState::HalfOpen;
        inner.probe_started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: reset_ms,
            },
        )
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, 1000);

        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
        assert_eq!(cb.snapshot().trips, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = breaker(3, 1000);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failures(), 0);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_success_closes() {
        let cb = breaker(1, 100);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(150)).await;

        // still reported open until a call arrives
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // exactly one probe
        assert_eq!(
            cb.try_acquire(),
            Err(BreakerRejected {
                state: CircuitState::HalfOpen
            })
        );

        assert!(cb.record_success());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let cb = breaker(2, 100);
        cb.record_failure();
        cb.record_failure();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cb.try_acquire().is_ok());

        assert!(cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_probe_is_replaced() {
        let cb = breaker(1, 100);
        cb.record_failure();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_err());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_open_moves_to_half_open() {
        let cb = breaker(1, 100);
        cb.record_failure();
        assert!(cb.is_open());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }
}
