//! Resilience policies applied by the mesh and the event bus.
//!
//! - CircuitBreaker: fail fast once a service keeps failing
//! - RetryPolicy: exponential backoff with optional jitter
//! - RateLimiter: sliding one-minute window per service
//! - Bulkhead: concurrency cap per service
//! - PolicyCatalog: named presets ("default", "fast", "aggressive", ...)

pub mod bulkhead;
pub mod circuit_breaker;
pub mod policies;
pub mod rate_limit;
pub mod retry;

pub use bulkhead::{Bulkhead, BulkheadPolicy, BulkheadRejected};
pub use circuit_breaker::{
    BreakerRejected, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use policies::{PolicyCatalog, TimeoutPolicy, DEFAULT_POLICY};
pub use rate_limit::{RateLimitPolicy, RateLimiter, RATE_WINDOW};
pub use retry::RetryPolicy;
