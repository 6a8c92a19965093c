//! Error taxonomy for the registry, the mesh and the event bus.
//!
//! Errors are `Clone` because a single in-flight service load is shared by
//! every concurrent caller, and each of them receives the same outcome.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Fatal problems with the service graph, detected at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Service '{0}' is not registered")]
    UnknownService(String),

    #[error("Service '{service}' depends on unregistered service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Service '{0}' is already registered")]
    DuplicateService(String),
}

/// Why a service could not be handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    /// The circuit breaker is open
    CircuitOpen,

    /// Construction or `initialize()` failed
    LoadFailed(String),

    /// A transitive dependency is not healthy
    DependencyUnhealthy(String),
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::CircuitOpen => write!(f, "circuit breaker open"),
            UnavailableReason::LoadFailed(msg) => write!(f, "load failed: {}", msg),
            UnavailableReason::DependencyUnhealthy(dep) => {
                write!(f, "dependency '{}' is not healthy", dep)
            }
        }
    }
}

/// Errors surfaced by `ServiceRegistry::get` and `ServiceMesh::call`.
#[derive(Debug, Clone, Error)]
pub enum MeshError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Service '{service}' is unavailable: {reason}")]
    ServiceUnavailable {
        service: String,
        reason: UnavailableReason,
    },

    #[error("Rate limit exceeded for service '{service}' ({limit} requests/minute)")]
    RateLimitExceeded { service: String, limit: u32 },

    #[error("Call to {service}.{method} timed out after {timeout_ms}ms")]
    Timeout {
        service: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("Bulkhead full for service '{service}' (max {max_concurrency} concurrent)")]
    BulkheadFull {
        service: String,
        max_concurrency: usize,
    },

    #[error("Method '{method}' not found on service '{service}'")]
    MethodNotFound { service: String, method: String },

    #[error("Unknown {kind} policy '{name}'")]
    UnknownPolicy { kind: &'static str, name: String },

    #[error("Service '{service}' failed: {message}")]
    ServiceFailed { service: String, message: String },

    #[error("Call to service '{service}' was cancelled")]
    Cancelled { service: String },
}

impl MeshError {
    pub(crate) fn unavailable(service: &str, reason: UnavailableReason) -> Self {
        MeshError::ServiceUnavailable {
            service: service.to_string(),
            reason,
        }
    }

    /// Whether the mesh may retry after this error.
    ///
    /// Rate limiting, open circuits and caller defects are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            MeshError::Timeout { .. } | MeshError::ServiceFailed { .. } => true,
            MeshError::ServiceUnavailable { reason, .. } => {
                !matches!(reason, UnavailableReason::CircuitOpen)
            }
            MeshError::Configuration(_)
            | MeshError::RateLimitExceeded { .. }
            | MeshError::BulkheadFull { .. }
            | MeshError::MethodNotFound { .. }
            | MeshError::UnknownPolicy { .. }
            | MeshError::Cancelled { .. } => false,
        }
    }

    /// Short machine-readable kind, used in emitted events and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::Configuration(_) => "configuration",
            MeshError::ServiceUnavailable { .. } => "service_unavailable",
            MeshError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            MeshError::Timeout { .. } => "timeout",
            MeshError::BulkheadFull { .. } => "bulkhead_full",
            MeshError::MethodNotFound { .. } => "method_not_found",
            MeshError::UnknownPolicy { .. } => "unknown_policy",
            MeshError::ServiceFailed { .. } => "service_failed",
            MeshError::Cancelled { .. } => "cancelled",
        }
    }
}

/// Errors surfaced by the event bus.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("Event '{event_type}' is missing required fields: {}", missing.join(", "))]
    SchemaValidation {
        event_type: String,
        missing: Vec<String>,
    },

    #[error("Middleware '{name}' rejected event: {message}")]
    Middleware { name: String, message: String },

    #[error("Invalid middleware pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Invalid replay range: {from} is after {to}")]
    InvalidRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[error("Event type must not be empty")]
    EmptyEventType,

    #[error("Delivery to subscription {subscription_id} failed: {message}")]
    DeliveryFailure {
        subscription_id: Uuid,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_message_lists_fields() {
        let err = BusError::SchemaValidation {
            event_type: "user_message".into(),
            missing: vec!["userId".into(), "timestamp".into()],
        };
        assert_eq!(
            err.to_string(),
            "Event 'user_message' is missing required fields: userId, timestamp"
        );
    }

    #[test]
    fn test_cycle_message() {
        let err = ConfigurationError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_retryable_classification() {
        let timeout = MeshError::Timeout {
            service: "svc".into(),
            method: "m".into(),
            timeout_ms: 10,
        };
        assert!(timeout.is_retryable());

        let limited = MeshError::RateLimitExceeded {
            service: "svc".into(),
            limit: 5,
        };
        assert!(!limited.is_retryable());

        let open = MeshError::unavailable("svc", UnavailableReason::CircuitOpen);
        assert!(!open.is_retryable());

        let load = MeshError::unavailable("svc", UnavailableReason::LoadFailed("boom".into()));
        assert!(load.is_retryable());
        assert_eq!(load.kind(), "service_unavailable");
    }
}
