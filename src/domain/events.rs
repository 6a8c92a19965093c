//! Events carried by the event bus.
//!
//! Payloads are JSON objects. Field names follow the camelCase convention of
//! the published event contracts (`serviceName`, `durationMs`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// JSON object payload of an event
pub type Payload = Map<String, Value>;

/// Event types emitted by the runtime itself
pub mod event_types {
    pub const SERVICE_CALL_SUCCESS: &str = "service_call_success";
    pub const SERVICE_CALL_FAILURE: &str = "service_call_failure";
    pub const RESILIENCE_ALERT: &str = "resilience_alert";
    pub const MONITORING_ALERT: &str = "monitoring_alert";
    pub const SERVICE_HEALTH: &str = "service_health";
    pub const USER_MESSAGE: &str = "user_message";
    pub const AI_RESPONSE: &str = "ai_response";
    pub const OPTIMIZATION_COMPLETED: &str = "optimization_completed";
    pub const DEVICE_LINKED: &str = "device_linked";
}

/// A single published event.
///
/// The id is assigned at publish time and kept across retries and
/// dead-letter redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// Type used for schema lookup and subscription matching
    pub event_type: String,

    /// Event data
    pub payload: Payload,

    /// When the event was first published
    pub timestamp: DateTime<Utc>,

    /// Delivery attempt index for the receiving handler (0 = first delivery)
    #[serde(default)]
    pub retry_count: u32,
}

impl Event {
    /// Create a new event with a fresh id and the current timestamp
    pub fn new(event_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            retry_count: 0,
        }
    }

    /// Copy of this event for the next delivery attempt
    pub fn next_attempt(&self) -> Self {
        let mut event = self.clone();
        event.retry_count += 1;
        event
    }

    /// Payload field by name
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// String payload field by name
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Convert a JSON value into an event payload.
///
/// Objects are used as-is; any other value is wrapped as `{"value": ...}`.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Kinds of alerts published as `resilience_alert` / `monitoring_alert`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// A breaker tripped open
    CircuitBreakerOpen,

    /// A call was rejected by the rate limiter
    RateLimitThrottle,

    /// A bulkhead rejected a call
    BulkheadOverload,

    /// Recent error rate of a service crossed the threshold
    HighErrorRate,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::CircuitBreakerOpen => "circuit_breaker_open",
            AlertType::RateLimitThrottle => "rate_limit_throttle",
            AlertType::BulkheadOverload => "bulkhead_overload",
            AlertType::HighErrorRate => "high_error_rate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            event_types::USER_MESSAGE,
            payload(json!({"message": "hi", "userId": "u1"})),
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.id, event.id);
        assert_eq!(parsed.event_type, "user_message");
        assert_eq!(parsed.get_str("userId"), Some("u1"));
    }

    #[test]
    fn test_next_attempt_keeps_id() {
        let event = Event::new("x", Payload::new());
        let retry = event.next_attempt().next_attempt();

        assert_eq!(retry.id, event.id);
        assert_eq!(retry.retry_count, 2);
        assert_eq!(event.retry_count, 0);
    }

    #[test]
    fn test_payload_wraps_scalars() {
        assert_eq!(payload(json!(3)).get("value"), Some(&json!(3)));
        assert!(payload(Value::Null).is_empty());
    }

    #[test]
    fn test_alert_type_names() {
        assert_eq!(AlertType::CircuitBreakerOpen.as_str(), "circuit_breaker_open");
        assert_eq!(
            serde_json::to_value(AlertType::BulkheadOverload).unwrap(),
            json!("bulkhead_overload")
        );
    }
}
