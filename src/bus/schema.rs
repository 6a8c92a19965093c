//! Required-field schemas per event type.

use std::collections::HashMap;

use crate::core::error::BusError;
use crate::domain::{event_types, Payload};

/// Built-in schemas for the event types the runtime and its clients publish
pub fn default_schemas() -> HashMap<String, Vec<String>> {
    let schemas: [(&str, &[&str]); 9] = [
        (event_types::USER_MESSAGE, &["message", "userId", "timestamp"]),
        (event_types::AI_RESPONSE, &["response", "userId", "timestamp"]),
        (event_types::SERVICE_HEALTH, &["serviceName", "status", "timestamp"]),
        (
            event_types::OPTIMIZATION_COMPLETED,
            &["optimizationType", "deviceId", "timestamp"],
        ),
        (event_types::DEVICE_LINKED, &["deviceId", "appleId", "timestamp"]),
        (
            event_types::SERVICE_CALL_SUCCESS,
            &["serviceName", "method", "durationMs"],
        ),
        (
            event_types::SERVICE_CALL_FAILURE,
            &["serviceName", "method", "durationMs", "errorMessage"],
        ),
        (
            event_types::RESILIENCE_ALERT,
            &["serviceName", "alertType", "timestamp"],
        ),
        (
            event_types::MONITORING_ALERT,
            &["serviceName", "alertType", "timestamp"],
        ),
    ];

    schemas
        .into_iter()
        .map(|(event_type, fields)| {
            (
                event_type.to_string(),
                fields.iter().map(|f| f.to_string()).collect(),
            )
        })
        .collect()
}

/// Schema lookup; event types without a schema accept any payload
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Vec<String>>,
}

impl SchemaRegistry {
    pub fn new(schemas: HashMap<String, Vec<String>>) -> Self {
        Self { schemas }
    }

    /// Add or replace the schema for one event type
    pub fn register(&mut self, event_type: impl Into<String>, required: Vec<String>) {
        self.schemas.insert(event_type.into(), required);
    }

    pub fn required_fields(&self, event_type: &str) -> Option<&[String]> {
        self.schemas.get(event_type).map(Vec::as_slice)
    }

    /// Check that every required field is present (null counts as absent)
    pub fn validate(&self, event_type: &str, payload: &Payload) -> Result<(), BusError> {
        let Some(required) = self.schemas.get(event_type) else {
            return Ok(());
        };

        let missing: Vec<String> = required
            .iter()
            .filter(|field| payload.get(field.as_str()).map_or(true, |v| v.is_null()))
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BusError::SchemaValidation {
                event_type: event_type.to_string(),
                missing,
            })
        }
    }
}
