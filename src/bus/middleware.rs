//! Publish-time middleware, selected by glob pattern on the event type.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use glob::Pattern;
use serde_json::{Map, Value};

use crate::core::error::BusError;
use crate::domain::Event;

/// Transforms or rejects an event before it is recorded and dispatched
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Mutate the event in place; an error aborts the publish
    fn process(&self, event: &mut Event) -> Result<()>;
}

/// Middleware built from a closure
pub struct MiddlewareFn<F> {
    name: String,
    f: F,
}

impl<F> MiddlewareFn<F>
where
    F: Fn(&mut Event) -> Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(&mut Event) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, event: &mut Event) -> Result<()> {
        (self.f)(event)
    }
}

/// Stamps `middleware.metrics.processedAt` onto every payload
#[derive(Debug, Default)]
pub struct MetricsAnnotator;

impl Middleware for MetricsAnnotator {
    fn name(&self) -> &str {
        "metrics"
    }

    fn process(&self, event: &mut Event) -> Result<()> {
        let section = event
            .payload
            .entry("middleware")
            .or_insert_with(|| Value::Object(Map::new()));
        if !section.is_object() {
            *section = Value::Object(Map::new());
        }

        if let Value::Object(section) = section {
            let mut metrics = Map::new();
            metrics.insert(
                "processedAt".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
            section.insert("metrics".to_string(), Value::Object(metrics));
        }
        Ok(())
    }
}

/// Ordered middleware list
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    entries: Vec<(Pattern, Arc<dyn Middleware>)>,
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|(pattern, mw)| format!("{} => {}", pattern.as_str(), mw.name())),
            )
            .finish()
    }
}

impl MiddlewareChain {
    /// Append middleware for event types matching `pattern`
    pub fn add(&mut self, pattern: &str, middleware: Arc<dyn Middleware>) -> Result<(), BusError> {
        let pattern = Pattern::new(pattern).map_err(|e| BusError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        self.entries.push((pattern, middleware));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every matching middleware in registration order
    pub fn apply(&self, event: &mut Event) -> Result<(), BusError> {
        for (pattern, middleware) in &self.entries {
            if !pattern.matches(&event.event_type) {
                continue;
            }
            middleware
                .process(event)
                .map_err(|e| BusError::Middleware {
                    name: middleware.name().to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}
