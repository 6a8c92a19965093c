//! Event bus.
//!
//! - EventBus: publish/subscribe with retry and replay
//! - SchemaRegistry: required fields per event type
//! - Middleware: publish-time transformation, selected by glob
//! - DeadLetterQueue: events that exhausted their delivery retries

pub mod dead_letter;
pub mod event_bus;
pub mod middleware;
pub mod schema;

pub use dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use event_bus::{
    default_retry_policies, BusConfig, BusMetrics, EventBus, EventTypeMetrics, Filter, SweepReport,
};
pub use middleware::{MetricsAnnotator, Middleware, MiddlewareChain, MiddlewareFn};
pub use schema::{default_schemas, SchemaRegistry};
