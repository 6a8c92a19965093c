//! In-process publish/subscribe bus.
//!
//! `publish` validates the payload against the type's schema, runs the
//! middleware chain, records the event in history and delivers it to every
//! matching subscription concurrently. It returns once those first
//! deliveries finished; failed deliveries are retried on their own timers
//! and dead-lettered when the type's retry policy is exhausted.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use super::middleware::{MetricsAnnotator, Middleware, MiddlewareChain};
use super::schema::{default_schemas, SchemaRegistry};
use crate::core::error::BusError;
use crate::core::tasks::TaskSet;
use crate::domain::{event_types, Event, Payload};
use crate::resilience::RetryPolicy;

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Events kept for `history` and `replay`
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Dead-letter queue capacity
    #[serde(default = "default_max_dead_letters")]
    pub max_dead_letters: usize,

    /// Interval of the dead-letter sweep in milliseconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Entries redelivered per sweep
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch_size: usize,

    /// Policy for event types without their own entry
    #[serde(default = "RetryPolicy::none")]
    pub default_retry: RetryPolicy,

    /// Per-type retry policies, layered over the built-in ones
    #[serde(default)]
    pub retry_policies: HashMap<String, RetryPolicy>,

    /// Extra or replacement schemas, layered over the built-in ones
    #[serde(default)]
    pub schemas: HashMap<String, Vec<String>>,

    /// Install the `processedAt` annotator on every event
    #[serde(default = "default_true")]
    pub metrics_middleware: bool,
}

fn default_max_history() -> usize {
    10_000
}
fn default_max_dead_letters() -> usize {
    1000
}
fn default_sweep_interval() -> u64 {
    5 * 60 * 1000
}
fn default_sweep_batch() -> usize {
    10
}
fn default_true() -> bool {
    true
}

impl BusConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            max_dead_letters: default_max_dead_letters(),
            sweep_interval_ms: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch(),
            default_retry: RetryPolicy::none(),
            retry_policies: HashMap::new(),
            schemas: HashMap::new(),
            metrics_middleware: true,
        }
    }
}

/// Built-in per-type delivery retry policies
pub fn default_retry_policies() -> HashMap<String, RetryPolicy> {
    let policies = [
        (event_types::USER_MESSAGE, 3, 1000, 2.0, 10_000),
        (event_types::AI_RESPONSE, 2, 500, 1.5, 5000),
        (event_types::SERVICE_HEALTH, 1, 2000, 1.0, 2000),
        (event_types::OPTIMIZATION_COMPLETED, 2, 1000, 2.0, 8000),
    ];

    policies
        .into_iter()
        .map(|(event_type, max_retries, base_delay_ms, backoff_multiplier, max_delay_ms)| {
            (
                event_type.to_string(),
                RetryPolicy {
                    max_retries,
                    base_delay_ms,
                    max_delay_ms,
                    backoff_multiplier,
                    jitter: false,
                },
            )
        })
        .collect()
}

/// Restricts which events a subscription receives
#[derive(Clone)]
pub enum Filter {
    /// Payload field equals the given value
    Property { key: String, value: Value },

    /// Arbitrary predicate over the event
    Predicate(Arc<dyn Fn(&Event) -> bool + Send + Sync>),
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Property { key, value } => f
                .debug_struct("Property")
                .field("key", key)
                .field("value", value)
                .finish(),
            Filter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl Filter {
    pub fn property(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Property {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Filter::Predicate(Arc::new(f))
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Filter::Property { key, value } => event.payload.get(key) == Some(value),
            Filter::Predicate(f) => f(event),
        }
    }
}

struct Subscription {
    id: Uuid,
    event_type: String,
    handler: Handler,
    filter: Option<Filter>,
    active: AtomicBool,
}

impl Subscription {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn accepts(&self, event: &Event) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(event))
    }
}

/// Counters and sizes reported by `EventBus::metrics`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusMetrics {
    pub published: u64,
    pub delivered: u64,
    pub failed_deliveries: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub rejected: u64,
    pub filtered: u64,
    pub subscriptions: usize,
    pub history_size: usize,
    pub dead_letter_size: usize,
    /// Events published in the last minute
    pub events_last_minute: usize,
    /// Mean handler run time over every delivery attempt
    #[serde(default)]
    pub average_delivery_ms: f64,
    #[serde(default)]
    pub by_type: BTreeMap<String, EventTypeMetrics>,
}

/// Counters for one event type, reported by `EventBus::metrics_for`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTypeMetrics {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub average_delivery_ms: f64,
    pub last_published: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct TypeStats {
    metrics: EventTypeMetrics,
    attempts: u64,
    total_delivery_ms: f64,
}

impl TypeStats {
    fn record_attempt(&mut self, ok: bool, elapsed: Duration) {
        if ok {
            self.metrics.delivered += 1;
        } else {
            self.metrics.failed += 1;
        }
        self.attempts += 1;
        self.total_delivery_ms += elapsed.as_secs_f64() * 1000.0;
        self.metrics.average_delivery_ms = self.total_delivery_ms / self.attempts as f64;
    }
}

/// Result of one dead-letter sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub recovered: usize,
    pub failed: usize,
    pub remaining: usize,
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed_deliveries: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    rejected: AtomicU64,
    filtered: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Failures are retried and dead-lettered
    Normal,
    /// Dead-letter sweep: failures are only reported back
    Redelivery,
}

#[derive(Debug, Default)]
struct DispatchOutcome {
    delivered: usize,
    filtered: usize,
    errors: Vec<String>,
}

struct BusInner {
    config: BusConfig,
    schemas: RwLock<SchemaRegistry>,
    retry_policies: RwLock<HashMap<String, RetryPolicy>>,
    middleware: RwLock<MiddlewareChain>,
    subscriptions: RwLock<HashMap<String, Vec<Arc<Subscription>>>>,
    history: Mutex<VecDeque<Event>>,
    dead_letters: Mutex<DeadLetterQueue>,
    counters: BusCounters,
    by_type: Mutex<HashMap<String, TypeStats>>,
    retries: TaskSet,
}

/// Cheaply cloneable handle to one event bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscription_count())
            .field("middleware", &*self.inner.middleware.read())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let mut schemas = default_schemas();
        schemas.extend(config.schemas.clone());

        let mut retry_policies = default_retry_policies();
        retry_policies.extend(config.retry_policies.clone());

        let mut middleware = MiddlewareChain::default();
        if config.metrics_middleware {
            // "*" is always a valid pattern
            let _ = middleware.add("*", Arc::new(MetricsAnnotator));
        }

        Self {
            inner: Arc::new(BusInner {
                schemas: RwLock::new(SchemaRegistry::new(schemas)),
                retry_policies: RwLock::new(retry_policies),
                middleware: RwLock::new(middleware),
                subscriptions: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                dead_letters: Mutex::new(DeadLetterQueue::new(config.max_dead_letters)),
                counters: BusCounters::default(),
                by_type: Mutex::new(HashMap::new()),
                retries: TaskSet::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Add or replace the required fields for an event type
    pub fn register_schema(&self, event_type: &str, required: Vec<String>) {
        self.inner.schemas.write().register(event_type, required);
    }

    pub fn set_retry_policy(&self, event_type: &str, policy: RetryPolicy) {
        self.inner
            .retry_policies
            .write()
            .insert(event_type.to_string(), policy);
    }

    /// Delivery retry policy in effect for an event type
    pub fn retry_policy_for(&self, event_type: &str) -> RetryPolicy {
        self.inner
            .retry_policies
            .read()
            .get(event_type)
            .cloned()
            .unwrap_or_else(|| self.inner.config.default_retry.clone())
    }

    /// Append middleware for event types matching the glob `pattern`
    pub fn use_middleware(
        &self,
        pattern: &str,
        middleware: Arc<dyn Middleware>,
    ) -> Result<(), BusError> {
        self.inner.middleware.write().add(pattern, middleware)
    }

    /// Register a handler for one event type.
    ///
    /// Handlers of the same type are invoked in registration order.
    pub fn subscribe<F, Fut>(
        &self,
        event_type: &str,
        handler: F,
        filter: Option<Filter>,
    ) -> Result<Uuid, BusError>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if event_type.trim().is_empty() {
            return Err(BusError::EmptyEventType);
        }

        let boxed: Handler = Arc::new(move |event| handler(event).boxed());
        let subscription = Arc::new(Subscription {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            handler: boxed,
            filter,
            active: AtomicBool::new(true),
        });
        let id = subscription.id;

        self.inner
            .subscriptions
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(subscription);

        debug!(event_type, subscription = %id, "Subscription added");
        Ok(id)
    }

    /// Remove a subscription; its pending retries are dropped
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut subscriptions = self.inner.subscriptions.write();
        for list in subscriptions.values_mut() {
            if let Some(idx) = list.iter().position(|s| s.id == id) {
                let subscription = list.remove(idx);
                subscription.active.store(false, Ordering::SeqCst);
                debug!(
                    event_type = %subscription.event_type,
                    subscription = %id,
                    "Subscription removed"
                );
                return true;
            }
        }
        false
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().values().map(Vec::len).sum()
    }

    /// Publish an event and wait for its initial deliveries
    pub async fn publish(&self, event_type: &str, payload: Payload) -> Result<Uuid, BusError> {
        if event_type.trim().is_empty() {
            return Err(BusError::EmptyEventType);
        }

        let event = Event::new(event_type, payload);
        let id = event.id;
        let outcome = self.process(event, Delivery::Normal).await?;

        debug!(
            event_type,
            event_id = %id,
            delivered = outcome.delivered,
            failed = outcome.errors.len(),
            filtered = outcome.filtered,
            "Event published"
        );
        Ok(id)
    }

    /// Re-dispatch recorded events of one type within `[from, to]`
    pub async fn replay(
        &self,
        event_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>, BusError> {
        if from > to {
            return Err(BusError::InvalidRange { from, to });
        }

        let events: Vec<Event> = self
            .inner
            .history
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type && e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect();

        for event in &events {
            self.dispatch(event, Delivery::Normal).await;
        }

        info!(event_type, count = events.len(), "Replayed events");
        Ok(events)
    }

    /// Most recent `limit` events, oldest first, optionally of one type
    pub fn history(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.inner.history.lock();
        let mut events: Vec<Event> = history
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    pub fn dead_letter_queue(&self) -> Vec<DeadLetterEntry> {
        self.inner.dead_letters.lock().entries()
    }

    /// Drop every dead-lettered event; returns how many were removed
    pub fn clear_dead_letters(&self) -> usize {
        let cleared = self.inner.dead_letters.lock().clear();
        if cleared > 0 {
            info!(count = cleared, "Dead-letter queue cleared");
        }
        cleared
    }

    /// Load entries from a snapshot, skipping event ids already queued
    pub fn restore_dead_letters(&self, entries: Vec<DeadLetterEntry>) -> usize {
        let mut queue = self.inner.dead_letters.lock();
        entries.into_iter().filter(|e| queue.push(e.clone())).count()
    }

    /// Redeliver every dead-lettered event as a fresh publish, one batch of
    /// `sweep_batch_size` at a time.
    ///
    /// An entry is removed once every delivery of its redelivery succeeded;
    /// failing entries stay queued for the next sweep.
    pub async fn reprocess_dead_letters(&self) -> SweepReport {
        let queued = self.inner.dead_letters.lock().entries();
        let mut report = SweepReport {
            attempted: queued.len(),
            ..Default::default()
        };

        for batch in queued.chunks(self.inner.config.sweep_batch_size.max(1)) {
            let failures =
                join_all(batch.iter().map(|entry| self.redeliver(entry.event.clone()))).await;

            let mut queue = self.inner.dead_letters.lock();
            for (entry, failure) in batch.iter().zip(failures) {
                let id = entry.event.id;
                match failure {
                    None => {
                        queue.remove(id);
                        report.recovered += 1;
                    }
                    Some(error) => {
                        debug!(event_id = %id, error = %error, "Redelivery failed");
                        queue.mark_failed(id, error);
                        report.failed += 1;
                    }
                }
            }
        }

        report.remaining = self.inner.dead_letters.lock().len();
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                recovered = report.recovered,
                remaining = report.remaining,
                "Dead-letter sweep finished"
            );
        }
        report
    }

    /// One redelivery; the error when any delivery failed
    async fn redeliver(&self, mut event: Event) -> Option<String> {
        event.retry_count = 0;
        match self.process(event, Delivery::Redelivery).await {
            Ok(outcome) if outcome.errors.is_empty() => None,
            Ok(outcome) => Some(outcome.errors.join("; ")),
            Err(e) => Some(e.to_string()),
        }
    }

    pub fn metrics(&self) -> BusMetrics {
        let counters = &self.inner.counters;
        let (average_delivery_ms, by_type) = {
            let stats = self.inner.by_type.lock();
            let attempts: u64 = stats.values().map(|s| s.attempts).sum();
            let total_ms: f64 = stats.values().map(|s| s.total_delivery_ms).sum();
            let average = if attempts == 0 {
                0.0
            } else {
                total_ms / attempts as f64
            };
            let by_type = stats
                .iter()
                .map(|(event_type, s)| (event_type.clone(), s.metrics.clone()))
                .collect::<BTreeMap<_, _>>();
            (average, by_type)
        };
        let cutoff = Utc::now() - ChronoDuration::seconds(60);
        let (history_size, events_last_minute) = {
            let history = self.inner.history.lock();
            let recent = history.iter().filter(|e| e.timestamp >= cutoff).count();
            (history.len(), recent)
        };

        BusMetrics {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed_deliveries: counters.failed_deliveries.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            filtered: counters.filtered.load(Ordering::Relaxed),
            subscriptions: self.subscription_count(),
            history_size,
            dead_letter_size: self.inner.dead_letters.lock().len(),
            events_last_minute,
            average_delivery_ms,
            by_type,
        }
    }

    /// Counters for one event type; `None` if it was never published
    pub fn metrics_for(&self, event_type: &str) -> Option<EventTypeMetrics> {
        self.inner
            .by_type
            .lock()
            .get(event_type)
            .map(|stats| stats.metrics.clone())
    }

    fn with_type_stats(&self, event_type: &str, f: impl FnOnce(&mut TypeStats)) {
        let mut by_type = self.inner.by_type.lock();
        f(by_type.entry(event_type.to_string()).or_default());
    }

    /// Delivery retries waiting on their timers
    pub fn pending_retries(&self) -> usize {
        self.inner.retries.active()
    }

    /// Cancel all pending retries. Later delivery failures dead-letter immediately.
    pub fn shutdown(&self) {
        self.inner.retries.shutdown();
    }

    async fn process(&self, mut event: Event, mode: Delivery) -> Result<DispatchOutcome, BusError> {
        let validation = self
            .inner
            .schemas
            .read()
            .validate(&event.event_type, &event.payload);
        if let Err(err) = validation {
            bump(&self.inner.counters.rejected);
            warn!(event_type = %event.event_type, error = %err, "Event rejected");
            return Err(err);
        }

        let applied = self.inner.middleware.read().apply(&mut event);
        if let Err(err) = applied {
            bump(&self.inner.counters.rejected);
            warn!(event_type = %event.event_type, error = %err, "Event rejected by middleware");
            return Err(err);
        }

        if mode == Delivery::Normal {
            self.record(&event);
            bump(&self.inner.counters.published);
            let published_at = event.timestamp;
            self.with_type_stats(&event.event_type, |stats| {
                stats.metrics.published += 1;
                stats.metrics.last_published = Some(published_at);
            });
        }

        Ok(self.dispatch(&event, mode).await)
    }

    fn record(&self, event: &Event) {
        let mut history = self.inner.history.lock();
        history.push_back(event.clone());
        while history.len() > self.inner.config.max_history {
            history.pop_front();
        }
    }

    async fn dispatch(&self, event: &Event, mode: Delivery) -> DispatchOutcome {
        let subscribers: Vec<Arc<Subscription>> = self
            .inner
            .subscriptions
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        let mut outcome = DispatchOutcome::default();
        let mut targets = Vec::with_capacity(subscribers.len());
        for subscription in subscribers {
            if !subscription.is_active() {
                continue;
            }
            if subscription.accepts(event) {
                targets.push(subscription);
            } else {
                outcome.filtered += 1;
                bump(&self.inner.counters.filtered);
            }
        }

        let results = join_all(
            targets
                .iter()
                .map(|subscription| invoke(&subscription.handler, event.clone())),
        )
        .await;

        for (subscription, (result, elapsed)) in targets.into_iter().zip(results) {
            self.with_type_stats(&event.event_type, |stats| {
                stats.record_attempt(result.is_ok(), elapsed)
            });
            match result {
                Ok(()) => {
                    outcome.delivered += 1;
                    bump(&self.inner.counters.delivered);
                }
                Err(message) => {
                    bump(&self.inner.counters.failed_deliveries);
                    let error = BusError::DeliveryFailure {
                        subscription_id: subscription.id,
                        message,
                    }
                    .to_string();
                    warn!(
                        event_type = %event.event_type,
                        event_id = %event.id,
                        error = %error,
                        "Event delivery failed"
                    );
                    outcome.errors.push(error.clone());
                    if mode == Delivery::Normal {
                        self.handle_failure(subscription, event.clone(), error);
                    }
                }
            }
        }

        outcome
    }

    /// Schedule the next delivery attempt, or dead-letter when none remain
    fn handle_failure(&self, subscription: Arc<Subscription>, event: Event, error: String) {
        let policy = self.retry_policy_for(&event.event_type);
        let failures = event.retry_count.saturating_add(1);

        if !policy.should_retry(failures) || self.inner.retries.is_shutdown() {
            self.dead_letter(&subscription, event, error);
            return;
        }

        let delay = policy.delay_for_attempt(event.retry_count);
        bump(&self.inner.counters.retries);
        self.with_type_stats(&event.event_type, |stats| stats.metrics.retried += 1);
        debug!(
            event_type = %event.event_type,
            event_id = %event.id,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "Scheduling delivery retry"
        );

        let bus = Arc::downgrade(&self.inner);
        self.inner.retries.spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = bus.upgrade() else {
                return;
            };
            let bus = EventBus { inner };

            if !subscription.is_active() {
                debug!(subscription = %subscription.id, "Dropping retry for removed subscription");
                return;
            }

            let next = event.next_attempt();
            let (result, elapsed) = invoke(&subscription.handler, next.clone()).await;
            bus.with_type_stats(&next.event_type, |stats| {
                stats.record_attempt(result.is_ok(), elapsed)
            });
            match result {
                Ok(()) => {
                    bump(&bus.inner.counters.delivered);
                    debug!(event_id = %next.id, attempt = next.retry_count, "Retry delivered");
                }
                Err(message) => {
                    bump(&bus.inner.counters.failed_deliveries);
                    let error = BusError::DeliveryFailure {
                        subscription_id: subscription.id,
                        message,
                    }
                    .to_string();
                    bus.handle_failure(subscription, next, error);
                }
            }
        });
    }

    fn dead_letter(&self, subscription: &Subscription, event: Event, error: String) {
        let event_id = event.id;
        let event_type = event.event_type.clone();
        let attempts = event.retry_count.saturating_add(1);

        let added = self.inner.dead_letters.lock().push(DeadLetterEntry::new(
            event,
            error.clone(),
            Some(subscription.id),
        ));

        if added {
            bump(&self.inner.counters.dead_lettered);
            self.with_type_stats(&event_type, |stats| stats.metrics.dead_lettered += 1);
            warn!(
                event_type = %event_type,
                event_id = %event_id,
                subscription = %subscription.id,
                attempts,
                error = %error,
                "Event moved to dead-letter queue"
            );
        }
    }
}

/// Run one handler, turning errors and panics into a message. Also returns how long it ran.
async fn invoke(handler: &Handler, event: Event) -> (Result<(), String>, Duration) {
    let handler = handler.clone();
    let started = Instant::now();
    let result = match AssertUnwindSafe(async move { handler(event).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(panic_message(panic)),
    };
    (result, started.elapsed())
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payload;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_in_order() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let seen = seen.clone();
            bus.subscribe(
                "ping",
                move |_event| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().push(name);
                        Ok(())
                    }
                },
                None,
            )
            .unwrap();
        }

        bus.publish("ping", Payload::new()).await.unwrap();
        assert_eq!(*seen.lock(), vec!["first", "second"]);
        assert_eq!(bus.metrics().delivered, 2);
    }

    #[tokio::test]
    async fn test_metrics_middleware_can_be_disabled() {
        let bus = EventBus::new(BusConfig {
            metrics_middleware: false,
            ..Default::default()
        });
        bus.publish("ping", Payload::new()).await.unwrap();
        assert!(bus.history(None, 1)[0].payload.get("middleware").is_none());

        let annotated = EventBus::default();
        annotated.publish("ping", Payload::new()).await.unwrap();
        assert!(annotated.history(None, 1)[0].payload.get("middleware").is_some());
    }

    #[tokio::test]
    async fn test_property_filter() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        bus.subscribe(
            "ping",
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Some(Filter::property("userId", "u1")),
        )
        .unwrap();

        bus.publish("ping", payload(json!({"userId": "u2"}))).await.unwrap();
        bus.publish("ping", payload(json!({"userId": "u1"}))).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let metrics = bus.metrics();
        assert_eq!(metrics.filtered, 1);
        assert_eq!(metrics.published, 2);
    }

    async fn explode(_event: Event) -> anyhow::Result<()> {
        panic!("bad handler")
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicU32::new(0));

        bus.subscribe("ping", explode, None).unwrap();
        let counter = hits.clone();
        bus.subscribe(
            "ping",
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            None,
        )
        .unwrap();

        assert!(bus.publish("ping", Payload::new()).await.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // no retry policy for "ping": straight to the dead-letter queue
        let dlq = bus.dead_letter_queue();
        assert_eq!(dlq.len(), 1);
        assert!(dlq[0].error.contains("handler panicked"));
    }

    #[tokio::test]
    async fn test_empty_event_type_rejected() {
        let bus = EventBus::default();
        assert!(matches!(
            bus.publish("  ", Payload::new()).await,
            Err(BusError::EmptyEventType)
        ));
        assert!(matches!(
            bus.subscribe("", |_| async { Ok(()) }, None),
            Err(BusError::EmptyEventType)
        ));
    }

    #[test]
    fn test_config_yaml_defaults() {
        let config: BusConfig = serde_yaml::from_str("max_history: 50").unwrap();
        assert_eq!(config.max_history, 50);
        assert_eq!(config.max_dead_letters, 1000);
        assert_eq!(config.sweep_batch_size, 10);
        assert!(config.metrics_middleware);
        assert_eq!(config.default_retry.max_retries, 0);
    }

    #[test]
    fn test_default_retry_policies() {
        let bus = EventBus::default();
        assert_eq!(bus.retry_policy_for("user_message").max_retries, 3);
        assert_eq!(bus.retry_policy_for("ai_response").base_delay_ms, 500);
        assert_eq!(bus.retry_policy_for("unknown").max_retries, 0);
    }
}
