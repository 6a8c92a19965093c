//! Service definitions and live instances.
//!
//! A definition carries a factory and a typed method table built once at
//! registration. The mesh looks methods up in that table instead of
//! dispatching on arbitrary objects by name.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;

/// Positional call arguments
pub type CallArgs = Vec<Value>;

type AnyService = Arc<dyn Any + Send + Sync>;
type MethodHandler =
    Arc<dyn Fn(AnyService, CallArgs) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type Factory = Arc<dyn Fn() -> Constructed + Send + Sync>;

/// Lifecycle hooks every managed service implements
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// One-time initialization, awaited before the instance is handed out
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Periodic health probe; `Ok(false)` or `Err` marks the service unhealthy
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

struct Constructed {
    service: Arc<dyn Service>,
    any: AnyService,
}

/// Static description of a service, immutable after registration
#[derive(Clone)]
pub struct ServiceDefinition {
    /// Unique service name
    pub name: String,

    /// Services that must be loaded and healthy first
    pub dependencies: Vec<String>,

    /// Lower loads first
    pub priority: i32,

    /// Loaded at startup by `load_critical`
    pub critical: bool,

    /// Deferred until first use
    pub lazy: bool,

    factory: Factory,
    methods: Arc<HashMap<String, MethodHandler>>,
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("priority", &self.priority)
            .field("critical", &self.critical)
            .field("lazy", &self.lazy)
            .field("methods", &methods)
            .finish()
    }
}

impl ServiceDefinition {
    /// Start building a definition for service type `S`
    pub fn builder<S, F>(name: impl Into<String>, factory: F) -> ServiceDefinitionBuilder<S>
    where
        S: Service,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move || {
            let service = Arc::new(factory());
            Constructed {
                service: service.clone(),
                any: service,
            }
        });

        ServiceDefinitionBuilder {
            definition: ServiceDefinition {
                name: name.into(),
                dependencies: Vec::new(),
                priority: 0,
                critical: false,
                lazy: true,
                factory,
                methods: Arc::new(HashMap::new()),
            },
            methods: HashMap::new(),
            _service: PhantomData,
        }
    }

    /// Method names in sorted order
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the factory. The instance is not initialized yet.
    pub(crate) fn instantiate(&self) -> ServiceInstance {
        let constructed = (self.factory)();
        ServiceInstance {
            name: Arc::from(self.name.as_str()),
            service: constructed.service,
            any: constructed.any,
            methods: self.methods.clone(),
            loaded_at: Utc::now(),
        }
    }
}

/// Builder for `ServiceDefinition`, typed on the concrete service
pub struct ServiceDefinitionBuilder<S> {
    definition: ServiceDefinition,
    methods: HashMap<String, MethodHandler>,
    _service: PhantomData<fn() -> S>,
}

impl<S: Service> ServiceDefinitionBuilder<S> {
    pub fn depends_on<I, N>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.definition
            .dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.definition.priority = priority;
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.definition.critical = critical;
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.definition.lazy = lazy;
        self
    }

    /// Register a callable method with a strongly typed handler
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<S>, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = name.into();
        let service_name = self.definition.name.clone();
        let handler: MethodHandler = Arc::new(move |any: AnyService, args: CallArgs| {
            match any.downcast::<S>() {
                Ok(service) => handler(service, args).boxed(),
                Err(_) => future::ready(Err(anyhow!(
                    "instance of '{}' has an unexpected type",
                    service_name
                )))
                .boxed(),
            }
        });
        self.methods.insert(name, handler);
        self
    }

    pub fn build(mut self) -> ServiceDefinition {
        self.definition.methods = Arc::new(self.methods);
        self.definition
    }
}

/// A constructed, initialized service handed out by the registry.
///
/// Cloning is cheap and every clone refers to the same instance.
#[derive(Clone)]
pub struct ServiceInstance {
    name: Arc<str>,
    service: Arc<dyn Service>,
    any: AnyService,
    methods: Arc<HashMap<String, MethodHandler>>,
    loaded_at: DateTime<Utc>,
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("name", &self.name)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

impl ServiceInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    /// Typed access for consumers that know the concrete service type
    pub fn downcast<S: Service>(&self) -> Option<Arc<S>> {
        self.any.clone().downcast::<S>().ok()
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Start a method call; `None` if the method is not in the table
    pub fn invoke(
        &self,
        method: &str,
        args: CallArgs,
    ) -> Option<BoxFuture<'static, Result<Value>>> {
        let handler = self.methods.get(method)?;
        Some(handler(self.any.clone(), args))
    }

    /// Whether both handles refer to the same constructed object
    pub fn same_instance(&self, other: &ServiceInstance) -> bool {
        Arc::ptr_eq(&self.any, &other.any)
    }
}
