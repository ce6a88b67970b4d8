//! Service implementations and their method dispatch tables.

use serde::Serialize;
use serde::de::DeserializeOwned;
use srpc_protocol::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Future returned by a method handler.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value, MethodError>> + Send>>;

type Handler = Arc<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

/// Failure reported by a method. Sent back to the caller as an invocation
/// error.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MethodError(pub String);

impl MethodError {
    /// Create an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for MethodError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// One method overload: a parameter-type signature and its handler.
#[derive(Clone)]
pub struct Method {
    param_types: Vec<String>,
    handler: Handler,
}

impl Method {
    /// Parameter-type descriptors, in order.
    #[must_use]
    pub fn param_types(&self) -> &[String] {
        &self.param_types
    }

    /// Start the method with the given arguments.
    #[must_use]
    pub fn call(&self, args: Vec<Value>) -> MethodFuture {
        (self.handler)(args)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("param_types", &self.param_types)
            .finish_non_exhaustive()
    }
}

/// A service implementation: its methods keyed by name, each name carrying
/// one or more overloads.
#[derive(Debug, Clone)]
pub struct Service {
    name: String,
    methods: HashMap<String, Vec<Method>>,
}

impl Service {
    /// Start building a service.
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder::new(name)
    }

    /// Service identifier.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Find the overload of `name` whose signature is exactly `param_types`.
    #[must_use]
    pub fn method(&self, name: &str, param_types: &[String]) -> Option<&Method> {
        self.methods
            .get(name)?
            .iter()
            .find(|method| method.param_types == param_types)
    }

    /// Number of registered overloads across all names.
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.methods.values().map(Vec::len).sum()
    }
}

/// Builder for a [`Service`].
#[derive(Debug)]
pub struct ServiceBuilder {
    service: Service,
}

impl ServiceBuilder {
    /// Start a service with no methods.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            service: Service {
                name: name.into(),
                methods: HashMap::new(),
            },
        }
    }

    /// Register a method taking raw argument values.
    ///
    /// An existing overload with the same signature is replaced.
    #[must_use]
    pub fn method<F, Fut>(mut self, name: &str, param_types: &[&str], handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |args: Vec<Value>| -> MethodFuture { Box::pin(handler(args)) });
        let method = Method {
            param_types: param_types.iter().map(ToString::to_string).collect(),
            handler,
        };

        let overloads = self.service.methods.entry(name.to_string()).or_default();
        overloads.retain(|existing| existing.param_types != method.param_types);
        overloads.push(method);
        self
    }

    /// Register a method whose arguments deserialize as the tuple `A` and
    /// whose result serializes from `R`.
    ///
    /// Arguments that do not fit `A` fail the call with an invocation error.
    #[must_use]
    pub fn typed<A, R, F, Fut>(self, name: &str, param_types: &[&str], handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, MethodError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.method(name, param_types, move |args| {
            let parsed = serde_json::from_value::<A>(Value::Array(args));
            let handler = Arc::clone(&handler);
            async move {
                let args = parsed.map_err(|e| MethodError::new(format!("invalid arguments: {e}")))?;
                let result = (*handler)(args).await?;
                Ok(serde_json::to_value(result)?)
            }
        })
    }

    /// Finish the service.
    #[must_use]
    pub fn build(self) -> Service {
        self.service
    }
}

/// Service implementations by identifier, assembled before the server starts.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service, returning the one it replaced.
    pub fn register(&mut self, service: Service) -> Option<Arc<Service>> {
        self.services
            .insert(service.name.clone(), Arc::new(service))
    }

    /// Add a service, builder style.
    #[must_use]
    pub fn with(mut self, service: Service) -> Self {
        self.register(service);
        self
    }

    /// Look up a service by identifier.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<Service>> {
        self.services.get(name)
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no service is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
