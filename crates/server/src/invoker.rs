//! Resolution and invocation of service methods.

use crate::filter::panic_message;
use crate::service::ServiceRegistry;

use futures::FutureExt;
use srpc_protocol::{RemoteError, RemoteErrorKind, Request, Value};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, warn};

/// Invokes requests against a [`ServiceRegistry`].
#[derive(Debug, Clone)]
pub struct Invoker {
    services: Arc<ServiceRegistry>,
}

impl Invoker {
    /// Invoke against `services`.
    #[must_use]
    pub const fn new(services: Arc<ServiceRegistry>) -> Self {
        Self { services }
    }

    /// Resolve the service and method named by `request` and run it.
    ///
    /// # Errors
    ///
    /// Returns the error to answer the caller with: service or method not
    /// found, an argument count that does not match the signature, or a
    /// failed or panicking method.
    pub async fn invoke(&self, request: Request) -> Result<Value, RemoteError> {
        let Request {
            service,
            method,
            param_types,
            args,
        } = request;

        let implementation = self.services.get(&service).ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::ServiceNotFound,
                format!("no implementation for service '{service}'"),
            )
        })?;

        let target = implementation
            .method(&method, &param_types)
            .ok_or_else(|| {
                RemoteError::new(
                    RemoteErrorKind::MethodNotFound,
                    format!("{service}.{method}({})", param_types.join(", ")),
                )
            })?;

        if args.len() != param_types.len() {
            return Err(RemoteError::new(
                RemoteErrorKind::BadRequest,
                format!(
                    "{service}.{method} expects {} arguments, got {}",
                    param_types.len(),
                    args.len()
                ),
            ));
        }

        debug!(%service, %method, "invoking");

        let outcome = match catch_unwind(AssertUnwindSafe(|| target.call(args))) {
            Ok(call) => AssertUnwindSafe(call).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!(%service, %method, error = %e, "method failed");
                Err(RemoteError::new(RemoteErrorKind::Invocation, e.0))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(%service, %method, error = %message, "method panicked");
                Err(RemoteError::new(RemoteErrorKind::Invocation, message))
            }
        }
    }
}
