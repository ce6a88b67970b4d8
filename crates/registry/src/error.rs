use thiserror::Error;

/// Errors returned by registry implementations.
#[derive(Clone, Debug, Error)]
pub enum RegistryError {
    /// Nothing is known about the service.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// The backing store failed.
    #[error("Registry backend error: {0}")]
    Backend(String),

    /// Registry definition could not be loaded.
    #[error("Invalid registry definition: {0}")]
    Definition(String),
}
