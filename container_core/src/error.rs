//! Error types for the component container.
//!
//! This module defines a structured error hierarchy that enables precise
//! error handling throughout the container. Errors raised while serving a
//! call are folded into the call's response; these types surface directly
//! only from management operations (deploy, start, stop, configuration).

use thiserror::Error;

use crate::types::{ComponentKind, IdentityKey, LockType};

/// Root error type for the container.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to instance pooling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("Pool {0} exhausted")]
    Exhausted(String),

    #[error("Instance {0} was already removed")]
    InstanceAlreadyRemoved(IdentityKey),

    #[error("Identity {0} was never issued by this pool")]
    UnknownIdentity(IdentityKey),

    #[error("Instance {0} is checked out by another call")]
    InstanceInUse(IdentityKey),

    #[error("Failed to create instance: {0}")]
    InstanceCreationFailed(String),

    #[error("Pool {0} is shutting down")]
    ShuttingDown(String),
}

/// Errors raised when a call cannot obtain its instance or singleton lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("Concurrent access denied: {0} is busy")]
    ConcurrentAccessDenied(String),

    #[error("Concurrent access timeout: {target} still busy after {waited_ms}ms")]
    ConcurrentAccessTimeout { target: String, waited_ms: u64 },

    /// A call re-entered a target its own thread already holds, in a way
    /// the held lock cannot serve.
    #[error("Illegal loopback: {target} is held {held:?} by this thread, {requested:?} requested")]
    IllegalLoopback {
        target: String,
        held: LockType,
        requested: LockType,
    },
}

/// Errors in a component's method table.
///
/// Failures of individual calls are never raised as errors; they are
/// reported in the call's response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("Invalid method descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Errors raised by the bean-instance lifecycle collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("Instance construction failed: {0}")]
    ConstructionFailed(String),

    #[error("Component {0} is not started")]
    NotStarted(String),

    #[error("Component {0} is stopped")]
    Stopped(String),
}

/// Errors related to the component registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Component already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Component not found: {0}")]
    NotFound(String),
}

/// Errors in container or component configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Access timeout value {0} is below -1")]
    InvalidAccessTimeout(i64),

    #[error("Pool minimum {min} exceeds maximum {max}")]
    InvalidPoolBounds { min: usize, max: usize },

    #[error("Unsupported config file format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Component {0} has no instance lifecycle")]
    MissingLifecycle(String),

    #[error("Component {name} is {actual}, not {expected}")]
    KindMismatch {
        name: String,
        expected: ComponentKind,
        actual: ComponentKind,
    },
}

/// Result type used throughout the container.
pub type Result<T> = std::result::Result<T, Error>;
