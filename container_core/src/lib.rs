//! Container Core - shared types and interfaces
//!
//! This crate defines the vocabulary shared by the pool, the access
//! controllers and the invocation runtime: identifiers, access-timeout
//! policy, business faults, invocation events, the error hierarchy and the
//! collaborator traits the core calls into.

pub mod error;
pub mod event;
pub mod fault;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use event::{InvocationEvent, InvocationEventKind};
pub use fault::{BeanFault, InvokeFailure};
pub use traits::{
    ApplicationExceptionRegistry, ClassLoaderProvider, EventDispatcher, FnLifecycle,
    InstanceLifecycle, RemovalListener,
};
pub use types::{
    AccessMode, AccessTimeout, CallerIdentity, ClassLoaderHandle, ComponentKind,
    ConcurrencyManagement, IdentityKey, InstanceId, InvocationId, LockType, MethodHash,
    OperationState, TimeUnit,
};
