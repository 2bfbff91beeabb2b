//! Collaborator interfaces of the invocation core.
//!
//! Bean construction, event sinks, application-exception metadata and
//! loader scoping are supplied by the surrounding container.

use crate::error::LifecycleError;
use crate::event::InvocationEvent;
use crate::fault::BeanFault;
use crate::types::{ClassLoaderHandle, IdentityKey};

/// Construction and destruction of component instances.
pub trait InstanceLifecycle<B>: Send + Sync {
    /// Build a fully initialized instance.
    fn create(&self) -> Result<B, LifecycleError>;

    /// Tear an instance down. Called exactly once per created instance
    /// that the pool destroys.
    fn destroy(&self, _bean: B) {}
}

/// Adapts a constructor closure into an [`InstanceLifecycle`].
pub struct FnLifecycle<F> {
    create: F,
}

impl<F> FnLifecycle<F> {
    /// Wrap `create`.
    pub fn new(create: F) -> Self {
        Self { create }
    }
}

impl<B, F> InstanceLifecycle<B> for FnLifecycle<F>
where
    F: Fn() -> Result<B, LifecycleError> + Send + Sync,
{
    fn create(&self) -> Result<B, LifecycleError> {
        (self.create)()
    }
}

/// Receives begin/end/error events synchronously.
///
/// Implementations must not block materially and must handle their own
/// failures; nothing is surfaced to the business caller.
pub trait EventDispatcher: Send + Sync {
    /// Deliver one event.
    fn dispatch(&self, event: &InvocationEvent);
}

/// Answers whether a fault is a declared application exception.
pub trait ApplicationExceptionRegistry: Send + Sync {
    /// Whether `fault` is a business-level failure rather than a
    /// container fault.
    fn is_application_exception(&self, fault: &BeanFault) -> bool;
}

/// Supplies the loader installed while a component's code runs.
pub trait ClassLoaderProvider: Send + Sync {
    /// The component's defining loader.
    fn class_loader(&self) -> ClassLoaderHandle;
}

impl ClassLoaderProvider for ClassLoaderHandle {
    fn class_loader(&self) -> ClassLoaderHandle {
        self.clone()
    }
}

/// Notified when a keyed instance is removed and its key retired.
pub trait RemovalListener: Send + Sync {
    /// `key` is dead and will never be handed out again.
    fn on_removed(&self, key: IdentityKey);
}
