//! Component factories.
//!
//! A factory puts together the pool, the access controller and the
//! dispatcher of one component according to its concurrency model, and is
//! the entry point for calls into it.

mod singleton;
mod stateful;
mod stateless;

pub use singleton::SingletonFactory;
pub use stateful::StatefulFactory;
pub use stateless::StatelessFactory;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use container_concurrency::{ComponentInstance, InstancePool, PoolConfig, PoolStats};
use container_core::error::{ConfigError, LifecycleError, Result};
use container_core::traits::{
    ApplicationExceptionRegistry, ClassLoaderProvider, EventDispatcher, FnLifecycle,
    InstanceLifecycle,
};
use container_core::types::{
    AccessTimeout, ClassLoaderHandle, ComponentKind, IdentityKey, OperationState,
};

use crate::config::{ComponentDescriptor, ContainerConfig};
use crate::context::{ContextScope, InvocationContext};
use crate::dispatcher::{Body, DispatcherSettings, InvocationDispatcher};
use crate::events::NoopEventDispatcher;
use crate::exceptions::DeclaredApplicationExceptions;
use crate::method::{BeanRef, MethodDescriptor, MethodTableBuilder};
use crate::request::{CallFailure, CallOutcome, CallRequest, CallResponse};

/// A deployed component, regardless of its bean type.
pub trait ComponentFactory: Send + Sync {
    /// Component name.
    fn name(&self) -> &str;

    /// Concurrency model.
    fn kind(&self) -> ComponentKind;

    /// Make the component callable.
    fn start(&self) -> Result<()>;

    /// Stop serving calls and destroy idle instances.
    fn stop(&self) -> Result<()>;

    /// Serve one call.
    fn local_call(&self, request: CallRequest) -> CallResponse;

    /// Current counters.
    fn stats(&self) -> ComponentStats;

    /// Destroy instances idle past the pool's idle timeout. Returns how
    /// many were destroyed.
    fn cleanup_idle(&self) -> usize {
        0
    }
}

/// Lifecycle state of a factory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactoryState {
    #[default]
    Created,
    Started,
    Stopped,
}

/// Counters of one component.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStats {
    pub name: String,
    pub kind: ComponentKind,
    pub state: FactoryState,

    /// Business method invocations so far.
    pub invocations: u64,

    /// Pool counters, for pooled components.
    pub pool: Option<PoolStats>,

    /// Identities with a lock entry, for stateful components.
    pub locked_identities: Option<usize>,

    /// Whether the singleton instance exists.
    pub instantiated: Option<bool>,
}

/// State shared by the three factory kinds.
pub(crate) struct StateCell {
    name: String,
    state: Mutex<FactoryState>,
}

impl StateCell {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(FactoryState::Created),
        }
    }

    /// Move to `Started`. Returns `false` if already started.
    fn start(&self) -> Result<bool> {
        let mut state = self.state.lock();
        match *state {
            FactoryState::Created => {
                *state = FactoryState::Started;
                Ok(true)
            }
            FactoryState::Started => Ok(false),
            FactoryState::Stopped => Err(LifecycleError::Stopped(self.name.clone()).into()),
        }
    }

    /// Move to `Stopped`. Returns `false` if already stopped.
    fn stop(&self) -> bool {
        let mut state = self.state.lock();
        let was_stopped = *state == FactoryState::Stopped;
        *state = FactoryState::Stopped;
        !was_stopped
    }

    fn get(&self) -> FactoryState {
        *self.state.lock()
    }

    fn ensure_started(&self) -> std::result::Result<(), CallFailure> {
        match self.get() {
            FactoryState::Started => Ok(()),
            FactoryState::Created => Err(CallFailure::system(
                LifecycleError::NotStarted(self.name.clone()).to_string(),
            )),
            FactoryState::Stopped => Err(CallFailure::system(
                LifecycleError::Stopped(self.name.clone()).to_string(),
            )),
        }
    }
}

/// Runs construction and destruction inside the component's lifecycle
/// context.
pub(crate) struct ScopedLifecycle<B> {
    inner: Arc<dyn InstanceLifecycle<B>>,
    class_loader: Arc<dyn ClassLoaderProvider>,
}

impl<B> InstanceLifecycle<B> for ScopedLifecycle<B> {
    fn create(&self) -> std::result::Result<B, LifecycleError> {
        let _scope = ContextScope::enter(InvocationContext::lifecycle(
            self.class_loader.class_loader(),
            OperationState::PostConstruct,
        ));
        self.inner.create()
    }

    fn destroy(&self, bean: B) {
        let _scope = ContextScope::enter(InvocationContext::lifecycle(
            self.class_loader.class_loader(),
            OperationState::PreDestroy,
        ));
        self.inner.destroy(bean)
    }
}

/// Run `body` on a checked-out pool instance, then release it, or remove
/// it when the call asks for removal or left the bean poisoned.
///
/// If `body` unwinds the instance is removed before the panic resumes, so
/// its pool slot and identity key are never stranded.
pub(crate) fn serve<B: Send + 'static>(
    pool: &InstancePool<B>,
    mut instance: ComponentInstance<B>,
    identity: Option<IdentityKey>,
    body: &mut Body<'_, B>,
) -> (CallOutcome, bool) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        body(BeanRef::Exclusive(instance.bean_mut()), identity)
    }));
    match result {
        Ok(outcome) => {
            let removed = outcome.remove || outcome.poisoned;
            if removed {
                debug!(component = %pool.name(), instance = %instance.id(), "Discarding instance after call");
                pool.remove(instance);
            } else {
                pool.release(instance);
            }
            (outcome.outcome, removed)
        }
        Err(payload) => {
            warn!(component = %pool.name(), instance = %instance.id(), "Call unwound; removing instance");
            pool.remove(instance);
            panic::resume_unwind(payload)
        }
    }
}

/// Parts of a component shared by every factory kind.
pub(crate) struct Parts<B> {
    pub descriptor: ComponentDescriptor,
    pub pool: PoolConfig,
    pub lifecycle: Arc<dyn InstanceLifecycle<B>>,
    pub dispatcher: InvocationDispatcher<B>,
}

/// Assembles a component from its descriptor, lifecycle, methods and
/// collaborators.
pub struct ComponentBuilder<B> {
    descriptor: ComponentDescriptor,
    lifecycle: Option<Arc<dyn InstanceLifecycle<B>>>,
    methods: Vec<MethodDescriptor<B>>,
    default_pool: PoolConfig,
    default_timeout: AccessTimeout,
    events: Arc<dyn EventDispatcher>,
    class_loader: Option<Arc<dyn ClassLoaderProvider>>,
    exceptions: Option<Arc<dyn ApplicationExceptionRegistry>>,
    invocation_ids: bool,
    emit_events: bool,
}

impl<B: Send + 'static> ComponentBuilder<B> {
    /// Start from a descriptor.
    pub fn new(descriptor: ComponentDescriptor) -> Self {
        Self {
            descriptor,
            lifecycle: None,
            methods: Vec::new(),
            default_pool: PoolConfig::default(),
            default_timeout: AccessTimeout::default(),
            events: Arc::new(NoopEventDispatcher),
            class_loader: None,
            exceptions: None,
            invocation_ids: true,
            emit_events: true,
        }
    }

    /// A stateless component with default settings.
    pub fn stateless(name: impl Into<String>) -> Self {
        Self::new(ComponentDescriptor::new(name, ComponentKind::Stateless))
    }

    /// A stateful component with default settings.
    pub fn stateful(name: impl Into<String>) -> Self {
        Self::new(ComponentDescriptor::new(name, ComponentKind::Stateful))
    }

    /// A singleton component with default settings.
    pub fn singleton(name: impl Into<String>) -> Self {
        Self::new(ComponentDescriptor::new(name, ComponentKind::Singleton))
    }

    /// Take container-wide defaults.
    pub fn with_config(mut self, config: &ContainerConfig) -> Self {
        self.default_pool = config.default_pool.clone();
        self.default_timeout = config.default_access_timeout;
        self.invocation_ids = config.invocation_ids;
        self.emit_events = config.emit_events;
        self
    }

    /// Mutate the descriptor in place.
    pub fn configure(mut self, f: impl FnOnce(&mut ComponentDescriptor)) -> Self {
        f(&mut self.descriptor);
        self
    }

    /// Set the instance lifecycle.
    pub fn lifecycle(mut self, lifecycle: Arc<dyn InstanceLifecycle<B>>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Build instances with `create`.
    pub fn constructor<F>(self, create: F) -> Self
    where
        F: Fn() -> std::result::Result<B, LifecycleError> + Send + Sync + 'static,
    {
        self.lifecycle(Arc::new(FnLifecycle::new(create)))
    }

    /// Add a business method.
    pub fn method(mut self, method: MethodDescriptor<B>) -> Self {
        self.methods.push(method);
        self
    }

    /// Send events to `events`.
    pub fn events(mut self, events: Arc<dyn EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    /// Install `class_loader` while component code runs.
    pub fn class_loader(mut self, class_loader: Arc<dyn ClassLoaderProvider>) -> Self {
        self.class_loader = Some(class_loader);
        self
    }

    /// Replace the exception registry derived from the descriptor.
    pub fn application_exceptions(mut self, registry: Arc<dyn ApplicationExceptionRegistry>) -> Self {
        self.exceptions = Some(registry);
        self
    }

    fn into_parts(self) -> Result<Parts<B>> {
        let descriptor = self.descriptor;
        descriptor.validate()?;
        let Some(lifecycle) = self.lifecycle else {
            return Err(ConfigError::MissingLifecycle(descriptor.name).into());
        };

        let mut table = MethodTableBuilder::new(descriptor.kind, descriptor.concurrency);
        for method in self.methods {
            table.push(method);
        }
        let methods = table.build()?;

        let class_loader = self
            .class_loader
            .unwrap_or_else(|| Arc::new(ClassLoaderHandle::new(descriptor.name.as_str())));
        let exceptions = self.exceptions.unwrap_or_else(|| {
            Arc::new(
                DeclaredApplicationExceptions::new(descriptor.application_exceptions.iter().cloned())
                    .inherited(descriptor.inherited_exceptions),
            )
        });

        let dispatcher = InvocationDispatcher::new(
            descriptor.name.clone(),
            methods,
            DispatcherSettings {
                class_loader: class_loader.clone(),
                events: self.events,
                exceptions,
                default_timeout: descriptor.access_timeout.unwrap_or(self.default_timeout),
                invocation_ids: self.invocation_ids,
                emit_events: self.emit_events,
            },
        );

        Ok(Parts {
            pool: descriptor.pool.clone().unwrap_or(self.default_pool),
            lifecycle: Arc::new(ScopedLifecycle {
                inner: lifecycle,
                class_loader,
            }),
            dispatcher,
            descriptor,
        })
    }

    fn expect_kind(&self, kind: ComponentKind) -> Result<()> {
        if self.descriptor.kind != kind {
            return Err(ConfigError::KindMismatch {
                name: self.descriptor.name.clone(),
                expected: kind,
                actual: self.descriptor.kind,
            }
            .into());
        }
        Ok(())
    }

    /// Build a stateless factory.
    pub fn build_stateless(self) -> Result<StatelessFactory<B>> {
        self.expect_kind(ComponentKind::Stateless)?;
        StatelessFactory::from_parts(self.into_parts()?)
    }

    /// Build a stateful factory.
    pub fn build_stateful(self) -> Result<StatefulFactory<B>> {
        self.expect_kind(ComponentKind::Stateful)?;
        StatefulFactory::from_parts(self.into_parts()?)
    }
}

impl<B: Send + Sync + 'static> ComponentBuilder<B> {
    /// Build a singleton factory.
    pub fn build_singleton(self) -> Result<SingletonFactory<B>> {
        self.expect_kind(ComponentKind::Singleton)?;
        Ok(SingletonFactory::from_parts(self.into_parts()?))
    }

    /// Build the factory matching the descriptor's kind.
    pub fn build(self) -> Result<Arc<dyn ComponentFactory>> {
        let factory: Arc<dyn ComponentFactory> = match self.descriptor.kind {
            ComponentKind::Stateless => Arc::new(self.build_stateless()?),
            ComponentKind::Stateful => Arc::new(self.build_stateful()?),
            ComponentKind::Singleton => Arc::new(self.build_singleton()?),
        };
        info!(component = factory.name(), kind = %factory.kind(), "Built component");
        Ok(factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use container_core::error::Error;

    #[test]
    fn test_missing_lifecycle_is_reported() {
        assert_matches!(
            ComponentBuilder::<u8>::stateless("bare").build_stateless().err(),
            Some(Error::Config(ConfigError::MissingLifecycle(name))) if name == "bare"
        );
    }

    #[test]
    fn test_kind_mismatch_is_reported() {
        let result = ComponentBuilder::<u8>::stateful("cart")
            .constructor(|| Ok(0))
            .build_stateless();
        assert_matches!(
            result.err(),
            Some(Error::Config(ConfigError::KindMismatch {
                expected: ComponentKind::Stateless,
                actual: ComponentKind::Stateful,
                ..
            }))
        );
    }
}
