use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use container_concurrency::{AccessController, AccessRequest, SingletonLock, SingletonPermit};
use container_core::error::{LifecycleError, Result};
use container_core::traits::InstanceLifecycle;
use container_core::types::{ComponentKind, ConcurrencyManagement};

use super::{ComponentFactory, ComponentStats, FactoryState, Parts, StateCell};
use crate::dispatcher::{Body, Bound, InstanceBinding, InvocationDispatcher};
use crate::method::BeanRef;
use crate::request::{CallFailure, CallRequest, CallResponse};

/// Factory of a singleton component.
///
/// The bean is created on first call, or at start when the descriptor asks
/// for eager startup, and lives until the component stops.
pub struct SingletonFactory<B: Send + Sync + 'static> {
    state: StateCell,
    startup: bool,
    management: ConcurrencyManagement,
    lifecycle: Arc<dyn InstanceLifecycle<B>>,
    instance: RwLock<Option<Arc<SingletonLock<B>>>>,
    dispatcher: InvocationDispatcher<B>,
}

impl<B: Send + Sync + 'static> SingletonFactory<B> {
    pub(crate) fn from_parts(parts: Parts<B>) -> Self {
        Self {
            state: StateCell::new(&parts.descriptor.name),
            startup: parts.descriptor.startup,
            management: parts.descriptor.concurrency,
            lifecycle: parts.lifecycle,
            instance: RwLock::new(None),
            dispatcher: parts.dispatcher,
        }
    }

    /// Whether the bean has been created.
    pub fn is_instantiated(&self) -> bool {
        self.instance.read().is_some()
    }

    /// The bean's lock, creating the bean if needed.
    fn instance(&self) -> std::result::Result<Arc<SingletonLock<B>>, LifecycleError> {
        if let Some(instance) = self.instance.read().as_ref() {
            return Ok(instance.clone());
        }

        let mut slot = self.instance.write();
        if let Some(instance) = slot.as_ref() {
            return Ok(instance.clone());
        }
        if self.state.get() == FactoryState::Stopped {
            return Err(LifecycleError::Stopped(self.name().to_string()));
        }

        let bean = self.lifecycle.create()?;
        let instance = Arc::new(SingletonLock::new(self.name(), self.management, bean));
        *slot = Some(instance.clone());
        debug!(component = %self.name(), "Created singleton instance");
        Ok(instance)
    }
}

impl<B: Send + Sync + 'static> InstanceBinding<B> for SingletonFactory<B> {
    fn bind(&self, access: &AccessRequest, body: &mut Body<'_, B>) -> std::result::Result<Bound, CallFailure> {
        let instance = self
            .instance()
            .map_err(|err| CallFailure::system(err.to_string()))?;
        let mut permit = instance.try_enter(access)?;

        let bean = match &mut permit {
            SingletonPermit::Write(guard, _) => BeanRef::Exclusive(&mut **guard),
            SingletonPermit::Read(guard, _) | SingletonPermit::Unmanaged(guard) => BeanRef::Shared(&**guard),
        };
        let outcome = body(bean, None);
        drop(permit);

        if outcome.remove || outcome.poisoned {
            debug!(
                component = %self.name(),
                poisoned = outcome.poisoned,
                "Keeping singleton instance after failed call"
            );
        }

        Ok(Bound {
            outcome: outcome.outcome,
            identity: None,
            removed: false,
        })
    }
}

impl<B: Send + Sync + 'static> ComponentFactory for SingletonFactory<B> {
    fn name(&self) -> &str {
        self.dispatcher.component()
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Singleton
    }

    fn start(&self) -> Result<()> {
        if self.state.start()? {
            if self.startup {
                self.instance()?;
            }
            info!(component = %self.name(), eager = self.startup, "Started singleton component");
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.state.stop() {
            return Ok(());
        }

        let instance = self.instance.write().take();
        if let Some(instance) = instance {
            match Arc::try_unwrap(instance) {
                Ok(lock) => self.lifecycle.destroy(lock.into_bean()),
                Err(_) => warn!(component = %self.name(), "Singleton still in use at stop; not destroyed"),
            }
        }
        info!(component = %self.name(), "Stopped singleton component");
        Ok(())
    }

    fn local_call(&self, request: CallRequest) -> CallResponse {
        if let Err(failure) = self.state.ensure_started() {
            return CallResponse::failed(failure, None);
        }
        self.dispatcher.dispatch(self, request)
    }

    fn stats(&self) -> ComponentStats {
        ComponentStats {
            name: self.name().to_string(),
            kind: ComponentKind::Singleton,
            state: self.state.get(),
            invocations: self.dispatcher.invocations(),
            pool: None,
            locked_identities: None,
            instantiated: Some(self.is_instantiated()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ComponentBuilder;
    use crate::method::MethodDescriptor;
    use crate::request::FailureKind;
    use container_core::types::{AccessTimeout, LockType};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    type Slot = Arc<parking_lot::Mutex<Option<Arc<dyn ComponentFactory>>>>;

    /// Call `get()` on the factory in `slot` from inside another method.
    fn call_back(slot: &Slot) -> Value {
        let Some(target) = slot.lock().clone() else {
            return Value::Null;
        };
        let response = target.local_call(CallRequest::new("get()"));
        json!({
            "value": response.value().cloned(),
            "failure": response.failure().map(|f| f.kind.as_str()),
            "message": response.failure().map(|f| f.message.clone()),
        })
    }

    fn registry(startup: bool, created: Arc<AtomicUsize>) -> SingletonFactory<Vec<String>> {
        ComponentBuilder::singleton("registry")
            .configure(|d| d.startup = startup)
            .constructor(move || {
                created.fetch_add(1, Ordering::SeqCst);
                Ok(vec!["seed".to_string()])
            })
            .method(
                MethodDescriptor::shared("list()", 0, |names: &Vec<String>, _| Ok(json!(names)))
                    .lock(LockType::Read),
            )
            .method(MethodDescriptor::exclusive("add(String)", 1, |names: &mut Vec<String>, inv| {
                names.push(inv.arg(0)?);
                Ok(json!(names.len()))
            }))
            .method(MethodDescriptor::shared("crash()", 0, |_: &Vec<String>, _| -> crate::method::MethodResult {
                panic!("crash")
            }))
            .build_singleton()
            .unwrap()
    }

    #[test]
    fn test_lazy_creation() {
        let created = Arc::new(AtomicUsize::new(0));
        let factory = registry(false, created.clone());
        factory.start().unwrap();
        assert!(!factory.is_instantiated());

        factory.local_call(CallRequest::new("list()"));
        factory.local_call(CallRequest::new("list()"));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(factory.stats().instantiated, Some(true));
    }

    #[test]
    fn test_eager_creation() {
        let created = Arc::new(AtomicUsize::new(0));
        let factory = registry(true, created.clone());
        factory.start().unwrap();
        assert!(factory.is_instantiated());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_state_survives_panics() {
        let factory = registry(false, Arc::new(AtomicUsize::new(0)));
        factory.start().unwrap();

        factory.local_call(CallRequest::new("add(String)").arg("one"));
        let crashed = factory.local_call(CallRequest::new("crash()"));
        assert!(!crashed.is_success());
        assert!(!crashed.instance_removed);

        let listed = factory.local_call(CallRequest::new("list()"));
        assert_eq!(listed.value(), Some(&json!(["seed", "one"])));
    }

    #[test]
    fn test_nested_calls_on_the_same_thread() {
        let slot: Slot = Arc::new(parking_lot::Mutex::new(None));
        let from_read = slot.clone();
        let from_write = slot.clone();
        let factory: Arc<dyn ComponentFactory> = Arc::new(
            ComponentBuilder::singleton("settings")
                .configure(|d| d.access_timeout = Some(AccessTimeout::millis(200)))
                .constructor(|| Ok(1u32))
                .method(MethodDescriptor::shared("get()", 0, |v: &u32, _| Ok(json!(*v))).lock(LockType::Read))
                .method(
                    MethodDescriptor::shared("describe()", 0, move |_: &u32, _| Ok(call_back(&from_read)))
                        .lock(LockType::Read),
                )
                .method(MethodDescriptor::exclusive("bump()", 0, move |v: &mut u32, _| {
                    *v += 1;
                    Ok(call_back(&from_write))
                }))
                .build_singleton()
                .unwrap(),
        );
        *slot.lock() = Some(factory.clone());
        factory.start().unwrap();

        let described = factory.local_call(CallRequest::new("describe()"));
        assert_eq!(described.value().map(|v| v["value"].clone()), Some(json!(1)));

        let started = Instant::now();
        let bumped = factory.local_call(CallRequest::new("bump()"));
        assert!(started.elapsed() < Duration::from_millis(200));
        let nested = bumped.value().cloned().unwrap();
        assert_eq!(nested["failure"], json!(FailureKind::SystemFailure.as_str()));
        assert!(nested["message"].as_str().unwrap().contains("loopback"));

        // The outer write still committed.
        assert_eq!(factory.local_call(CallRequest::new("get()")).value(), Some(&json!(2)));
        *slot.lock() = None;
    }

    #[test]
    fn test_stop_destroys_instance() {
        let factory = registry(true, Arc::new(AtomicUsize::new(0)));
        factory.start().unwrap();
        factory.stop().unwrap();
        assert!(!factory.is_instantiated());
        assert!(!factory.local_call(CallRequest::new("list()")).is_success());
    }
}
