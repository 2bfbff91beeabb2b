use std::sync::Arc;

use tracing::info;

use container_concurrency::{AccessController, AccessRequest, InstancePool, PooledAccess};
use container_core::error::Result;
use container_core::types::ComponentKind;

use super::{serve, ComponentFactory, ComponentStats, Parts, StateCell};
use crate::dispatcher::{Body, Bound, InstanceBinding, InvocationDispatcher};
use crate::request::{CallFailure, CallRequest, CallResponse};

/// Factory of a stateless component.
///
/// Every call borrows an instance from the pool for its duration; no
/// locking beyond the pool is needed.
pub struct StatelessFactory<B: Send + 'static> {
    state: StateCell,
    pool: Arc<InstancePool<B>>,
    access: PooledAccess,
    dispatcher: InvocationDispatcher<B>,
}

impl<B: Send + 'static> StatelessFactory<B> {
    pub(crate) fn from_parts(parts: Parts<B>) -> Result<Self> {
        let name = parts.descriptor.name;
        let pool = InstancePool::new(name.as_str(), parts.lifecycle, parts.pool)?;
        Ok(Self {
            state: StateCell::new(&name),
            pool: Arc::new(pool),
            access: PooledAccess,
            dispatcher: parts.dispatcher,
        })
    }

    /// The instance pool.
    pub fn pool(&self) -> &Arc<InstancePool<B>> {
        &self.pool
    }
}

impl<B: Send + 'static> InstanceBinding<B> for StatelessFactory<B> {
    fn bind(&self, access: &AccessRequest, body: &mut Body<'_, B>) -> std::result::Result<Bound, CallFailure> {
        let permit = self.access.try_enter(access)?;
        let instance = self.pool.acquire(None)?;

        let (outcome, _) = serve(&self.pool, instance, None, body);
        drop(permit);

        Ok(Bound {
            outcome,
            identity: None,
            // A stateless caller holds no reference to the instance.
            removed: false,
        })
    }
}

impl<B: Send + 'static> ComponentFactory for StatelessFactory<B> {
    fn name(&self) -> &str {
        self.dispatcher.component()
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Stateless
    }

    fn start(&self) -> Result<()> {
        if self.state.start()? {
            let created = self.pool.pre_warm()?;
            info!(component = %self.name(), created, "Started stateless component");
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.state.stop() {
            self.pool.shutdown();
            info!(component = %self.name(), "Stopped stateless component");
        }
        Ok(())
    }

    fn local_call(&self, request: CallRequest) -> CallResponse {
        if let Err(failure) = self.state.ensure_started() {
            return CallResponse::failed(failure, None);
        }
        self.dispatcher.dispatch(self, request)
    }

    fn cleanup_idle(&self) -> usize {
        self.pool.cleanup_idle()
    }

    fn stats(&self) -> ComponentStats {
        ComponentStats {
            name: self.name().to_string(),
            kind: ComponentKind::Stateless,
            state: self.state.get(),
            invocations: self.dispatcher.invocations(),
            pool: Some(self.pool.stats()),
            locked_identities: None,
            instantiated: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ComponentBuilder;
    use crate::method::MethodDescriptor;
    use crate::request::FailureKind;
    use assert_matches::assert_matches;
    use container_concurrency::PoolConfig;
    use serde_json::json;

    fn counter(max: usize) -> StatelessFactory<u64> {
        ComponentBuilder::stateless("counter")
            .configure(|d| {
                d.pool = Some(PoolConfig {
                    min_instances: 1,
                    max_instances: max,
                    wait_timeout_ms: None,
                    ..PoolConfig::default()
                })
            })
            .constructor(|| Ok(0))
            .method(MethodDescriptor::exclusive("next()", 0, |calls: &mut u64, _| {
                *calls += 1;
                Ok(json!(*calls))
            }))
            .method(MethodDescriptor::exclusive("crash()", 0, |_: &mut u64, _| -> crate::method::MethodResult {
                panic!("crash")
            }))
            .build_stateless()
            .unwrap()
    }

    #[test]
    fn test_calls_before_start_fail() {
        let factory = counter(1);
        let response = factory.local_call(CallRequest::new("next()"));
        assert_matches!(response.failure(), Some(f) if f.kind == FailureKind::SystemFailure);
    }

    #[test]
    fn test_start_pre_warms_and_reuses() {
        let factory = counter(1);
        factory.start().unwrap();
        assert_eq!(factory.stats().pool.unwrap().created, 1);

        assert_eq!(factory.local_call(CallRequest::new("next()")).value(), Some(&json!(1)));
        assert_eq!(factory.local_call(CallRequest::new("next()")).value(), Some(&json!(2)));
        assert_eq!(factory.stats().invocations, 2);
    }

    #[test]
    fn test_panicking_instance_is_discarded() {
        let factory = counter(1);
        factory.start().unwrap();
        factory.local_call(CallRequest::new("next()"));

        let response = factory.local_call(CallRequest::new("crash()"));
        assert!(!response.is_success());
        assert!(!response.instance_removed);

        // The replacement starts from scratch.
        assert_eq!(factory.local_call(CallRequest::new("next()")).value(), Some(&json!(1)));
        assert_eq!(factory.stats().pool.unwrap().destroyed, 1);
    }

    #[test]
    fn test_stop_is_final() {
        let factory = counter(1);
        factory.start().unwrap();
        factory.stop().unwrap();
        factory.stop().unwrap();

        assert!(factory.start().is_err());
        let response = factory.local_call(CallRequest::new("next()"));
        assert_matches!(response.failure(), Some(f) if f.message.contains("stopped"));
    }
}
