use std::sync::Arc;

use tracing::{debug, info};

use container_concurrency::{AccessController, AccessRequest, IdentityLocks, InstancePool};
use container_core::error::{PoolError, Result};
use container_core::types::{AccessTimeout, ComponentKind, IdentityKey};

use super::{serve, ComponentFactory, ComponentStats, Parts, StateCell};
use crate::dispatcher::{Body, Bound, InstanceBinding, InvocationDispatcher};
use crate::request::{CallFailure, CallRequest, CallResponse};

/// Factory of a stateful component.
///
/// Each session owns one instance, reached through its identity key, and
/// calls on one key are serialized by that key's lock.
pub struct StatefulFactory<B: Send + 'static> {
    state: StateCell,
    pool: Arc<InstancePool<B>>,
    locks: Arc<IdentityLocks>,
    dispatcher: InvocationDispatcher<B>,
}

impl<B: Send + 'static> StatefulFactory<B> {
    pub(crate) fn from_parts(parts: Parts<B>) -> Result<Self> {
        let name = parts.descriptor.name;
        let pool = InstancePool::keyed(name.as_str(), parts.lifecycle, parts.pool)?;
        let locks = Arc::new(IdentityLocks::new(name.as_str()));
        pool.add_removal_listener(locks.clone());

        Ok(Self {
            state: StateCell::new(&name),
            pool: Arc::new(pool),
            locks,
            dispatcher: parts.dispatcher,
        })
    }

    /// The session pool.
    pub fn pool(&self) -> &Arc<InstancePool<B>> {
        &self.pool
    }

    /// The per-identity lock table.
    pub fn locks(&self) -> &Arc<IdentityLocks> {
        &self.locks
    }

    /// End the session of `key` without a business call.
    ///
    /// Returns `false` if the session is already gone or a call is using
    /// it.
    pub fn discard(&self, key: IdentityKey) -> bool {
        self.pool.discard(key)
    }

    /// Serve a call on an existing session, holding its lock throughout.
    fn bind_session(
        &self,
        key: IdentityKey,
        access: &AccessRequest,
        body: &mut Body<'_, B>,
    ) -> std::result::Result<Bound, CallFailure> {
        let permit = self.locks.try_enter(access)?;
        let instance = match self.pool.acquire(Some(key)) {
            Ok(instance) => instance,
            Err(err) => {
                drop(permit);
                if matches!(err, PoolError::InstanceAlreadyRemoved(_) | PoolError::UnknownIdentity(_)) {
                    self.locks.forget(key);
                }
                return Err(err.into());
            }
        };

        let (outcome, removed) = serve(&self.pool, instance, Some(key), body);
        permit.release();

        Ok(Bound {
            outcome,
            identity: Some(key),
            removed,
        })
    }

    /// Create a session and serve its first call.
    fn bind_new(&self, access: &AccessRequest, body: &mut Body<'_, B>) -> std::result::Result<Bound, CallFailure> {
        let instance = self.pool.acquire(None)?;
        let Some(key) = instance.key() else {
            self.pool.remove(instance);
            return Err(CallFailure::system("keyed pool issued an instance without identity"));
        };

        // Nobody else knows the key yet, so this never waits.
        let locked = AccessRequest::new(Some(key), access.lock_type, AccessTimeout::NO_WAIT);
        let permit = match self.locks.try_enter(&locked) {
            Ok(permit) => permit,
            Err(err) => {
                self.pool.release(instance);
                return Err(err.into());
            }
        };
        debug!(component = %self.pool.name(), key = %key, "Opened session");

        let (outcome, removed) = serve(&self.pool, instance, Some(key), body);
        permit.release();

        Ok(Bound {
            outcome,
            identity: Some(key),
            removed,
        })
    }
}

impl<B: Send + 'static> InstanceBinding<B> for StatefulFactory<B> {
    fn bind(&self, access: &AccessRequest, body: &mut Body<'_, B>) -> std::result::Result<Bound, CallFailure> {
        match access.identity {
            Some(key) => self.bind_session(key, access, body),
            None => self.bind_new(access, body),
        }
    }
}

impl<B: Send + 'static> ComponentFactory for StatefulFactory<B> {
    fn name(&self) -> &str {
        self.dispatcher.component()
    }

    fn kind(&self) -> ComponentKind {
        ComponentKind::Stateful
    }

    fn start(&self) -> Result<()> {
        if self.state.start()? {
            info!(component = %self.name(), "Started stateful component");
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.state.stop() {
            self.pool.shutdown();
            info!(component = %self.name(), "Stopped stateful component");
        }
        Ok(())
    }

    fn local_call(&self, request: CallRequest) -> CallResponse {
        if let Err(failure) = self.state.ensure_started() {
            return CallResponse::failed(failure, request.identity);
        }
        self.dispatcher.dispatch(self, request)
    }

    /// Expire sessions idle past the pool's idle timeout.
    fn cleanup_idle(&self) -> usize {
        self.pool.cleanup_idle()
    }

    fn stats(&self) -> ComponentStats {
        ComponentStats {
            name: self.name().to_string(),
            kind: ComponentKind::Stateful,
            state: self.state.get(),
            invocations: self.dispatcher.invocations(),
            pool: Some(self.pool.stats()),
            locked_identities: Some(self.locks.len()),
            instantiated: None,
        }
    }
}
