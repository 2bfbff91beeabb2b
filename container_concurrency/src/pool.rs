//! Instance pooling for session components.
//!
//! This module provides a thread-safe instance pool. The unkeyed variant
//! serves stateless components: any idle instance serves any call. The
//! keyed variant serves stateful components: every instance is bound to an
//! identity key handed out at creation, and a key is never reused once its
//! instance is removed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use container_core::error::{ConfigError, PoolError};
use container_core::traits::{InstanceLifecycle, RemovalListener};
use container_core::types::{IdentityKey, InstanceId};

/// Configuration for an instance pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Minimum number of instances to keep ready.
    pub min_instances: usize,

    /// Maximum number of live instances.
    pub max_instances: usize,

    /// Idle instances kept on release; surplus ones are destroyed.
    pub spare_instances: Option<usize>,

    /// How long `acquire` waits at capacity. `None` fails immediately.
    pub wait_timeout_ms: Option<u64>,

    /// How long an idle instance may live before `cleanup_idle` evicts it.
    pub idle_timeout_sec: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 0,
            max_instances: 10,
            spare_instances: None,
            wait_timeout_ms: Some(100),
            idle_timeout_sec: Some(60),
        }
    }
}

impl PoolConfig {
    /// Check the bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_instances > self.max_instances {
            return Err(ConfigError::InvalidPoolBounds {
                min: self.min_instances,
                max: self.max_instances,
            });
        }
        Ok(())
    }

    /// Capacity wait as a duration.
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    /// Idle eviction threshold as a duration.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_sec.map(Duration::from_secs)
    }
}

/// A component instance checked out of, or idle in, a pool.
///
/// The instance is not `Clone`: whoever holds it has exclusive use of the
/// bean until it is handed back through `release` or `remove`.
pub struct ComponentInstance<B> {
    id: InstanceId,
    key: Option<IdentityKey>,
    bean: B,
    created_at: Instant,
    last_used: Instant,
}

impl<B> ComponentInstance<B> {
    fn new(id: InstanceId, key: Option<IdentityKey>, bean: B) -> Self {
        let now = Instant::now();
        Self {
            id,
            key,
            bean,
            created_at: now,
            last_used: now,
        }
    }

    /// Diagnostic id.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Identity key, for keyed pools.
    pub fn key(&self) -> Option<IdentityKey> {
        self.key
    }

    /// Shared access to the bean.
    pub fn bean(&self) -> &B {
        &self.bean
    }

    /// Exclusive access to the bean.
    pub fn bean_mut(&mut self) -> &mut B {
        &mut self.bean
    }

    /// Get the age of this instance.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Get the idle time of this instance.
    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

impl<B> std::fmt::Debug for ComponentInstance<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentInstance")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Point-in-time counters of a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Live instances, including ones being constructed.
    pub total: usize,

    /// Instances waiting in the pool.
    pub idle: usize,

    /// Instances checked out by calls.
    pub busy: usize,

    /// Instances ever created.
    pub created: u64,

    /// Instances ever destroyed.
    pub destroyed: u64,
}

struct PoolState<B> {
    /// Idle unkeyed instances, oldest first.
    idle: VecDeque<ComponentInstance<B>>,

    /// Idle keyed instances.
    sessions: HashMap<IdentityKey, ComponentInstance<B>>,

    /// Keys whose instance is checked out.
    busy: HashSet<IdentityKey>,

    /// Live instances plus reserved construction slots.
    total: usize,

    /// Next identity key; every key below it has been issued.
    next_key: u64,

    created: u64,
    destroyed: u64,
}

impl<B> PoolState<B> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            sessions: HashMap::new(),
            busy: HashSet::new(),
            total: 0,
            next_key: 1,
            created: 0,
            destroyed: 0,
        }
    }

    fn issue_key(&mut self) -> IdentityKey {
        let key = IdentityKey(self.next_key);
        self.next_key += 1;
        key
    }

    fn was_issued(&self, key: IdentityKey) -> bool {
        key.0 != 0 && key.0 < self.next_key
    }

    fn retire(&mut self, count: usize) {
        self.total -= count;
        self.destroyed += count as u64;
    }
}

/// A pool of component instances.
pub struct InstancePool<B> {
    /// Component name, used in errors and logs.
    name: String,

    /// Whether instances are bound to identity keys.
    keyed: bool,

    /// Builds and tears down beans.
    lifecycle: Arc<dyn InstanceLifecycle<B>>,

    /// The pool configuration.
    config: Mutex<PoolConfig>,

    /// Instance table.
    state: Mutex<PoolState<B>>,

    /// Signalled whenever capacity or an idle instance frees up.
    available: Condvar,

    /// Next instance ID.
    next_id: AtomicU64,

    /// Whether the pool is shutting down.
    shutting_down: AtomicBool,

    /// Notified when a keyed instance is removed.
    listeners: RwLock<Vec<Arc<dyn RemovalListener>>>,
}

impl<B> std::fmt::Debug for InstancePool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("name", &self.name)
            .field("keyed", &self.keyed)
            .finish_non_exhaustive()
    }
}

impl<B: Send + 'static> InstancePool<B> {
    /// Create an unkeyed pool.
    pub fn new(
        name: impl Into<String>,
        lifecycle: Arc<dyn InstanceLifecycle<B>>,
        config: PoolConfig,
    ) -> Result<Self, ConfigError> {
        Self::build(name.into(), false, lifecycle, config)
    }

    /// Create a keyed pool for stateful components.
    pub fn keyed(
        name: impl Into<String>,
        lifecycle: Arc<dyn InstanceLifecycle<B>>,
        config: PoolConfig,
    ) -> Result<Self, ConfigError> {
        Self::build(name.into(), true, lifecycle, config)
    }

    fn build(
        name: String,
        keyed: bool,
        lifecycle: Arc<dyn InstanceLifecycle<B>>,
        config: PoolConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name,
            keyed,
            lifecycle,
            config: Mutex::new(config),
            state: Mutex::new(PoolState::new()),
            available: Condvar::new(),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// The component this pool serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether instances are bound to identity keys.
    pub fn is_keyed(&self) -> bool {
        self.keyed
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> PoolConfig {
        self.config.lock().clone()
    }

    /// Update the pool configuration.
    pub fn update_config(&self, config: PoolConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.config.lock() = config;
        self.available.notify_all();
        Ok(())
    }

    /// Register a listener for removed keys.
    pub fn add_removal_listener(&self, listener: Arc<dyn RemovalListener>) {
        self.listeners.write().push(listener);
    }

    /// Pre-warm the pool by creating minimum instances.
    pub fn pre_warm(&self) -> Result<usize, PoolError> {
        if self.keyed {
            return Ok(0);
        }

        let min_instances = self.config.lock().min_instances;
        let mut created = 0;
        loop {
            {
                let mut state = self.state.lock();
                if state.total >= min_instances {
                    break;
                }
                state.total += 1;
            }
            let instance = self.construct(None)?;
            self.state.lock().idle.push_back(instance);
            self.available.notify_one();
            created += 1;
        }

        if created > 0 {
            debug!(pool = %self.name, created, "Pre-warmed pool");
        }
        Ok(created)
    }

    /// Acquire an instance from the pool.
    ///
    /// On a keyed pool, `Some(key)` returns the instance bound to `key` and
    /// `None` creates a fresh instance under a newly issued key. On an
    /// unkeyed pool the key is ignored.
    pub fn acquire(&self, key: Option<IdentityKey>) -> Result<ComponentInstance<B>, PoolError> {
        self.ensure_running()?;
        match key {
            Some(key) if self.keyed => self.checkout_session(key),
            _ => self.checkout(),
        }
    }

    fn ensure_running(&self) -> Result<(), PoolError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown(self.name.clone()));
        }
        Ok(())
    }

    fn checkout_session(&self, key: IdentityKey) -> Result<ComponentInstance<B>, PoolError> {
        let mut state = self.state.lock();
        if let Some(mut instance) = state.sessions.remove(&key) {
            state.busy.insert(key);
            instance.touch();
            return Ok(instance);
        }

        if state.busy.contains(&key) {
            Err(PoolError::InstanceInUse(key))
        } else if state.was_issued(key) {
            Err(PoolError::InstanceAlreadyRemoved(key))
        } else {
            Err(PoolError::UnknownIdentity(key))
        }
    }

    fn checkout(&self) -> Result<ComponentInstance<B>, PoolError> {
        let config = self.config();
        let deadline = config.wait_timeout().map(|timeout| Instant::now() + timeout);

        let mut state = self.state.lock();
        loop {
            self.ensure_running()?;

            if !self.keyed {
                if let Some(mut instance) = state.idle.pop_front() {
                    instance.touch();
                    return Ok(instance);
                }
            }

            if state.total < config.max_instances {
                state.total += 1;
                let key = self.keyed.then(|| state.issue_key());
                if let Some(key) = key {
                    state.busy.insert(key);
                }
                drop(state);
                return self.construct(key);
            }

            let Some(deadline) = deadline else {
                warn!(pool = %self.name, max = config.max_instances, "Pool exhausted");
                return Err(PoolError::Exhausted(self.name.clone()));
            };
            if Instant::now() >= deadline {
                warn!(
                    pool = %self.name,
                    max = config.max_instances,
                    "Pool exhausted after waiting"
                );
                return Err(PoolError::Exhausted(self.name.clone()));
            }
            self.available.wait_until(&mut state, deadline);
        }
    }

    /// Build a bean for a slot already reserved in `total`.
    fn construct(&self, key: Option<IdentityKey>) -> Result<ComponentInstance<B>, PoolError> {
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        match self.lifecycle.create() {
            Ok(bean) => {
                let total = {
                    let mut state = self.state.lock();
                    state.created += 1;
                    state.total
                };
                debug!(pool = %self.name, instance = %id, total, "Created instance");
                Ok(ComponentInstance::new(id, key, bean))
            }
            Err(err) => {
                {
                    let mut state = self.state.lock();
                    state.total -= 1;
                    if let Some(key) = key {
                        state.busy.remove(&key);
                    }
                }
                self.available.notify_one();
                warn!(pool = %self.name, error = %err, "Instance creation failed");
                Err(PoolError::InstanceCreationFailed(err.to_string()))
            }
        }
    }

    /// Return an instance to the pool.
    pub fn release(&self, mut instance: ComponentInstance<B>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            self.remove(instance);
            return;
        }

        let spare = self.config.lock().spare_instances;
        let mut state = self.state.lock();
        match instance.key() {
            Some(key) => {
                state.busy.remove(&key);
                instance.touch();
                state.sessions.insert(key, instance);
            }
            None => {
                if spare.is_some_and(|spare| state.idle.len() >= spare) {
                    state.retire(1);
                    drop(state);
                    self.available.notify_one();
                    debug!(pool = %self.name, instance = %instance.id, "Destroyed surplus instance");
                    self.lifecycle.destroy(instance.bean);
                    return;
                }
                instance.touch();
                state.idle.push_back(instance);
            }
        }
        drop(state);
        self.available.notify_one();
    }

    /// Destroy a checked-out instance and retire its key.
    pub fn remove(&self, instance: ComponentInstance<B>) {
        let key = instance.key;
        {
            let mut state = self.state.lock();
            if let Some(key) = key {
                state.busy.remove(&key);
            }
            state.retire(1);
        }
        self.available.notify_one();

        debug!(pool = %self.name, instance = %instance.id, key = ?key, "Removed instance");
        self.lifecycle.destroy(instance.bean);
        if let Some(key) = key {
            self.notify_removed(key);
        }
    }

    /// Remove the idle instance bound to `key`.
    ///
    /// Returns `false` if there is no idle instance for the key, either
    /// because it was already removed or because a call holds it.
    pub fn discard(&self, key: IdentityKey) -> bool {
        let instance = {
            let mut state = self.state.lock();
            let instance = state.sessions.remove(&key);
            if instance.is_some() {
                state.retire(1);
            }
            instance
        };

        match instance {
            Some(instance) => {
                self.available.notify_one();
                debug!(pool = %self.name, key = %key, "Discarded instance");
                self.lifecycle.destroy(instance.bean);
                self.notify_removed(key);
                true
            }
            None => false,
        }
    }

    /// Clean up idle instances.
    pub fn cleanup_idle(&self) -> usize {
        let config = self.config();
        let Some(idle_timeout) = config.idle_timeout() else {
            return 0;
        };

        let (evicted, expired) = {
            let mut state = self.state.lock();

            let removable = state.total.saturating_sub(config.min_instances);
            let mut evicted = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            for instance in std::mem::take(&mut state.idle) {
                if evicted.len() < removable && instance.idle_time() > idle_timeout {
                    evicted.push(instance);
                } else {
                    kept.push_back(instance);
                }
            }
            state.idle = kept;

            let expired_keys: Vec<IdentityKey> = state
                .sessions
                .iter()
                .filter(|(_, instance)| instance.idle_time() > idle_timeout)
                .map(|(key, _)| *key)
                .collect();
            let expired: Vec<ComponentInstance<B>> = expired_keys
                .iter()
                .filter_map(|key| state.sessions.remove(key))
                .collect();

            state.retire(evicted.len() + expired.len());
            (evicted, expired)
        };

        let count = evicted.len() + expired.len();
        if count == 0 {
            return 0;
        }
        self.available.notify_all();
        debug!(pool = %self.name, count, "Evicted idle instances");

        for instance in evicted {
            self.lifecycle.destroy(instance.bean);
        }
        for instance in expired {
            let key = instance.key;
            self.lifecycle.destroy(instance.bean);
            if let Some(key) = key {
                self.notify_removed(key);
            }
        }
        count
    }

    /// Shut down the pool.
    ///
    /// Idle instances are destroyed now; checked-out ones are destroyed
    /// when they come back.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let (idle, sessions) = {
            let mut state = self.state.lock();
            let idle = std::mem::take(&mut state.idle);
            let sessions = std::mem::take(&mut state.sessions);
            state.retire(idle.len() + sessions.len());
            (idle, sessions)
        };
        self.available.notify_all();
        debug!(pool = %self.name, destroyed = idle.len() + sessions.len(), "Pool shut down");

        for instance in idle {
            self.lifecycle.destroy(instance.bean);
        }
        for (key, instance) in sessions {
            self.lifecycle.destroy(instance.bean);
            self.notify_removed(key);
        }
    }

    /// Whether `shutdown` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let idle = state.idle.len() + state.sessions.len();
        PoolStats {
            total: state.total,
            idle,
            busy: state.total - idle,
            created: state.created,
            destroyed: state.destroyed,
        }
    }

    fn notify_removed(&self, key: IdentityKey) {
        for listener in self.listeners.read().iter() {
            listener.on_removed(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use container_core::error::LifecycleError;
    use container_core::traits::FnLifecycle;
    use std::sync::atomic::AtomicUsize;

    fn counter_pool(keyed: bool, config: PoolConfig) -> InstancePool<usize> {
        let next = Arc::new(AtomicUsize::new(0));
        let lifecycle = FnLifecycle::new(move || {
            Ok::<_, LifecycleError>(next.fetch_add(1, Ordering::SeqCst))
        });
        if keyed {
            InstancePool::keyed("counter", Arc::new(lifecycle), config).unwrap()
        } else {
            InstancePool::new("counter", Arc::new(lifecycle), config).unwrap()
        }
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let config = PoolConfig {
            min_instances: 3,
            max_instances: 1,
            ..PoolConfig::default()
        };
        let lifecycle: Arc<dyn InstanceLifecycle<u8>> = Arc::new(FnLifecycle::new(|| Ok::<_, LifecycleError>(0u8)));
        assert_matches!(
            InstancePool::new("bad", lifecycle, config),
            Err(ConfigError::InvalidPoolBounds { min: 3, max: 1 })
        );
    }

    #[test]
    fn test_released_instance_is_reused() {
        let pool = counter_pool(false, PoolConfig::default());
        let first = pool.acquire(None).unwrap();
        let first_id = first.id();
        pool.release(first);

        let again = pool.acquire(None).unwrap();
        assert_eq!(again.id(), first_id);
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn test_exhausted_without_wait() {
        let pool = counter_pool(
            false,
            PoolConfig {
                max_instances: 1,
                wait_timeout_ms: None,
                ..PoolConfig::default()
            },
        );
        let _held = pool.acquire(None).unwrap();
        assert_matches!(pool.acquire(None), Err(PoolError::Exhausted(_)));
    }

    #[test]
    fn test_spare_limit_destroys_surplus() {
        let pool = counter_pool(
            false,
            PoolConfig {
                spare_instances: Some(1),
                ..PoolConfig::default()
            },
        );
        let a = pool.acquire(None).unwrap();
        let b = pool.acquire(None).unwrap();
        pool.release(a);
        pool.release(b);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.destroyed, 1);
    }

    #[test]
    fn test_pre_warm_fills_minimum() {
        let pool = counter_pool(
            false,
            PoolConfig {
                min_instances: 3,
                ..PoolConfig::default()
            },
        );
        assert_eq!(pool.pre_warm().unwrap(), 3);
        assert_eq!(pool.stats().idle, 3);
        assert_eq!(pool.pre_warm().unwrap(), 0);
    }

    #[test]
    fn test_keyed_acquire_routes_by_key() {
        let pool = counter_pool(true, PoolConfig::default());
        let mut first = pool.acquire(None).unwrap();
        let key = first.key().unwrap();
        *first.bean_mut() = 42;
        pool.release(first);

        let other = pool.acquire(None).unwrap();
        assert_ne!(other.key(), Some(key));
        pool.release(other);

        let again = pool.acquire(Some(key)).unwrap();
        assert_eq!(*again.bean(), 42);
        assert_matches!(pool.acquire(Some(key)), Err(PoolError::InstanceInUse(k)) if k == key);
    }

    #[test]
    fn test_removed_key_is_never_reissued() {
        let pool = counter_pool(true, PoolConfig::default());
        let instance = pool.acquire(None).unwrap();
        let key = instance.key().unwrap();
        pool.remove(instance);

        assert_matches!(pool.acquire(Some(key)), Err(PoolError::InstanceAlreadyRemoved(_)));
        let fresh = pool.acquire(None).unwrap();
        assert_ne!(fresh.key(), Some(key));
        assert_matches!(
            pool.acquire(Some(IdentityKey(999))),
            Err(PoolError::UnknownIdentity(_))
        );
    }

    #[test]
    fn test_discard_is_idempotent_and_notifies() {
        struct Recorder(Mutex<Vec<IdentityKey>>);
        impl RemovalListener for Recorder {
            fn on_removed(&self, key: IdentityKey) {
                self.0.lock().push(key);
            }
        }

        let pool = counter_pool(true, PoolConfig::default());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        pool.add_removal_listener(recorder.clone());

        let instance = pool.acquire(None).unwrap();
        let key = instance.key().unwrap();
        pool.release(instance);

        assert!(pool.discard(key));
        assert!(!pool.discard(key));
        assert_eq!(*recorder.0.lock(), vec![key]);
    }

    #[test]
    fn test_failed_creation_returns_slot() {
        let lifecycle: Arc<dyn InstanceLifecycle<u8>> = Arc::new(FnLifecycle::new(|| {
            Err(LifecycleError::ConstructionFailed("boom".into()))
        }));
        let pool = InstancePool::new(
            "broken",
            lifecycle,
            PoolConfig {
                max_instances: 1,
                ..PoolConfig::default()
            },
        )
        .unwrap();

        assert_matches!(pool.acquire(None), Err(PoolError::InstanceCreationFailed(_)));
        assert_eq!(pool.stats().total, 0);
    }

    #[test]
    fn test_cleanup_idle_respects_minimum() {
        let pool = counter_pool(
            false,
            PoolConfig {
                min_instances: 1,
                idle_timeout_sec: Some(0),
                ..PoolConfig::default()
            },
        );
        let a = pool.acquire(None).unwrap();
        let b = pool.acquire(None).unwrap();
        pool.release(a);
        pool.release(b);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(pool.cleanup_idle(), 1);
        assert_eq!(pool.stats().total, 1);
    }

    #[test]
    fn test_shutdown_rejects_and_destroys_late_release() {
        let pool = counter_pool(false, PoolConfig::default());
        let held = pool.acquire(None).unwrap();
        let idle = pool.acquire(None).unwrap();
        pool.release(idle);

        pool.shutdown();
        assert_matches!(pool.acquire(None), Err(PoolError::ShuttingDown(_)));
        assert_eq!(pool.stats().total, 1);

        pool.release(held);
        assert_eq!(pool.stats().total, 0);
        assert_eq!(pool.stats().destroyed, 2);
    }
}
