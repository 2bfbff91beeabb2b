//! Per-identity locks for stateful components.

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use container_core::error::AccessError;
use container_core::traits::RemovalListener;
use container_core::types::{AccessMode, IdentityKey, LockType};

use super::{denial, AccessController, AccessRequest};

/// Exclusive lock guarding one stateful instance.
///
/// The lock records the thread holding it, so a call that loops back into
/// the instance it is already running on can be refused instead of
/// waiting on itself.
#[derive(Debug, Default)]
pub struct IdentityLock {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl IdentityLock {
    /// Take the lock, waiting according to `mode`. Returns `false` if the
    /// lock is still held when the wait ends.
    pub fn acquire(&self, mode: AccessMode) -> bool {
        let mut owner = self.owner.lock();
        match mode {
            AccessMode::NoWait => {
                if owner.is_some() {
                    return false;
                }
            }
            AccessMode::Indefinite => self.wait_released(&mut owner),
            // A deadline past the end of the clock never arrives.
            AccessMode::Bounded(timeout) => match Instant::now().checked_add(timeout) {
                Some(deadline) => {
                    while owner.is_some() {
                        if self.released.wait_until(&mut owner, deadline).timed_out() && owner.is_some() {
                            return false;
                        }
                    }
                }
                None => self.wait_released(&mut owner),
            },
        }
        *owner = Some(thread::current().id());
        true
    }

    fn wait_released(&self, owner: &mut MutexGuard<'_, Option<ThreadId>>) {
        while owner.is_some() {
            self.released.wait(owner);
        }
    }

    /// Give the lock back and wake one waiter.
    pub fn release(&self) {
        *self.owner.lock() = None;
        self.released.notify_one();
    }

    /// Whether a call currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.owner.lock().is_some()
    }

    /// Whether the lock is held by a call on this thread.
    pub fn is_held_by_current_thread(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }
}

/// Lock table of a stateful component, one lock per identity key.
///
/// Entries are created on first use and dropped when the pool retires the
/// key.
pub struct IdentityLocks {
    component: String,
    locks: DashMap<IdentityKey, Arc<IdentityLock>>,
}

impl IdentityLocks {
    /// Create an empty table.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: IdentityKey) -> Arc<IdentityLock> {
        // Clone out of the entry so no shard guard is held while waiting.
        self.locks.entry(key).or_default().value().clone()
    }

    /// Drop the lock entry of a retired key.
    pub fn forget(&self, key: IdentityKey) -> bool {
        self.locks.remove(&key).is_some()
    }

    /// Whether a call holds the lock of `key`.
    pub fn is_locked(&self, key: IdentityKey) -> bool {
        self.locks.get(&key).map_or(false, |lock| lock.is_held())
    }

    /// Number of keys with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl AccessController for IdentityLocks {
    type Permit<'a> = IdentityPermit;

    /// A request without identity targets an instance nobody else can
    /// reach yet and is granted without locking.
    fn try_enter<'a>(&'a self, request: &AccessRequest) -> Result<IdentityPermit, AccessError> {
        let Some(key) = request.identity else {
            return Ok(IdentityPermit { key: None, lock: None });
        };

        let lock = self.lock_for(key);
        if lock.is_held_by_current_thread() {
            debug!(component = %self.component, key = %key, "Loopback call on a locked identity");
            return Err(AccessError::IllegalLoopback {
                target: format!("{}{}", self.component, key),
                held: LockType::Write,
                requested: request.lock_type,
            });
        }

        let started = Instant::now();
        if lock.acquire(request.timeout.mode()) {
            return Ok(IdentityPermit {
                key: Some(key),
                lock: Some(lock),
            });
        }

        let waited = started.elapsed();
        debug!(
            component = %self.component,
            key = %key,
            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            "Identity lock denied"
        );
        Err(denial(&format!("{}{}", self.component, key), &request.timeout, waited))
    }
}

impl RemovalListener for IdentityLocks {
    fn on_removed(&self, key: IdentityKey) {
        self.forget(key);
    }
}

/// Held identity lock; released exactly once, on drop or by `release`.
#[derive(Debug)]
pub struct IdentityPermit {
    key: Option<IdentityKey>,
    lock: Option<Arc<IdentityLock>>,
}

impl IdentityPermit {
    /// The locked key.
    pub fn key(&self) -> Option<IdentityKey> {
        self.key
    }

    /// Release the lock now.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }
}

impl Drop for IdentityPermit {
    fn drop(&mut self) {
        self.unlock();
    }
}
