//! Read-write access to a singleton bean.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use container_core::error::AccessError;
use container_core::types::{AccessMode, ConcurrencyManagement, LockType};

use super::{denial, AccessController, AccessRequest};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Container-managed singleton locks held by calls on this thread,
    /// innermost last.
    static HELD: RefCell<Vec<(u64, LockType)>> = RefCell::new(Vec::new());
}

fn held_by_current_thread(lock_id: u64) -> Option<LockType> {
    HELD.with(|held| {
        held.borrow()
            .iter()
            .rev()
            .find(|(id, _)| *id == lock_id)
            .map(|(_, lock_type)| *lock_type)
    })
}

/// The single bean of a singleton component and its lock.
///
/// With container-managed concurrency, `Read` methods share the bean and
/// `Write` methods get it exclusively. With bean-managed concurrency every
/// call gets shared access and the bean synchronizes itself.
///
/// A call that loops back into a singleton its own thread already holds is
/// served without waiting when both hold the read lock, and refused with
/// [`AccessError::IllegalLoopback`] when either side needs the write lock:
/// the outer call is still using the bean exclusively, and an upgrade would
/// wait on itself.
pub struct SingletonLock<B> {
    id: u64,
    name: String,
    management: ConcurrencyManagement,
    bean: RwLock<B>,
}

impl<B> SingletonLock<B> {
    /// Wrap a freshly created bean.
    pub fn new(name: impl Into<String>, management: ConcurrencyManagement, bean: B) -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            management,
            bean: RwLock::new(bean),
        }
    }

    /// Component name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Who synchronizes access.
    pub fn management(&self) -> ConcurrencyManagement {
        self.management
    }

    /// Lock held on this singleton by a call on the current thread.
    pub fn held_by_current_thread(&self) -> Option<LockType> {
        held_by_current_thread(self.id)
    }

    /// Take the bean back out, for destruction.
    pub fn into_bean(self) -> B {
        self.bean.into_inner()
    }

    fn read_with(&self, mode: AccessMode) -> Option<RwLockReadGuard<'_, B>> {
        match mode {
            AccessMode::Indefinite => Some(self.bean.read()),
            AccessMode::NoWait => self.bean.try_read(),
            AccessMode::Bounded(timeout) => self.bean.try_read_for(timeout),
        }
    }

    fn write_with(&self, mode: AccessMode) -> Option<RwLockWriteGuard<'_, B>> {
        match mode {
            AccessMode::Indefinite => Some(self.bean.write()),
            AccessMode::NoWait => self.bean.try_write(),
            AccessMode::Bounded(timeout) => self.bean.try_write_for(timeout),
        }
    }

    fn hold(&self, lock_type: LockType) -> ThreadHold {
        HELD.with(|held| held.borrow_mut().push((self.id, lock_type)));
        ThreadHold { lock_id: self.id }
    }
}

impl<B: Send + Sync> AccessController for SingletonLock<B> {
    type Permit<'a> = SingletonPermit<'a, B> where Self: 'a;

    fn try_enter<'a>(&'a self, request: &AccessRequest) -> Result<SingletonPermit<'a, B>, AccessError> {
        if self.management == ConcurrencyManagement::Bean {
            // Nothing ever takes the write side while the bean is live.
            return Ok(SingletonPermit::Unmanaged(self.bean.read_recursive()));
        }

        match (self.held_by_current_thread(), request.lock_type) {
            (None, _) => {}
            (Some(LockType::Read), LockType::Read) => {
                // Recursive so a writer queued behind the outer call cannot
                // block its own nested read.
                let guard = self.bean.read_recursive();
                return Ok(SingletonPermit::Read(guard, self.hold(LockType::Read)));
            }
            (Some(held), requested) => {
                debug!(component = %self.name, ?held, ?requested, "Loopback call refused");
                return Err(AccessError::IllegalLoopback {
                    target: self.name.clone(),
                    held,
                    requested,
                });
            }
        }

        let mode = request.timeout.mode();
        let started = Instant::now();
        let permit = match request.lock_type {
            LockType::Read => self
                .read_with(mode)
                .map(|guard| SingletonPermit::Read(guard, self.hold(LockType::Read))),
            LockType::Write => self
                .write_with(mode)
                .map(|guard| SingletonPermit::Write(guard, self.hold(LockType::Write))),
        };

        permit.ok_or_else(|| {
            let waited = started.elapsed();
            debug!(
                component = %self.name,
                lock = ?request.lock_type,
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                "Singleton lock denied"
            );
            denial(&self.name, &request.timeout, waited)
        })
    }
}

/// Marks a singleton lock as held by the current thread until dropped.
#[derive(Debug)]
pub struct ThreadHold {
    lock_id: u64,
}

impl Drop for ThreadHold {
    fn drop(&mut self) {
        let lock_id = self.lock_id;
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(index) = held.iter().rposition(|(id, _)| *id == lock_id) {
                held.remove(index);
            }
        });
    }
}

/// Access granted to a singleton bean.
pub enum SingletonPermit<'a, B> {
    /// Shared lock held.
    Read(RwLockReadGuard<'a, B>, ThreadHold),

    /// Exclusive lock held.
    Write(RwLockWriteGuard<'a, B>, ThreadHold),

    /// Bean-managed concurrency; no exclusion is provided.
    Unmanaged(RwLockReadGuard<'a, B>),
}

impl<B> std::fmt::Debug for SingletonPermit<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            SingletonPermit::Read(..) => "Read",
            SingletonPermit::Write(..) => "Write",
            SingletonPermit::Unmanaged(..) => "Unmanaged",
        };
        f.debug_tuple("SingletonPermit").field(&variant).finish()
    }
}

impl<'a, B> SingletonPermit<'a, B> {
    /// Shared access to the bean.
    pub fn bean(&self) -> &B {
        match self {
            Self::Read(guard, _) | Self::Unmanaged(guard) => &**guard,
            Self::Write(guard, _) => &**guard,
        }
    }

    /// Exclusive access, only under a write lock.
    pub fn bean_mut(&mut self) -> Option<&mut B> {
        match self {
            Self::Write(guard, _) => Some(&mut **guard),
            Self::Read(..) | Self::Unmanaged(_) => None,
        }
    }

    /// Whether this permit excludes every other call.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::Write(..))
    }
}
