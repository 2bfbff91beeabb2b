//! Access control for component instances.
//!
//! Every call passes through an [`AccessController`] before it touches a
//! bean. Stateless components need no coordination because the pool hands
//! each call its own instance. Stateful components serialize calls per
//! identity key. Singletons share one bean behind a read-write lock.

mod identity;
mod singleton;
mod stateless;

use std::time::Duration;

use container_core::error::AccessError;
use container_core::types::{AccessMode, AccessTimeout, IdentityKey, LockType};

pub use identity::{IdentityLock, IdentityLocks, IdentityPermit};
pub use singleton::{SingletonLock, SingletonPermit, ThreadHold};
pub use stateless::{PooledAccess, PooledPermit};

/// What a call asks the controller for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessRequest {
    /// Identity key of the target instance, if the component has them.
    pub identity: Option<IdentityKey>,

    /// Lock requested by the method.
    pub lock_type: LockType,

    /// How long to wait for the target.
    pub timeout: AccessTimeout,
}

impl AccessRequest {
    /// Create a request.
    pub fn new(identity: Option<IdentityKey>, lock_type: LockType, timeout: AccessTimeout) -> Self {
        Self {
            identity,
            lock_type,
            timeout,
        }
    }
}

/// Grants calls permission to run on a component's instances.
pub trait AccessController: Send + Sync {
    /// Held for the duration of the call; access ends when it is dropped.
    type Permit<'a>
    where
        Self: 'a;

    /// Wait for access according to `request.timeout`.
    fn try_enter<'a>(&'a self, request: &AccessRequest) -> Result<Self::Permit<'a>, AccessError>;
}

/// Classify a failed wait on `target`.
pub(crate) fn denial(target: &str, timeout: &AccessTimeout, waited: Duration) -> AccessError {
    match timeout.mode() {
        AccessMode::Bounded(_) => AccessError::ConcurrentAccessTimeout {
            target: target.to_string(),
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        },
        AccessMode::NoWait | AccessMode::Indefinite => {
            AccessError::ConcurrentAccessDenied(target.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_denial_classification() {
        assert_matches!(
            denial("cart#1", &AccessTimeout::NO_WAIT, Duration::ZERO),
            AccessError::ConcurrentAccessDenied(target) if target == "cart#1"
        );
        assert_matches!(
            denial("cart#1", &AccessTimeout::millis(50), Duration::from_millis(51)),
            AccessError::ConcurrentAccessTimeout { waited_ms: 51, .. }
        );
    }
}
