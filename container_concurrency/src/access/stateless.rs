use super::{AccessController, AccessRequest};
use container_core::error::AccessError;

/// Access for stateless components.
///
/// The pool already gives every call an instance of its own, so entry is
/// always granted immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct PooledAccess;

/// Permit of a [`PooledAccess`]; holds nothing.
#[derive(Debug)]
pub struct PooledPermit;

impl AccessController for PooledAccess {
    type Permit<'a> = PooledPermit;

    fn try_enter<'a>(&'a self, _request: &AccessRequest) -> Result<PooledPermit, AccessError> {
        Ok(PooledPermit)
    }
}
