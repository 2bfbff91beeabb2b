//! Container Concurrency - instance pooling and access control
//!
//! This crate provides the concurrency primitives of the component
//! container: the instance pool shared by stateless and stateful
//! components, and the access controllers that decide when a call may
//! touch an instance.

pub mod access;
pub mod pool;

pub use access::{
    AccessController, AccessRequest, IdentityLock, IdentityLocks, IdentityPermit, PooledAccess,
    PooledPermit, SingletonLock, SingletonPermit, ThreadHold,
};
pub use pool::{ComponentInstance, InstancePool, PoolConfig, PoolStats};
