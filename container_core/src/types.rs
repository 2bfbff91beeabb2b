//! Core types for the component container.
//!
//! This module defines the fundamental data structures shared across all
//! container crates. It aims to be minimal and focused, with no complex
//! dependencies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, Result};

/// Session-scoped identifier routing stateful calls to one instance.
///
/// Keys are handed out by the stateful pool from a monotonic counter and
/// are never reused, even after the owning instance is removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey(pub u64);

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-pool identifier of a component instance, for diagnostics only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Stable hash of a method signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodHash(pub u64);

impl MethodHash {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    /// Hash a signature such as `"deposit(u64)"`.
    ///
    /// FNV-1a, so the value is identical across processes and builds.
    pub fn of(signature: &str) -> Self {
        let hash = signature.bytes().fold(Self::FNV_OFFSET, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(Self::FNV_PRIME)
        });
        Self(hash)
    }
}

impl fmt::Display for MethodHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Concurrency model of a component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// No identity; any idle instance serves any call.
    Stateless,

    /// One instance and one lock per identity key.
    Stateful,

    /// Exactly one instance guarded by a read-write lock.
    Singleton,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stateless => write!(f, "stateless"),
            Self::Stateful => write!(f, "stateful"),
            Self::Singleton => write!(f, "singleton"),
        }
    }
}

/// Lock requested by a singleton method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    /// Shared; may run alongside other readers.
    Read,

    /// Exclusive against every other call.
    #[default]
    Write,
}

/// Who synchronizes access to a singleton.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyManagement {
    /// The container takes the read or write lock declared per method.
    #[default]
    Container,

    /// The bean synchronizes itself; the container takes no lock.
    Bean,
}

/// Unit of an access timeout value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Convert `value` units to a duration.
    pub fn to_duration(self, value: u64) -> Duration {
        match self {
            Self::Nanoseconds => Duration::from_nanos(value),
            Self::Microseconds => Duration::from_micros(value),
            Self::Milliseconds => Duration::from_millis(value),
            Self::Seconds => Duration::from_secs(value),
            Self::Minutes => Duration::from_secs(value.saturating_mul(60)),
            Self::Hours => Duration::from_secs(value.saturating_mul(3_600)),
            Self::Days => Duration::from_secs(value.saturating_mul(86_400)),
        }
    }
}

/// How long a call may wait for its instance or singleton lock.
///
/// `-1` waits forever, `0` fails immediately when the target is busy, and
/// any positive value waits up to that many units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawAccessTimeout")]
pub struct AccessTimeout {
    value: i64,
    unit: TimeUnit,
}

#[derive(Deserialize)]
struct RawAccessTimeout {
    value: i64,
    #[serde(default = "default_unit")]
    unit: TimeUnit,
}

fn default_unit() -> TimeUnit {
    TimeUnit::Milliseconds
}

impl TryFrom<RawAccessTimeout> for AccessTimeout {
    type Error = ConfigError;

    fn try_from(raw: RawAccessTimeout) -> std::result::Result<Self, Self::Error> {
        Self::checked(raw.value, raw.unit)
    }
}

/// Interpretation of an [`AccessTimeout`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Block until the target is free.
    Indefinite,

    /// Try once and fail fast.
    NoWait,

    /// Wait at most this long.
    Bounded(Duration),
}

impl AccessTimeout {
    /// Wait forever.
    pub const INDEFINITE: Self = Self {
        value: -1,
        unit: TimeUnit::Milliseconds,
    };

    /// Never wait.
    pub const NO_WAIT: Self = Self {
        value: 0,
        unit: TimeUnit::Milliseconds,
    };

    /// Create a timeout, rejecting values below `-1`.
    pub fn new(value: i64, unit: TimeUnit) -> Result<Self> {
        Ok(Self::checked(value, unit)?)
    }

    fn checked(value: i64, unit: TimeUnit) -> std::result::Result<Self, ConfigError> {
        if value < -1 {
            return Err(ConfigError::InvalidAccessTimeout(value));
        }
        Ok(Self { value, unit })
    }

    /// Bounded wait in milliseconds.
    pub fn millis(value: u64) -> Self {
        Self {
            value: i64::try_from(value).unwrap_or(i64::MAX),
            unit: TimeUnit::Milliseconds,
        }
    }

    /// The raw value.
    pub fn value(&self) -> i64 {
        self.value
    }

    /// The unit of the raw value.
    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    /// Resolve the wait mode.
    pub fn mode(&self) -> AccessMode {
        match self.value {
            -1 => AccessMode::Indefinite,
            0 => AccessMode::NoWait,
            v => AccessMode::Bounded(self.unit.to_duration(v.unsigned_abs())),
        }
    }
}

impl Default for AccessTimeout {
    fn default() -> Self {
        Self::INDEFINITE
    }
}

/// What kind of container work the current thread is doing.
///
/// Callees inspect this to decide which container services are legal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    #[default]
    Default,
    DependencyInjection,
    PostConstruct,
    BusinessMethod,
    PreDestroy,
    AfterCompletion,
}

/// Opaque handle to the code-loading scope of a component.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClassLoaderHandle {
    name: Arc<str>,
    id: Uuid,
}

impl ClassLoaderHandle {
    /// Create a new, distinct loader handle.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of this loader.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for ClassLoaderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.id)
    }
}

/// Correlation id of one invocation, chained to the invocation that
/// triggered it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId {
    /// This invocation.
    pub id: Uuid,

    /// The enclosing invocation, if any.
    pub parent: Option<Uuid>,
}

impl InvocationId {
    /// Start a new chain.
    pub fn root() -> Self {
        Self {
            id: Uuid::new_v4(),
            parent: None,
        }
    }

    /// Derive a child of this invocation.
    pub fn child(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent: Some(self.id),
        }
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(parent) => write!(f, "{}<-{}", self.id, parent),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Security identity of the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// Principal name.
    pub principal: String,

    /// Roles held by the principal.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl CallerIdentity {
    /// Name used when no principal was propagated.
    pub const ANONYMOUS: &'static str = "ANONYMOUS";

    /// Create a caller identity.
    pub fn new(principal: impl Into<String>, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            principal: principal.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// The unauthenticated caller.
    pub fn anonymous() -> Self {
        Self {
            principal: Self::ANONYMOUS.to_string(),
            roles: Vec::new(),
        }
    }
}

impl Default for CallerIdentity {
    fn default() -> Self {
        Self::anonymous()
    }
}
