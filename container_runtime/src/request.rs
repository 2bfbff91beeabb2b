//! Call requests and responses.
//!
//! Every failure raised while serving a call is folded into the
//! [`CallResponse`]; nothing escapes the dispatch boundary as an error.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use container_core::error::{AccessError, PoolError};
use container_core::fault::BeanFault;
use container_core::types::{CallerIdentity, IdentityKey, MethodHash};

/// A business method call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Hash of the target method's signature.
    pub method: MethodHash,

    /// Arguments, in declaration order.
    #[serde(default)]
    pub args: Vec<Value>,

    /// Target instance of a stateful component. `None` starts a new
    /// session.
    #[serde(default)]
    pub identity: Option<IdentityKey>,

    /// Set when a remote layer already emitted events for this call.
    #[serde(default)]
    pub called_remotely: bool,

    /// Business interface the call came through.
    #[serde(default)]
    pub interface: Option<String>,

    /// Who is calling.
    #[serde(default)]
    pub caller: CallerIdentity,
}

impl CallRequest {
    /// Call the method with `signature`.
    pub fn new(signature: &str) -> Self {
        Self::for_method(MethodHash::of(signature))
    }

    /// Call the method with a precomputed hash.
    pub fn for_method(method: MethodHash) -> Self {
        Self {
            method,
            args: Vec::new(),
            identity: None,
            called_remotely: false,
            interface: None,
            caller: CallerIdentity::anonymous(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Target a stateful instance.
    pub fn identity(mut self, key: IdentityKey) -> Self {
        self.identity = Some(key);
        self
    }

    /// Name the business interface.
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Mark as already announced by a remote layer.
    pub fn remote(mut self) -> Self {
        self.called_remotely = true;
        self
    }

    /// Set the caller.
    pub fn caller(mut self, caller: CallerIdentity) -> Self {
        self.caller = caller;
        self
    }
}

/// Why a call failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The method hash is not in the component's table.
    MethodNotFound,

    /// Zero-wait access found the target busy.
    ConcurrentAccessDenied,

    /// Bounded wait elapsed with the target still busy.
    ConcurrentAccessTimeout,

    /// The identity key belongs to a removed instance.
    InstanceAlreadyRemoved,

    /// No instance was available within the pool's wait.
    PoolExhausted,

    /// The method raised a declared application exception.
    ApplicationFailure,

    /// Any other failure; a container fault.
    SystemFailure,
}

impl FailureKind {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MethodNotFound => "method_not_found",
            Self::ConcurrentAccessDenied => "concurrent_access_denied",
            Self::ConcurrentAccessTimeout => "concurrent_access_timeout",
            Self::InstanceAlreadyRemoved => "instance_already_removed",
            Self::PoolExhausted => "pool_exhausted",
            Self::ApplicationFailure => "application_failure",
            Self::SystemFailure => "system_failure",
        }
    }
}

/// Failure descriptor carried by a response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFailure {
    /// Classification.
    pub kind: FailureKind,

    /// Description.
    pub message: String,

    /// The business fault, for application and fault-caused system
    /// failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<BeanFault>,
}

impl CallFailure {
    /// Create a failure without a fault.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fault: None,
        }
    }

    /// Container fault.
    pub fn system(message: impl Into<String>) -> Self {
        Self::new(FailureKind::SystemFailure, message)
    }

    /// Declared application exception.
    pub fn application(fault: BeanFault) -> Self {
        Self {
            kind: FailureKind::ApplicationFailure,
            message: fault.to_string(),
            fault: Some(fault),
        }
    }

    /// Undeclared business fault, reported as a container fault.
    pub fn undeclared(fault: BeanFault) -> Self {
        Self {
            kind: FailureKind::SystemFailure,
            message: fault.to_string(),
            fault: Some(fault),
        }
    }

    /// Whether this is a business-level failure.
    pub fn is_application(&self) -> bool {
        self.kind == FailureKind::ApplicationFailure
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for CallFailure {}

impl From<AccessError> for CallFailure {
    fn from(err: AccessError) -> Self {
        let kind = match err {
            AccessError::ConcurrentAccessDenied(_) => FailureKind::ConcurrentAccessDenied,
            AccessError::ConcurrentAccessTimeout { .. } => FailureKind::ConcurrentAccessTimeout,
            AccessError::IllegalLoopback { .. } => FailureKind::SystemFailure,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<PoolError> for CallFailure {
    fn from(err: PoolError) -> Self {
        let kind = match err {
            PoolError::Exhausted(_) => FailureKind::PoolExhausted,
            PoolError::InstanceAlreadyRemoved(_) | PoolError::UnknownIdentity(_) => {
                FailureKind::InstanceAlreadyRemoved
            }
            PoolError::InstanceInUse(_)
            | PoolError::InstanceCreationFailed(_)
            | PoolError::ShuttingDown(_) => FailureKind::SystemFailure,
        };
        Self::new(kind, err.to_string())
    }
}

/// Value or failure of a call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Value(Value),
    Failure(CallFailure),
}

/// Result of a call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    /// What the call produced.
    pub outcome: CallOutcome,

    /// Identity of the stateful instance that served the call, possibly
    /// newly assigned.
    #[serde(default)]
    pub identity: Option<IdentityKey>,

    /// The identity is dead; the caller must not reuse it.
    #[serde(default)]
    pub instance_removed: bool,

    /// Invocation number, when the business method ran.
    #[serde(default)]
    pub invocation_number: Option<u64>,
}

impl CallResponse {
    /// A response for a call that failed before reaching the bean.
    pub fn failed(failure: CallFailure, identity: Option<IdentityKey>) -> Self {
        let instance_removed = failure.kind == FailureKind::InstanceAlreadyRemoved;
        Self {
            outcome: CallOutcome::Failure(failure),
            identity,
            instance_removed,
            invocation_number: None,
        }
    }

    /// Whether the call returned a value.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CallOutcome::Value(_))
    }

    /// The returned value.
    pub fn value(&self) -> Option<&Value> {
        match &self.outcome {
            CallOutcome::Value(value) => Some(value),
            CallOutcome::Failure(_) => None,
        }
    }

    /// The failure.
    pub fn failure(&self) -> Option<&CallFailure> {
        match &self.outcome {
            CallOutcome::Value(_) => None,
            CallOutcome::Failure(failure) => Some(failure),
        }
    }

    /// Convert into a `Result` for callers that re-raise failures.
    pub fn into_result(self) -> Result<Value, CallFailure> {
        match self.outcome {
            CallOutcome::Value(value) => Ok(value),
            CallOutcome::Failure(failure) => Err(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pool_errors_map_to_failure_kinds() {
        let removed = CallFailure::from(PoolError::UnknownIdentity(IdentityKey(9)));
        assert_eq!(removed.kind, FailureKind::InstanceAlreadyRemoved);

        let exhausted = CallFailure::from(PoolError::Exhausted("worker".into()));
        assert_eq!(exhausted.kind, FailureKind::PoolExhausted);

        let response = CallResponse::failed(removed, Some(IdentityKey(9)));
        assert!(response.instance_removed);
    }

    #[test]
    fn test_access_errors_map_to_failure_kinds() {
        let timeout = CallFailure::from(AccessError::ConcurrentAccessTimeout {
            target: "cart#1".into(),
            waited_ms: 10,
        });
        assert_eq!(timeout.kind, FailureKind::ConcurrentAccessTimeout);
        assert!(timeout.message.contains("cart#1"));
    }

    #[test]
    fn test_request_serializes_for_transport() {
        let request = CallRequest::new("deposit(u64)")
            .arg(25)
            .identity(IdentityKey(3))
            .interface("Account");
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["args"], json!([25]));
        assert_eq!(encoded["identity"], json!(3));

        let decoded: CallRequest = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_into_result() {
        let ok = CallResponse {
            outcome: CallOutcome::Value(json!(1)),
            identity: None,
            instance_removed: false,
            invocation_number: Some(1),
        };
        assert_eq!(ok.into_result().unwrap(), json!(1));

        let fault = BeanFault::new("Overdrawn", "balance too low");
        let failed = CallResponse::failed(CallFailure::application(fault.clone()), None);
        let err = failed.into_result().unwrap_err();
        assert!(err.is_application());
        assert_eq!(err.fault, Some(fault));
    }
}
