//! Business-level failures raised by component methods.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An error raised by a business method.
///
/// `kind` names the failure type (matched against declared application
/// exceptions); `cause` chains the failure that triggered it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeanFault {
    /// Failure type name.
    pub kind: String,

    /// Human-readable message.
    pub message: String,

    /// Underlying failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<BeanFault>>,
}

impl BeanFault {
    /// Create a fault without a cause.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the failure that caused this one.
    pub fn caused_by(mut self, cause: BeanFault) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Walk the cause chain to its end.
    pub fn root_cause(&self) -> &BeanFault {
        let mut current = self;
        while let Some(cause) = &current.cause {
            current = cause;
        }
        current
    }

    /// Iterate this fault followed by its causes.
    pub fn chain(&self) -> impl Iterator<Item = &BeanFault> {
        std::iter::successors(Some(self), |fault| fault.cause.as_deref())
    }
}

impl fmt::Display for BeanFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for BeanFault {}

/// Why invoking a method handler did not produce a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvokeFailure {
    /// The business method itself failed.
    Fault(BeanFault),

    /// Arguments did not match the method.
    IllegalArgument(String),

    /// The method may not be called in the current state.
    IllegalAccess(String),
}

impl From<BeanFault> for InvokeFailure {
    fn from(fault: BeanFault) -> Self {
        Self::Fault(fault)
    }
}

impl fmt::Display for InvokeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault(fault) => write!(f, "{}", fault),
            Self::IllegalArgument(msg) => write!(f, "illegal argument: {}", msg),
            Self::IllegalAccess(msg) => write!(f, "illegal access: {}", msg),
        }
    }
}
