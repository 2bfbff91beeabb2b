//! Invocation lifecycle events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CallerIdentity, InvocationId};

/// Stage of an invocation an event reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InvocationEventKind {
    /// The business method is about to run.
    Begin {
        principal: String,
        roles: Vec<String>,
    },

    /// The business method returned normally.
    End,

    /// The business method or the container failed.
    Error { message: String },
}

/// One begin, end or error record of a call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationEvent {
    /// `<component>/<method signature>/<interface>`.
    pub provider_id: String,

    /// Monotonic number shared by the begin and end/error of one call.
    pub number: u64,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    /// Correlation id, when the invocation-id facility is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<InvocationId>,

    /// What happened.
    pub kind: InvocationEventKind,
}

impl InvocationEvent {
    /// Create a begin event for `caller`.
    pub fn begin(
        provider_id: impl Into<String>,
        number: u64,
        invocation_id: Option<InvocationId>,
        caller: &CallerIdentity,
    ) -> Self {
        Self::with_kind(
            provider_id,
            number,
            invocation_id,
            InvocationEventKind::Begin {
                principal: caller.principal.clone(),
                roles: caller.roles.clone(),
            },
        )
    }

    /// Create an end event.
    pub fn end(provider_id: impl Into<String>, number: u64, invocation_id: Option<InvocationId>) -> Self {
        Self::with_kind(provider_id, number, invocation_id, InvocationEventKind::End)
    }

    /// Create an error event.
    pub fn error(
        provider_id: impl Into<String>,
        number: u64,
        invocation_id: Option<InvocationId>,
        message: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            provider_id,
            number,
            invocation_id,
            InvocationEventKind::Error {
                message: message.into(),
            },
        )
    }

    fn with_kind(
        provider_id: impl Into<String>,
        number: u64,
        invocation_id: Option<InvocationId>,
        kind: InvocationEventKind,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            number,
            timestamp: Utc::now(),
            invocation_id,
            kind,
        }
    }

    /// Whether this is a begin event.
    pub fn is_begin(&self) -> bool {
        matches!(self.kind, InvocationEventKind::Begin { .. })
    }
}

impl fmt::Display for InvocationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match &self.kind {
            InvocationEventKind::Begin { principal, .. } => format!("begin by {}", principal),
            InvocationEventKind::End => "end".to_string(),
            InvocationEventKind::Error { message } => format!("error: {}", message),
        };
        write!(f, "[{}] {} #{} {}", self.timestamp, self.provider_id, self.number, stage)
    }
}
