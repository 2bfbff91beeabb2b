//! Event dispatcher implementations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use container_core::event::{InvocationEvent, InvocationEventKind};
use container_core::traits::EventDispatcher;

/// Drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEventDispatcher;

impl EventDispatcher for NoopEventDispatcher {
    fn dispatch(&self, _event: &InvocationEvent) {}
}

/// Turns events into tracing records.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventDispatcher;

impl EventDispatcher for TracingEventDispatcher {
    fn dispatch(&self, event: &InvocationEvent) {
        match &event.kind {
            InvocationEventKind::Begin { principal, .. } => trace!(
                provider = %event.provider_id,
                number = event.number,
                principal = %principal,
                "Invocation begin"
            ),
            InvocationEventKind::End => trace!(
                provider = %event.provider_id,
                number = event.number,
                "Invocation end"
            ),
            InvocationEventKind::Error { message } => warn!(
                provider = %event.provider_id,
                number = event.number,
                error = %message,
                "Invocation error"
            ),
        }
    }
}

/// Forwards each event to several dispatchers in order.
#[derive(Clone, Default)]
pub struct FanoutEventDispatcher {
    targets: Vec<Arc<dyn EventDispatcher>>,
}

impl FanoutEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target.
    pub fn with(mut self, target: Arc<dyn EventDispatcher>) -> Self {
        self.targets.push(target);
        self
    }
}

impl EventDispatcher for FanoutEventDispatcher {
    fn dispatch(&self, event: &InvocationEvent) {
        for target in &self.targets {
            target.dispatch(event);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub event: InvocationEvent,
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp, self.event)
    }
}

/// In-memory record of dispatched events.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, event: InvocationEvent) {
        let record = EventRecord {
            timestamp: Utc::now(),
            event,
        };
        self.records.lock().push(record);
    }

    pub fn all(&self) -> Vec<EventRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Counters over everything recorded so far.
    pub fn stats(&self) -> InvocationStats {
        let mut stats = InvocationStats::new();
        for record in self.records.lock().iter() {
            stats.process_event(&record.event);
        }
        stats
    }
}

impl EventDispatcher for EventLog {
    fn dispatch(&self, event: &InvocationEvent) {
        self.append(event.clone());
    }
}

/// Begin/end/error counts per provider.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProviderCounts {
    pub begun: usize,
    pub ended: usize,
    pub failed: usize,
}

impl ProviderCounts {
    /// Calls that began and have not ended or failed.
    pub fn in_flight(&self) -> usize {
        self.begun.saturating_sub(self.ended + self.failed)
    }
}

#[derive(Debug, Default)]
pub struct InvocationStats {
    pub begun: usize,
    pub ended: usize,
    pub failed: usize,
    pub providers: HashMap<String, ProviderCounts>,
    pub last_errors: HashMap<String, String>,
}

impl InvocationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_event(&mut self, event: &InvocationEvent) {
        let counts = self.providers.entry(event.provider_id.clone()).or_default();
        match &event.kind {
            InvocationEventKind::Begin { .. } => {
                self.begun += 1;
                counts.begun += 1;
            }
            InvocationEventKind::End => {
                self.ended += 1;
                counts.ended += 1;
            }
            InvocationEventKind::Error { message } => {
                self.failed += 1;
                counts.failed += 1;
                self.last_errors
                    .insert(event.provider_id.clone(), message.clone());
            }
        }
    }

    /// Counts for one provider.
    pub fn provider(&self, provider_id: &str) -> Option<&ProviderCounts> {
        self.providers.get(provider_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use container_core::types::CallerIdentity;

    #[test]
    fn test_log_stats_pair_begin_with_end() {
        let log = EventLog::new();
        let fanout = FanoutEventDispatcher::new()
            .with(Arc::new(log.clone()))
            .with(Arc::new(NoopEventDispatcher));

        let caller = CallerIdentity::new("alice", ["teller"]);
        fanout.dispatch(&InvocationEvent::begin("bank/deposit(u64)/Account", 1, None, &caller));
        fanout.dispatch(&InvocationEvent::end("bank/deposit(u64)/Account", 1, None));
        fanout.dispatch(&InvocationEvent::begin("bank/withdraw(u64)/Account", 2, None, &caller));
        fanout.dispatch(&InvocationEvent::error("bank/withdraw(u64)/Account", 2, None, "overdrawn"));

        assert_eq!(log.len(), 4);
        let stats = log.stats();
        assert_eq!((stats.begun, stats.ended, stats.failed), (2, 1, 1));
        assert_eq!(stats.provider("bank/deposit(u64)/Account").unwrap().in_flight(), 0);
        assert_eq!(
            stats.last_errors.get("bank/withdraw(u64)/Account").map(String::as_str),
            Some("overdrawn")
        );
    }
}
