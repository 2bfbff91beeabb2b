//! Invocation dispatch.
//!
//! The dispatcher owns the part of a call that is identical for every
//! component kind: method resolution, context switching, begin/end/error
//! events, outcome classification and response construction. Getting
//! access and an instance, and giving them back afterwards, differ per kind
//! and are delegated to an [`InstanceBinding`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
#[cfg(feature = "observability")]
use std::time::Instant;

use tracing::{debug, warn};

use container_concurrency::AccessRequest;
use container_core::event::InvocationEvent;
use container_core::fault::InvokeFailure;
use container_core::traits::{ApplicationExceptionRegistry, ClassLoaderProvider, EventDispatcher};
use container_core::types::{AccessTimeout, ClassLoaderHandle, IdentityKey};

use crate::context::{ContextScope, InvocationContext, InvocationIdScope};
use crate::method::{BeanRef, Invocation, MethodDescriptor, MethodTable};
use crate::request::{CallFailure, CallOutcome, CallRequest, CallResponse, FailureKind};

/// What the business step of a call produced.
pub(crate) struct BodyOutcome {
    pub outcome: CallOutcome,

    /// The instance must not be reused.
    pub remove: bool,

    /// The handler panicked; the bean may be half-updated.
    pub poisoned: bool,
}

/// What a binding reports back once the instance is released or removed.
pub(crate) struct Bound {
    pub outcome: CallOutcome,
    pub identity: Option<IdentityKey>,
    pub removed: bool,
}

/// Business step handed to a binding.
pub(crate) type Body<'b, B> = dyn FnMut(BeanRef<'_, B>, Option<IdentityKey>) -> BodyOutcome + 'b;

/// Kind-specific half of a call.
///
/// An implementation takes access, acquires the instance, runs `body`
/// exactly once on it, then releases or removes the instance and gives
/// access back, in that order, on every path. A denial or pool failure is
/// returned without running `body`.
pub(crate) trait InstanceBinding<B> {
    fn bind(&self, access: &AccessRequest, body: &mut Body<'_, B>) -> Result<Bound, CallFailure>;
}

/// Collaborators and settings of a dispatcher.
pub(crate) struct DispatcherSettings {
    pub class_loader: Arc<dyn ClassLoaderProvider>,
    pub events: Arc<dyn EventDispatcher>,
    pub exceptions: Arc<dyn ApplicationExceptionRegistry>,
    pub default_timeout: AccessTimeout,
    pub invocation_ids: bool,
    pub emit_events: bool,
}

/// Serves calls to one component.
pub struct InvocationDispatcher<B> {
    component: String,
    methods: MethodTable<B>,
    settings: DispatcherSettings,
    next_number: AtomicU64,
}

impl<B> InvocationDispatcher<B> {
    pub(crate) fn new(component: String, methods: MethodTable<B>, settings: DispatcherSettings) -> Self {
        Self {
            component,
            methods,
            settings,
            next_number: AtomicU64::new(1),
        }
    }

    /// Component name.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// The component's methods.
    pub fn methods(&self) -> &MethodTable<B> {
        &self.methods
    }

    /// Invocations started so far.
    pub fn invocations(&self) -> u64 {
        self.next_number.load(Ordering::Relaxed) - 1
    }

    pub(crate) fn dispatch(&self, binding: &dyn InstanceBinding<B>, request: CallRequest) -> CallResponse {
        let Some(method) = self.methods.get(request.method) else {
            debug!(component = %self.component, method = %request.method, "Method not found");
            let failure = CallFailure::new(
                FailureKind::MethodNotFound,
                format!("method {} not found on {}", request.method, self.component),
            );
            return CallResponse::failed(failure, request.identity);
        };

        let access = AccessRequest::new(
            request.identity,
            method.lock_type,
            method.access_timeout.unwrap_or(self.settings.default_timeout),
        );

        let mut number = None;
        let result = binding.bind(&access, &mut |bean, identity| {
            let (outcome, n) = self.invoke(method, &request, bean, identity);
            number = Some(n);
            outcome
        });

        match result {
            Ok(bound) => CallResponse {
                outcome: bound.outcome,
                identity: bound.identity,
                instance_removed: bound.removed,
                invocation_number: number,
            },
            Err(failure) => {
                debug!(
                    component = %self.component,
                    method = %method.signature,
                    error = %failure,
                    "Call refused"
                );
                self.record_refusal(&failure);
                CallResponse::failed(failure, request.identity)
            }
        }
    }

    /// Run the business method on an instance the binding holds.
    fn invoke(
        &self,
        method: &MethodDescriptor<B>,
        request: &CallRequest,
        bean: BeanRef<'_, B>,
        identity: Option<IdentityKey>,
    ) -> (BodyOutcome, u64) {
        #[cfg(feature = "observability")]
        let started = Instant::now();

        let class_loader = self.contained("class loader", || self.settings.class_loader.class_loader());
        let _context = ContextScope::enter(InvocationContext::business_call(
            class_loader.unwrap_or_else(|| ClassLoaderHandle::new(self.component.as_str())),
            request.interface.clone(),
        ));
        let id_scope = self.settings.invocation_ids.then(InvocationIdScope::new_invocation);
        let invocation_id = id_scope.as_ref().map(InvocationIdScope::id);

        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        let emit = self.settings.emit_events && !request.called_remotely;
        let provider_id = format!(
            "{}/{}/{}",
            self.component,
            method.signature,
            request.interface.as_deref().unwrap_or("local")
        );
        if emit {
            self.notify(&InvocationEvent::begin(
                provider_id.as_str(),
                number,
                invocation_id,
                &request.caller,
            ));
        }

        let mut invocation = Invocation::new(&request.args, identity, &request.caller);
        let (outcome, poisoned) = if request.args.len() != method.arity {
            let failure = CallFailure::system(format!(
                "illegal argument: {} takes {} arguments, got {}",
                method.signature,
                method.arity,
                request.args.len()
            ));
            (CallOutcome::Failure(failure), false)
        } else {
            match panic::catch_unwind(AssertUnwindSafe(|| method.handler.call(bean, &mut invocation))) {
                Ok(result) => (self.classify(result), false),
                Err(payload) => {
                    let failure = CallFailure::system(format!(
                        "{} panicked: {}",
                        method.signature,
                        panic_message(payload.as_ref())
                    ));
                    (CallOutcome::Failure(failure), true)
                }
            }
        };

        if emit {
            let event = match &outcome {
                CallOutcome::Value(_) => InvocationEvent::end(provider_id.as_str(), number, invocation_id),
                CallOutcome::Failure(failure) => {
                    InvocationEvent::error(provider_id.as_str(), number, invocation_id, failure.message.as_str())
                }
            };
            self.notify(&event);
        }

        let application_failure = matches!(&outcome, CallOutcome::Failure(f) if f.is_application());
        if let CallOutcome::Failure(failure) = &outcome {
            if failure.kind == FailureKind::SystemFailure {
                warn!(provider = %provider_id, number, error = %failure.message, "System failure");
            }
        }

        #[cfg(feature = "observability")]
        container_observability::record_invocation(
            &self.component,
            &method.signature,
            started.elapsed(),
            match &outcome {
                CallOutcome::Value(_) => "success",
                CallOutcome::Failure(failure) => failure.kind.as_str(),
            },
        );

        let remove = invocation.removal_requested()
            || (method.removes && !(method.retain_if_exception && application_failure));

        drop(id_scope);
        (
            BodyOutcome {
                outcome,
                remove,
                poisoned,
            },
            number,
        )
    }

    /// Hand `event` to the event dispatcher. Its failures never reach the
    /// caller.
    fn notify(&self, event: &InvocationEvent) {
        self.contained("event dispatcher", || self.settings.events.dispatch(event));
    }

    /// Run a collaborator, logging and absorbing a panic.
    fn contained<T>(&self, collaborator: &str, f: impl FnOnce() -> T) -> Option<T> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Some(value),
            Err(payload) => {
                warn!(
                    component = %self.component,
                    collaborator,
                    error = %panic_message(payload.as_ref()),
                    "Collaborator panicked"
                );
                None
            }
        }
    }

    #[cfg(feature = "observability")]
    fn record_refusal(&self, failure: &CallFailure) {
        match failure.kind {
            FailureKind::PoolExhausted => container_observability::record_pool_exhausted(&self.component),
            kind => container_observability::record_access_denied(&self.component, kind.as_str()),
        }
    }

    #[cfg(not(feature = "observability"))]
    fn record_refusal(&self, _failure: &CallFailure) {}

    fn classify(&self, result: Result<serde_json::Value, InvokeFailure>) -> CallOutcome {
        match result {
            Ok(value) => CallOutcome::Value(value),
            Err(InvokeFailure::Fault(fault)) => {
                let declared = self.contained("exception registry", || {
                    self.settings.exceptions.is_application_exception(&fault)
                });
                // An unanswered lookup counts as undeclared.
                if declared.unwrap_or(false) {
                    CallOutcome::Failure(CallFailure::application(fault))
                } else {
                    CallOutcome::Failure(CallFailure::undeclared(fault))
                }
            }
            Err(InvokeFailure::IllegalArgument(message)) => {
                CallOutcome::Failure(CallFailure::system(format!("illegal argument: {}", message)))
            }
            Err(InvokeFailure::IllegalAccess(message)) => {
                CallOutcome::Failure(CallFailure::system(format!("illegal access: {}", message)))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::exceptions::DeclaredApplicationExceptions;
    use crate::method::{MethodDescriptor, MethodTableBuilder};
    use assert_matches::assert_matches;
    use container_core::event::InvocationEventKind;
    use container_core::fault::BeanFault;
    use container_core::types::{ClassLoaderHandle, ComponentKind, ConcurrencyManagement};
    use serde_json::{json, Value};

    /// Binding over a single owned bean, without any locking.
    struct Direct(parking_lot::Mutex<i64>);

    impl InstanceBinding<i64> for Direct {
        fn bind(&self, access: &AccessRequest, body: &mut Body<'_, i64>) -> Result<Bound, CallFailure> {
            let mut bean = self.0.lock();
            let outcome = body(BeanRef::Exclusive(&mut *bean), access.identity);
            Ok(Bound {
                outcome: outcome.outcome,
                identity: access.identity,
                removed: outcome.remove || outcome.poisoned,
            })
        }
    }

    fn dispatcher(log: &EventLog) -> InvocationDispatcher<i64> {
        let methods = MethodTableBuilder::new(ComponentKind::Stateful, ConcurrencyManagement::Container)
            .method(MethodDescriptor::exclusive("add(i64)", 1, |total: &mut i64, inv| {
                *total += inv.arg::<i64>(0)?;
                Ok(json!(*total))
            }))
            .method(MethodDescriptor::shared("fail(String)", 1, |_: &i64, inv| {
                Err(BeanFault::new(inv.arg::<String>(0)?, "requested").into())
            }))
            .method(MethodDescriptor::shared("boom()", 0, |_: &i64, _| -> crate::method::MethodResult {
                panic!("boom")
            }))
            .method(MethodDescriptor::exclusive("close()", 0, |_: &mut i64, _| Ok(Value::Null)).removes(true))
            .build()
            .unwrap();

        InvocationDispatcher::new(
            "ledger".to_string(),
            methods,
            DispatcherSettings {
                class_loader: Arc::new(ClassLoaderHandle::new("ledger")),
                events: Arc::new(log.clone()),
                exceptions: Arc::new(DeclaredApplicationExceptions::new(["Declined"])),
                default_timeout: AccessTimeout::INDEFINITE,
                invocation_ids: true,
                emit_events: true,
            },
        )
    }

    #[test]
    fn test_success_emits_begin_and_end() {
        let log = EventLog::new();
        let dispatcher = dispatcher(&log);
        let binding = Direct(parking_lot::Mutex::new(0));

        let response = dispatcher.dispatch(&binding, CallRequest::new("add(i64)").arg(5).interface("Ledger"));
        assert_eq!(response.value(), Some(&json!(5)));
        assert_eq!(response.invocation_number, Some(1));

        let records = log.all();
        assert_eq!(records.len(), 2);
        assert!(records[0].event.is_begin());
        assert_eq!(records[0].event.provider_id, "ledger/add(i64)/Ledger");
        assert_eq!(records[1].event.kind, InvocationEventKind::End);
        assert_eq!(records[0].event.number, records[1].event.number);
        assert!(records[0].event.invocation_id.is_some());
    }

    #[test]
    fn test_remote_calls_skip_events() {
        let log = EventLog::new();
        let dispatcher = dispatcher(&log);
        let binding = Direct(parking_lot::Mutex::new(0));

        let response = dispatcher.dispatch(&binding, CallRequest::new("add(i64)").arg(1).remote());
        assert!(response.is_success());
        assert!(log.is_empty());
    }

    #[test]
    fn test_fault_classification() {
        let log = EventLog::new();
        let dispatcher = dispatcher(&log);
        let binding = Direct(parking_lot::Mutex::new(0));

        let declared = dispatcher.dispatch(&binding, CallRequest::new("fail(String)").arg("Declined"));
        assert_matches!(declared.failure(), Some(f) if f.kind == FailureKind::ApplicationFailure);

        let undeclared = dispatcher.dispatch(&binding, CallRequest::new("fail(String)").arg("Crashed"));
        let failure = undeclared.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::SystemFailure);
        assert_eq!(failure.fault.as_ref().map(|f| f.kind.as_str()), Some("Crashed"));

        let stats = log.stats();
        assert_eq!(stats.failed, 2);
    }

    #[test]
    fn test_arity_and_decode_failures_are_system_failures() {
        let log = EventLog::new();
        let dispatcher = dispatcher(&log);
        let binding = Direct(parking_lot::Mutex::new(0));

        let missing = dispatcher.dispatch(&binding, CallRequest::new("add(i64)"));
        assert_matches!(missing.failure(), Some(f) if f.kind == FailureKind::SystemFailure && f.message.contains("takes 1"));

        let wrong_type = dispatcher.dispatch(&binding, CallRequest::new("add(i64)").arg("x"));
        assert_matches!(wrong_type.failure(), Some(f) if f.kind == FailureKind::SystemFailure);
        assert!(!wrong_type.instance_removed);
    }

    #[test]
    fn test_unknown_method_never_reaches_binding() {
        let log = EventLog::new();
        let dispatcher = dispatcher(&log);
        let binding = Direct(parking_lot::Mutex::new(0));

        let response = dispatcher.dispatch(&binding, CallRequest::new("missing()"));
        assert_matches!(response.failure(), Some(f) if f.kind == FailureKind::MethodNotFound);
        assert_eq!(response.invocation_number, None);
        assert!(log.is_empty());
    }

    #[test]
    fn test_panic_poisons_and_restores_context() {
        let log = EventLog::new();
        let dispatcher = dispatcher(&log);
        let binding = Direct(parking_lot::Mutex::new(0));
        let before = InvocationContext::current();

        let response = dispatcher.dispatch(&binding, CallRequest::new("boom()"));
        assert_matches!(response.failure(), Some(f) if f.message.contains("panicked: boom"));
        assert!(response.instance_removed);
        assert_eq!(InvocationContext::current(), before);
    }

    /// Event sink that fails on every `nth` event.
    struct Flaky {
        nth: usize,
        seen: std::sync::atomic::AtomicUsize,
    }

    impl EventDispatcher for Flaky {
        fn dispatch(&self, _event: &InvocationEvent) {
            if (self.seen.fetch_add(1, Ordering::SeqCst) + 1) % self.nth == 0 {
                panic!("event sink unavailable");
            }
        }
    }

    struct Unreachable;

    impl ApplicationExceptionRegistry for Unreachable {
        fn is_application_exception(&self, _fault: &BeanFault) -> bool {
            panic!("registry unavailable")
        }
    }

    #[test]
    fn test_collaborator_panics_stay_contained() {
        let log = EventLog::new();
        let mut dispatcher = dispatcher(&log);
        dispatcher.settings.events = Arc::new(Flaky {
            nth: 2,
            seen: std::sync::atomic::AtomicUsize::new(0),
        });
        dispatcher.settings.exceptions = Arc::new(Unreachable);
        let binding = Direct(parking_lot::Mutex::new(0));
        let before = InvocationContext::current();

        let first = dispatcher.dispatch(&binding, CallRequest::new("add(i64)").arg(2));
        assert_eq!(first.value(), Some(&json!(2)));
        let second = dispatcher.dispatch(&binding, CallRequest::new("add(i64)").arg(3));
        assert_eq!(second.value(), Some(&json!(5)));

        let declined = dispatcher.dispatch(&binding, CallRequest::new("fail(String)").arg("Declined"));
        assert_matches!(declined.failure(), Some(f) if f.kind == FailureKind::SystemFailure);
        assert!(!declined.instance_removed);
        assert_eq!(InvocationContext::current(), before);
    }

    #[test]
    fn test_removal_method_flags_instance_removed() {
        let log = EventLog::new();
        let dispatcher = dispatcher(&log);
        let binding = Direct(parking_lot::Mutex::new(0));

        let response = dispatcher.dispatch(&binding, CallRequest::new("close()"));
        assert!(response.is_success());
        assert!(response.instance_removed);
    }
}
