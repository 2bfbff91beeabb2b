//! Thread-scoped invocation context.
//!
//! Each thread carries the context of the component code it is running:
//! the component's class loader, the business interface the call came in
//! through, the kind of container work in progress and the correlation id
//! of the current invocation. The dispatcher swaps it in around every
//! call and lifecycle callback through the scope guards below, which
//! restore the previous value on every exit path, unwinding included.

use std::cell::RefCell;

use container_core::types::{ClassLoaderHandle, InvocationId, OperationState};

thread_local! {
    static CURRENT: RefCell<InvocationContext> = RefCell::new(InvocationContext::default());
}

/// Context visible to component code running on this thread.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvocationContext {
    /// Loader of the component whose code is running.
    pub class_loader: Option<ClassLoaderHandle>,

    /// Business interface the call arrived through.
    pub interface: Option<String>,

    /// What container work is in progress.
    pub operation: OperationState,

    /// Correlation id of the current invocation.
    pub invocation_id: Option<InvocationId>,
}

impl InvocationContext {
    /// Snapshot of this thread's context.
    pub fn current() -> Self {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Context for a business method call. The invocation id is inherited
    /// from the calling code.
    pub fn business_call(class_loader: ClassLoaderHandle, interface: Option<String>) -> Self {
        Self {
            class_loader: Some(class_loader),
            interface,
            operation: OperationState::BusinessMethod,
            invocation_id: current_invocation_id(),
        }
    }

    /// Context for a lifecycle callback such as construction or
    /// destruction.
    pub fn lifecycle(class_loader: ClassLoaderHandle, operation: OperationState) -> Self {
        Self {
            class_loader: Some(class_loader),
            interface: None,
            operation,
            invocation_id: current_invocation_id(),
        }
    }
}

fn current_invocation_id() -> Option<InvocationId> {
    CURRENT.with(|current| current.borrow().invocation_id)
}

/// Install `context` on this thread and return the one it replaced.
pub fn enter(context: InvocationContext) -> InvocationContext {
    CURRENT.with(|current| current.replace(context))
}

/// Put back a context returned by [`enter`].
pub fn restore(previous: InvocationContext) {
    CURRENT.with(|current| {
        *current.borrow_mut() = previous;
    });
}

/// Installs a context for its lifetime.
#[must_use = "the context is restored as soon as the scope is dropped"]
pub struct ContextScope {
    previous: Option<InvocationContext>,
}

impl ContextScope {
    /// Install `context`, remembering the current one.
    pub fn enter(context: InvocationContext) -> Self {
        Self {
            previous: Some(enter(context)),
        }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            restore(previous);
        }
    }
}

/// Pushes a fresh invocation id for its lifetime.
///
/// The new id's parent is the id current at creation, so nested calls
/// form a chain that unwinds in order.
#[must_use = "the previous invocation id is restored as soon as the scope is dropped"]
pub struct InvocationIdScope {
    previous: Option<InvocationId>,
    current: InvocationId,
}

impl InvocationIdScope {
    /// Push a new id.
    pub fn new_invocation() -> Self {
        CURRENT.with(|cell| {
            let mut context = cell.borrow_mut();
            let previous = context.invocation_id;
            let current = previous.map_or_else(InvocationId::root, |parent| parent.child());
            context.invocation_id = Some(current);
            Self { previous, current }
        })
    }

    /// The pushed id.
    pub fn id(&self) -> InvocationId {
        self.current
    }
}

impl Drop for InvocationIdScope {
    fn drop(&mut self) {
        let previous = self.previous;
        CURRENT.with(|cell| cell.borrow_mut().invocation_id = previous);
    }
}
