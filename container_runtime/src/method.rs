//! Method tables of components.
//!
//! A component's business methods are registered once, when the component
//! is built, as closures keyed by the hash of their signature. Each entry
//! carries the concurrency metadata the dispatcher needs: access timeout,
//! lock type, arity and removal behavior.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use container_core::error::InvocationError;
use container_core::fault::InvokeFailure;
use container_core::types::{
    AccessTimeout, CallerIdentity, ComponentKind, ConcurrencyManagement, IdentityKey, LockType,
    MethodHash,
};

use crate::context::InvocationContext;

/// Result of a business method.
pub type MethodResult = Result<Value, InvokeFailure>;

/// Business method that mutates its bean.
pub type ExclusiveFn<B> = dyn Fn(&mut B, &mut Invocation<'_>) -> MethodResult + Send + Sync;

/// Business method that only reads its bean.
pub type SharedFn<B> = dyn Fn(&B, &mut Invocation<'_>) -> MethodResult + Send + Sync;

/// Callable body of a business method.
pub enum Handler<B> {
    /// Needs `&mut B`.
    Exclusive(Arc<ExclusiveFn<B>>),

    /// Works on `&B`; required wherever calls may overlap.
    Shared(Arc<SharedFn<B>>),
}

impl<B> Clone for Handler<B> {
    fn clone(&self) -> Self {
        match self {
            Self::Exclusive(f) => Self::Exclusive(f.clone()),
            Self::Shared(f) => Self::Shared(f.clone()),
        }
    }
}

/// Bean access handed to a handler.
pub enum BeanRef<'a, B> {
    /// Other calls may be reading the bean concurrently.
    Shared(&'a B),

    /// This call owns the bean.
    Exclusive(&'a mut B),
}

impl<B> Handler<B> {
    /// Run the handler against `bean`.
    pub fn call(&self, bean: BeanRef<'_, B>, invocation: &mut Invocation<'_>) -> MethodResult {
        match (self, bean) {
            (Self::Exclusive(f), BeanRef::Exclusive(bean)) => f(bean, invocation),
            (Self::Shared(f), BeanRef::Exclusive(bean)) => f(bean, invocation),
            (Self::Shared(f), BeanRef::Shared(bean)) => f(bean, invocation),
            (Self::Exclusive(_), BeanRef::Shared(_)) => Err(InvokeFailure::IllegalAccess(
                "method needs exclusive access but was granted shared access".to_string(),
            )),
        }
    }

    /// Whether this handler only reads the bean.
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }
}

/// One business method of a component.
pub struct MethodDescriptor<B> {
    /// Hash of `signature`.
    pub hash: MethodHash,

    /// Signature as callers name it, e.g. `deposit(u64)`.
    pub signature: String,

    /// The method body.
    pub handler: Handler<B>,

    /// Overrides the component's default access timeout.
    pub access_timeout: Option<AccessTimeout>,

    /// Lock taken on singletons.
    pub lock_type: LockType,

    /// Number of arguments the method takes.
    pub arity: usize,

    /// Whether a call ends the instance's life (stateful only).
    pub removes: bool,

    /// Keep the instance when a removing call fails with an application
    /// exception.
    pub retain_if_exception: bool,
}

impl<B> MethodDescriptor<B> {
    /// Describe a method that mutates its bean.
    pub fn exclusive<F>(signature: impl Into<String>, arity: usize, handler: F) -> Self
    where
        F: Fn(&mut B, &mut Invocation<'_>) -> MethodResult + Send + Sync + 'static,
    {
        Self::with_handler(signature.into(), arity, Handler::Exclusive(Arc::new(handler)))
    }

    /// Describe a method that only reads its bean.
    pub fn shared<F>(signature: impl Into<String>, arity: usize, handler: F) -> Self
    where
        F: Fn(&B, &mut Invocation<'_>) -> MethodResult + Send + Sync + 'static,
    {
        Self::with_handler(signature.into(), arity, Handler::Shared(Arc::new(handler)))
    }

    fn with_handler(signature: String, arity: usize, handler: Handler<B>) -> Self {
        Self {
            hash: MethodHash::of(&signature),
            signature,
            handler,
            access_timeout: None,
            lock_type: LockType::default(),
            arity,
            removes: false,
            retain_if_exception: false,
        }
    }

    /// Set the access timeout.
    pub fn access_timeout(mut self, timeout: AccessTimeout) -> Self {
        self.access_timeout = Some(timeout);
        self
    }

    /// Set the singleton lock type.
    pub fn lock(mut self, lock_type: LockType) -> Self {
        self.lock_type = lock_type;
        self
    }

    /// Mark as a removal method.
    pub fn removes(mut self, retain_if_exception: bool) -> Self {
        self.removes = true;
        self.retain_if_exception = retain_if_exception;
        self
    }
}

impl<B> fmt::Debug for MethodDescriptor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("hash", &self.hash)
            .field("signature", &self.signature)
            .field("shared", &self.handler.is_shared())
            .field("access_timeout", &self.access_timeout)
            .field("lock_type", &self.lock_type)
            .field("arity", &self.arity)
            .field("removes", &self.removes)
            .finish()
    }
}

/// Immutable method table of a component.
#[derive(Debug)]
pub struct MethodTable<B> {
    methods: HashMap<MethodHash, MethodDescriptor<B>>,
}

impl<B> MethodTable<B> {
    /// Look up a method.
    pub fn get(&self, hash: MethodHash) -> Option<&MethodDescriptor<B>> {
        self.methods.get(&hash)
    }

    /// Number of methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Signatures of all methods.
    pub fn signatures(&self) -> impl Iterator<Item = &str> {
        self.methods.values().map(|method| method.signature.as_str())
    }
}

/// Collects and validates the methods of one component.
pub struct MethodTableBuilder<B> {
    kind: ComponentKind,
    management: ConcurrencyManagement,
    methods: Vec<MethodDescriptor<B>>,
}

impl<B> MethodTableBuilder<B> {
    /// Start a table for a component of `kind`.
    pub fn new(kind: ComponentKind, management: ConcurrencyManagement) -> Self {
        Self {
            kind,
            management,
            methods: Vec::new(),
        }
    }

    /// Add a method.
    pub fn method(mut self, method: MethodDescriptor<B>) -> Self {
        self.methods.push(method);
        self
    }

    /// Add a method in place.
    pub fn push(&mut self, method: MethodDescriptor<B>) {
        self.methods.push(method);
    }

    /// Validate and freeze the table.
    pub fn build(self) -> Result<MethodTable<B>, InvocationError> {
        let mut methods: HashMap<MethodHash, MethodDescriptor<B>> =
            HashMap::with_capacity(self.methods.len());
        for method in self.methods {
            check(self.kind, self.management, &method)?;
            if let Some(existing) = methods.get(&method.hash) {
                return Err(InvocationError::InvalidDescriptor(format!(
                    "{} and {} share hash {}",
                    existing.signature, method.signature, method.hash
                )));
            }
            methods.insert(method.hash, method);
        }
        Ok(MethodTable { methods })
    }
}

fn check<B>(
    kind: ComponentKind,
    management: ConcurrencyManagement,
    method: &MethodDescriptor<B>,
) -> Result<(), InvocationError> {
    let shared = method.handler.is_shared();
    if kind == ComponentKind::Singleton && !shared {
        if management == ConcurrencyManagement::Bean {
            return Err(InvocationError::InvalidDescriptor(format!(
                "{}: bean-managed singleton methods must take a shared handler",
                method.signature
            )));
        }
        if method.lock_type == LockType::Read {
            return Err(InvocationError::InvalidDescriptor(format!(
                "{}: read-locked methods must take a shared handler",
                method.signature
            )));
        }
    }
    if method.removes && kind != ComponentKind::Stateful {
        return Err(InvocationError::InvalidDescriptor(format!(
            "{}: only stateful components have removal methods",
            method.signature
        )));
    }
    Ok(())
}

/// Argument of every handler: the call's inputs and its view of the
/// container.
pub struct Invocation<'a> {
    args: &'a [Value],
    identity: Option<IdentityKey>,
    caller: &'a CallerIdentity,
    remove_requested: bool,
}

impl<'a> Invocation<'a> {
    /// Create the handler argument for one call.
    pub fn new(args: &'a [Value], identity: Option<IdentityKey>, caller: &'a CallerIdentity) -> Self {
        Self {
            args,
            identity,
            caller,
            remove_requested: false,
        }
    }

    /// Raw arguments.
    pub fn args(&self) -> &[Value] {
        self.args
    }

    /// Decode argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, InvokeFailure> {
        let value = self.args.get(index).ok_or_else(|| {
            InvokeFailure::IllegalArgument(format!("missing argument {}", index))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| InvokeFailure::IllegalArgument(format!("argument {}: {}", index, e)))
    }

    /// Identity of the instance being called, for stateful components.
    pub fn identity(&self) -> Option<IdentityKey> {
        self.identity
    }

    /// Who is calling.
    pub fn caller(&self) -> &CallerIdentity {
        self.caller
    }

    /// The thread's container context.
    pub fn context(&self) -> InvocationContext {
        InvocationContext::current()
    }

    /// End this instance's life once the call returns.
    pub fn remove_instance(&mut self) {
        self.remove_requested = true;
    }

    /// Whether `remove_instance` was called.
    pub fn removal_requested(&self) -> bool {
        self.remove_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn get(_: &u32, inv: &mut Invocation<'_>) -> MethodResult {
        Ok(json!(inv.args().len()))
    }

    #[test]
    fn test_rejects_duplicate_signature() {
        let result = MethodTableBuilder::<u32>::new(ComponentKind::Stateless, ConcurrencyManagement::Container)
            .method(MethodDescriptor::shared("get()", 0, get))
            .method(MethodDescriptor::shared("get()", 0, get))
            .build();
        assert_matches!(result, Err(InvocationError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_read_lock_requires_shared_handler() {
        let result = MethodTableBuilder::<u32>::new(ComponentKind::Singleton, ConcurrencyManagement::Container)
            .method(MethodDescriptor::exclusive("bump()", 0, |n, _| {
                *n += 1;
                Ok(json!(*n))
            })
            .lock(LockType::Read))
            .build();
        assert_matches!(result, Err(InvocationError::InvalidDescriptor(msg)) if msg.contains("read-locked"));
    }

    #[test]
    fn test_removes_only_on_stateful() {
        let method = || MethodDescriptor::<u32>::exclusive("close()", 0, |_, _| Ok(Value::Null)).removes(false);
        assert!(MethodTableBuilder::new(ComponentKind::Stateful, ConcurrencyManagement::Container)
            .method(method())
            .build()
            .is_ok());
        assert!(MethodTableBuilder::new(ComponentKind::Stateless, ConcurrencyManagement::Container)
            .method(method())
            .build()
            .is_err());
    }

    #[test]
    fn test_typed_arguments() {
        let args = vec![json!(5), json!("five")];
        let caller = CallerIdentity::anonymous();
        let invocation = Invocation::new(&args, None, &caller);

        assert_eq!(invocation.arg::<u64>(0).unwrap(), 5);
        assert_eq!(invocation.arg::<String>(1).unwrap(), "five");
        assert_matches!(invocation.arg::<u64>(1), Err(InvokeFailure::IllegalArgument(_)));
        assert_matches!(invocation.arg::<u64>(2), Err(InvokeFailure::IllegalArgument(msg)) if msg.contains("missing"));
    }

    #[test]
    fn test_exclusive_handler_refuses_shared_bean() {
        let handler: Handler<u32> = Handler::Exclusive(Arc::new(
            |n: &mut u32, _: &mut Invocation<'_>| -> MethodResult { Ok(json!(*n)) },
        ));
        let caller = CallerIdentity::anonymous();
        let mut invocation = Invocation::new(&[], None, &caller);
        assert_matches!(
            handler.call(BeanRef::Shared(&1), &mut invocation),
            Err(InvokeFailure::IllegalAccess(_))
        );
    }
}
