//! Hook contexts.
//!
//! A context owns the generic replacement installed in place of one
//! method. The replacement snapshots the current closures, releases every
//! lock and then composes the befores, the instead chain (or the original
//! implementation) and the afters.
//!
//! Class-scope contexts keep their closures themselves. Instance-scope
//! contexts live on a dynamic subclass and read the closures from the
//! receiver's associated [`InstanceHooks`].

use crate::error::{Error, Result, internal_error};
use crate::hook::closures::{ClosureSet, InstanceHooks, Interceptor};
use crate::hook::signature::MethodIdentity;
use crate::hook::Mode;
use crate::runtime::invocation::invoke;
use crate::runtime::{Block, BlockCall, Class, Imp, Method, Selector, SignatureDescriptor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Where a context finds its closures.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Scope {
    Class,
    Instance { association_key: usize },
}

/// Lifecycle of a context.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ContextState {
    Uninstalled,
    /// Installed with no closures; only transient for class scope.
    Empty,
    Active,
}

pub(crate) struct HookContext {
    identity: MethodIdentity,
    signature: Arc<SignatureDescriptor>,
    original: Imp,
    replacement: Imp,
    scope: Scope,
    closures: Mutex<ClosureSet>,
    installed: AtomicBool,
}

impl HookContext {
    /// Captures the current implementation and swizzles in the
    /// replacement.
    ///
    /// An inherited method first gets a forwarder in `identity.class`, so
    /// the swizzle never touches the superclass.
    pub(crate) fn install(
        identity: MethodIdentity,
        signature: Arc<SignatureDescriptor>,
        scope: Scope,
    ) -> Result<Arc<Self>> {
        let class = identity.class.clone();
        let selector = identity.selector;
        let original = match class.method_without_super(&selector) {
            Some(method) => method.imp,
            None => add_super_forwarder(&class, selector)?,
        };

        let context = Arc::new_cyclic(|weak: &Weak<HookContext>| {
            let weak = weak.clone();
            let fallback = original.clone();
            let replacement = Block::opaque(move |call| match weak.upgrade() {
                Some(context) => context.dispatch(call),
                // SAFETY: the replacement is called with the method's slots.
                None => unsafe { call_through(&fallback, call) },
            });
            HookContext {
                identity,
                signature,
                original,
                replacement: Imp::Block(replacement),
                scope,
                closures: Mutex::new(ClosureSet::default()),
                installed: AtomicBool::new(false),
            }
        });

        let previous = class.swizzle_method(&selector, context.replacement.clone())?;
        if !previous.ptr_eq(&context.original) {
            // Someone swizzled between the capture and ours.
            class.swizzle_method(&selector, previous)?;
            return Err(internal_error!());
        }
        context.installed.store(true, Ordering::SeqCst);
        oxhook_log::debug!("installed hook context for {}", context.identity);
        Ok(context)
    }

    pub(crate) fn identity(&self) -> &MethodIdentity {
        &self.identity
    }

    pub(crate) fn signature(&self) -> &Arc<SignatureDescriptor> {
        &self.signature
    }

    pub(crate) fn scope(&self) -> Scope {
        self.scope
    }

    /// Appends a class-scope closure.
    pub(crate) fn append(&self, mode: Mode, interceptor: Interceptor) {
        self.closures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(mode, interceptor);
    }

    /// Removes the most recent occurrence of `block`.
    ///
    /// # Errors
    ///
    /// `InternalError` if the closure is not installed here.
    pub(crate) fn remove(&self, mode: Mode, block: &Block) -> Result<Interceptor> {
        self.closures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(mode, block)
            .ok_or_else(|| internal_error!())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.closures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub(crate) fn state(&self) -> ContextState {
        if !self.installed.load(Ordering::SeqCst) {
            ContextState::Uninstalled
        } else if self.scope == Scope::Class && self.is_empty() {
            ContextState::Empty
        } else {
            ContextState::Active
        }
    }

    /// Returns `true` if the method still runs our replacement, i.e. no
    /// one swizzled it after us.
    pub(crate) fn is_still_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
            && self
                .identity
                .class
                .method_without_super(&self.identity.selector)
                .is_some_and(|method| method.imp.ptr_eq(&self.replacement))
    }

    /// Puts the original implementation back.
    ///
    /// # Errors
    ///
    /// `InternalError` if the replacement is no longer installed.
    pub(crate) fn restore(&self) -> Result<()> {
        if !self.is_still_installed() {
            return Err(internal_error!());
        }
        let class = &self.identity.class;
        let selector = &self.identity.selector;
        let previous = class.swizzle_method(selector, self.original.clone())?;
        if !previous.ptr_eq(&self.replacement) {
            class.swizzle_method(selector, previous)?;
            return Err(internal_error!());
        }
        self.installed.store(false, Ordering::SeqCst);
        oxhook_log::debug!("restored original implementation of {}", self.identity);
        Ok(())
    }

    fn closures_for(&self, call: &BlockCall<'_>) -> Result<ClosureSet> {
        match self.scope {
            Scope::Class => Ok(self
                .closures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()),
            Scope::Instance { association_key } => {
                let Some(receiver) = call.object_argument(0)? else {
                    return Ok(ClosureSet::default());
                };
                Ok(receiver
                    .associated::<InstanceHooks>(association_key)
                    .map(|hooks| hooks.snapshot(self.identity.selector))
                    .unwrap_or_default())
            }
        }
    }

    fn dispatch(&self, call: &mut BlockCall<'_>) {
        let closures = match self.closures_for(call) {
            Ok(closures) => closures,
            Err(err) => {
                oxhook_log::error!("{}: reading hook closures failed: {err}", self.identity);
                ClosureSet::default()
            }
        };
        // SAFETY: the replacement is called with the method's slots.
        let result = unsafe {
            closures.run(
                &self.signature,
                &self.original,
                call.raw_arguments(),
                call.raw_return(),
            )
        };
        if let Err(err) = result {
            oxhook_log::error!("{}: hooked call failed: {err}", self.identity);
        }
    }
}

impl Drop for HookContext {
    fn drop(&mut self) {
        if self.is_still_installed() {
            oxhook_log::debug!(
                "hook context for {} dropped while installed; calls pass through",
                self.identity
            );
        }
    }
}

/// Adds a method to `class` that resolves the superclass implementation on
/// every call.
fn add_super_forwarder(class: &Class, selector: Selector) -> Result<Imp> {
    let inherited = class
        .lookup_method(&selector)
        .ok_or_else(|| Error::NoRespondingMethod {
            class: class.name().to_string(),
            selector: selector.name().to_string(),
        })?;
    let super_class = class.super_class().ok_or_else(|| internal_error!())?;

    let forwarder = Imp::Block(Block::opaque(move |call| {
        match super_class.lookup_imp(&selector) {
            // SAFETY: the forwarder is called with the method's slots.
            Some(imp) => unsafe { call_through(&imp, call) },
            None => oxhook_log::error!("{super_class} no longer responds to {selector}"),
        }
    }));
    class.add_method(Method::new(selector, forwarder.clone(), &inherited.types))?;
    oxhook_log::debug!("added super forwarder for {selector} to {class}");
    Ok(forwarder)
}

/// Calls `imp` with the slots of `call`.
///
/// # Safety
///
/// The slots of `call` must match the signature `imp` expects.
unsafe fn call_through(imp: &Imp, call: &mut BlockCall<'_>) {
    // SAFETY: forwarded caller contract.
    let result = unsafe { invoke(imp, call.signature(), call.raw_arguments(), call.raw_return()) };
    if let Err(err) = result {
        oxhook_log::error!("forwarding to {imp:?} failed: {err}");
    }
}
