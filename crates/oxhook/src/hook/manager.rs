//! The hook registry.
//!
//! A [`HookManager`] maps each hooked method to its [`HookContext`],
//! installs replacements on first use, wraps instances for single-instance
//! hooks and routes cancellation.
//!
//! # Locking
//!
//! Every mutation happens under the manager's single mutex. User closures
//! never run under it: replacements only take short-lived snapshot locks.
//! Values whose drop may destroy an object (closures, associated closure
//! stores, instances) are released after the mutex, because destruction
//! observers re-enter the manager.

use crate::error::{Error, Result, internal_error};
use crate::hook::Mode;
use crate::hook::closures::{InstanceHooks, Interceptor};
use crate::hook::context::{ContextState, HookContext, Scope};
use crate::hook::dynamic_class::{DynamicClasses, ShadowRecord, Unwrapped};
use crate::hook::signature::{MethodIdentity, SignatureCache, check_compatible, closure_signature};
use crate::hook::token::{CancelOutcome, Token, TokenState, TokenTarget};
use crate::runtime::{Block, Class, Object, Selector, SignatureDescriptor};
use fxhash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

/// Environment variable overriding [`Config::subclass_prefix`].
pub const SUBCLASS_PREFIX_ENV_VAR: &str = "OXHOOK_SUBCLASS_PREFIX";

/// Manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    subclass_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            subclass_prefix: "OxHook_".to_string(),
        }
    }
}

impl Config {
    /// Returns the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from the environment.
    ///
    /// Also initializes the log level from `OXHOOK_LOG`; an unparsable
    /// level is reported and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        if let Err(err) = oxhook_log::init_from_env() {
            oxhook_log::warn!("ignoring {}: {err}", oxhook_log::ENV_VAR);
        }
        let mut config = Config::default();
        if let Ok(prefix) = std::env::var(SUBCLASS_PREFIX_ENV_VAR) {
            if !prefix.is_empty() {
                config.subclass_prefix = prefix;
            }
        }
        config
    }

    /// Sets the name prefix of per-instance subclasses.
    #[must_use]
    pub fn with_subclass_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subclass_prefix = prefix.into();
        self
    }

    /// Returns the name prefix of per-instance subclasses.
    #[must_use]
    pub fn subclass_prefix(&self) -> &str {
        &self.subclass_prefix
    }
}

/// Association keys count down from the top of the key space.
static NEXT_ASSOCIATION_OFFSET: AtomicUsize = AtomicUsize::new(0);

struct ManagerState {
    class_contexts: FxHashMap<MethodIdentity, Arc<HookContext>>,
    /// Contexts installed on per-instance subclasses.
    instance_contexts: FxHashMap<MethodIdentity, Arc<HookContext>>,
    dynamic: DynamicClasses,
    signatures: SignatureCache,
}

pub(crate) struct ManagerInner {
    state: Mutex<ManagerState>,
    config: Config,
    /// Key of the [`InstanceHooks`] stored on hooked instances.
    association_key: usize,
    shared: AtomicBool,
}

/// Registry of hooked methods.
///
/// Handles are cheap to clone; the registry is torn down, restoring every
/// method it still owns, when the last handle is dropped.
///
/// # Example
///
/// ```rust
/// use oxhook::runtime::dispatch::send_message;
/// use oxhook::{Block, Class, HookManager, Method, Mode, Object, Selector};
///
/// let class = Class::new_root("ManagerDoc").unwrap();
/// let sel = Selector::new("value").unwrap();
/// class
///     .add_method(Method::new(
///         sel,
///         Block::opaque(|call| call.set_return_value(1i64).unwrap()),
///         "q@:",
///     ))
///     .unwrap();
///
/// let manager = HookManager::new();
/// let doubled = Block::new("q@?<q@:>@:", |call| {
///     let mut original = call.forward(0).unwrap();
///     original.invoke().unwrap();
///     let value: i64 = original.return_value().unwrap();
///     call.set_return_value(value * 2).unwrap();
/// })
/// .unwrap();
/// let token = manager.hook_class(&class, &sel, Mode::Instead, doubled).unwrap();
///
/// let obj = Object::new(&class).unwrap();
/// assert_eq!(send_message::<i64>(&obj, &sel, &[]).unwrap(), 2);
/// token.cancel().unwrap();
/// assert_eq!(send_message::<i64>(&obj, &sel, &[]).unwrap(), 1);
/// ```
#[derive(Clone)]
pub struct HookManager {
    inner: Arc<ManagerInner>,
}

static SHARED: OnceLock<HookManager> = OnceLock::new();

impl HookManager {
    /// Creates a manager with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a manager.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        let offset = NEXT_ASSOCIATION_OFFSET.fetch_add(1, Ordering::Relaxed);
        let association_key = usize::MAX - offset;
        HookManager {
            inner: Arc::new(ManagerInner {
                state: Mutex::new(ManagerState {
                    class_contexts: FxHashMap::default(),
                    instance_contexts: FxHashMap::default(),
                    dynamic: DynamicClasses::new(config.subclass_prefix(), association_key),
                    signatures: SignatureCache::default(),
                }),
                config,
                association_key,
                shared: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the process-wide manager, configured from the environment
    /// on first use.
    pub fn shared() -> &'static HookManager {
        SHARED.get_or_init(|| {
            let manager = HookManager::with_config(Config::from_env());
            manager.inner.shared.store(true, Ordering::Relaxed);
            manager
        })
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        HookManager { inner }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn token(&self, target: TokenTarget, closure: Block, mode: Mode, selector: Selector) -> Token {
        Token::new(TokenState {
            manager: Arc::downgrade(&self.inner),
            target,
            closure,
            mode,
            selector,
            observer: Mutex::new(None),
            canceled: AtomicBool::new(false),
        })
    }

    /// Hooks `selector` for every instance of `class` (and of subclasses
    /// that inherit the method).
    ///
    /// # Errors
    ///
    /// - `NoRespondingMethod` if instances of `class` do not respond
    /// - `MissingSignature` / `IncompatibleClosureSignature` for unusable
    ///   closures
    pub fn hook_class(
        &self,
        class: &Class,
        selector: &Selector,
        mode: Mode,
        closure: Block,
    ) -> Result<Token> {
        let identity = MethodIdentity::new(class.clone(), *selector);
        let mut state = self.lock();
        let method_signature = state.signatures.method_signature(&identity)?;
        let closure_signature = closure_signature(&closure)?;
        check_compatible(&method_signature, mode, &closure_signature)?;

        let context = match state.class_contexts.get(&identity) {
            Some(context) => Arc::clone(context),
            None => {
                let context =
                    HookContext::install(identity.clone(), method_signature, Scope::Class)?;
                state.class_contexts.insert(identity.clone(), Arc::clone(&context));
                context
            }
        };
        context.append(
            mode,
            Interceptor {
                block: closure.clone(),
                signature: closure_signature,
            },
        );
        oxhook_log::debug!("hooked {identity} ({mode})");

        Ok(self.token(
            TokenTarget::Class {
                context: Arc::downgrade(&context),
            },
            closure,
            mode,
            *selector,
        ))
    }

    /// Hooks the class method `selector` of `class`.
    ///
    /// # Errors
    ///
    /// Same as [`HookManager::hook_class`]; `NoRespondingMethod` when
    /// `class` is a metaclass.
    pub fn hook_class_method(
        &self,
        class: &Class,
        selector: &Selector,
        mode: Mode,
        closure: Block,
    ) -> Result<Token> {
        let metaclass = class.metaclass().ok_or_else(|| Error::NoRespondingMethod {
            class: class.name().to_string(),
            selector: selector.name().to_string(),
        })?;
        self.hook_class(&metaclass, selector, mode, closure)
    }

    /// Hooks `selector` on `instance` only.
    ///
    /// The instance is moved into a private subclass on its first hook and
    /// back when its last hook is canceled. Hooks are canceled
    /// automatically when the instance is destroyed.
    ///
    /// # Errors
    ///
    /// - `CanNotHookClassWithObjectApi` for class objects
    /// - `UnsupportedHookPureObjectDealloc` when hooking `dealloc` on an
    ///   instance whose class hierarchy does not implement it
    /// - `InstanceHookedByAnotherManager` while another manager has hooks
    ///   on the instance
    /// - the errors of [`HookManager::hook_class`]
    pub fn hook_object(
        &self,
        instance: &Object,
        selector: &Selector,
        mode: Mode,
        closure: Block,
    ) -> Result<Token> {
        if instance.is_class_object() {
            return Err(Error::CanNotHookClassWithObjectApi);
        }
        if selector.is_dealloc() && !instance.responds_to(selector) {
            return Err(Error::UnsupportedHookPureObjectDealloc);
        }
        let key = self.inner.association_key;

        let token = {
            let mut state = self.lock();
            let class = instance.class();
            let method_signature = state
                .signatures
                .method_signature(&MethodIdentity::new(class.clone(), *selector))?;
            let closure_signature = closure_signature(&closure)?;
            check_compatible(&method_signature, mode, &closure_signature)?;

            let (subclass, wrapped_now) = match state.dynamic.subclass_of(instance) {
                Some(subclass) => (subclass, false),
                None => (state.dynamic.wrap(instance)?, true),
            };
            let identity = MethodIdentity::new(subclass, *selector);
            let context = match state.instance_contexts.get(&identity) {
                Some(context) => Arc::clone(context),
                None => match HookContext::install(
                    identity.clone(),
                    method_signature,
                    Scope::Instance {
                        association_key: key,
                    },
                ) {
                    Ok(context) => {
                        state.instance_contexts.insert(identity.clone(), Arc::clone(&context));
                        context
                    }
                    Err(err) => {
                        if wrapped_now {
                            state.dynamic.unwrap(instance)?;
                        }
                        return Err(err);
                    }
                },
            };
            debug_assert_eq!(context.state(), ContextState::Active);

            let hooks = match instance.associated::<InstanceHooks>(key) {
                Some(hooks) => hooks,
                None => {
                    let hooks = Arc::new(InstanceHooks::default());
                    instance.set_associated(key, hooks.clone());
                    hooks
                }
            };
            hooks.append(
                *selector,
                mode,
                Interceptor {
                    block: closure.clone(),
                    signature: closure_signature,
                },
            );
            oxhook_log::debug!("hooked {identity} on instance {:#x} ({mode})", instance.id());

            self.token(
                TokenTarget::Instance {
                    object: instance.downgrade(),
                },
                closure,
                mode,
                *selector,
            )
        };

        let token_state = Arc::clone(&token.state);
        let observer = instance.on_dealloc(move |object| {
            let Some(inner) = token_state.manager.upgrade() else {
                return;
            };
            match HookManager::from_inner(inner).cancel_instance(&token_state, object) {
                Ok(outcome) => oxhook_log::trace!(
                    "canceled {} hook on destroyed instance: {outcome:?}",
                    token_state.selector
                ),
                Err(err) => oxhook_log::error!(
                    "canceling {} hook on destroyed instance failed: {err}",
                    token_state.selector
                ),
            }
        });
        *token
            .state
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
        Ok(token)
    }

    /// Cancels the hook `token` stands for.
    ///
    /// # Errors
    ///
    /// `InternalError` if `token` belongs to another manager or the
    /// bookkeeping is inconsistent.
    pub fn cancel(&self, token: &Token) -> Result<CancelOutcome> {
        let state = &token.state;
        if !std::ptr::eq(state.manager.as_ptr(), Arc::as_ptr(&self.inner)) {
            return Err(internal_error!());
        }
        match &state.target {
            TokenTarget::Class { context } => {
                if state.mark_canceled() {
                    return Ok(CancelOutcome::AlreadyCanceled);
                }
                let Some(context) = context.upgrade() else {
                    return Ok(CancelOutcome::AlreadyCanceled);
                };
                self.cancel_class(state, &context)
            }
            TokenTarget::Instance { object } => {
                let Some(instance) = object.upgrade() else {
                    return Ok(CancelOutcome::AlreadyCanceled);
                };
                let outcome = self.cancel_instance(state, &instance);
                let observer = state
                    .observer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(observer) = observer {
                    instance.remove_dealloc_observer(observer);
                }
                outcome
            }
        }
    }

    fn cancel_class(&self, token: &TokenState, context: &HookContext) -> Result<CancelOutcome> {
        let mut state = self.lock();
        let removed = context.remove(token.mode, &token.closure)?;
        let outcome = if !context.is_empty() {
            CancelOutcome::NotRestored
        } else if !context.is_still_installed() {
            oxhook_log::warn!(
                "{} was swizzled by someone else; keeping its hook context",
                context.identity()
            );
            CancelOutcome::NotRestored
        } else {
            context.restore()?;
            state.class_contexts.remove(context.identity());
            CancelOutcome::Restored
        };
        drop(state);
        drop(removed);
        oxhook_log::debug!("canceled {} hook: {outcome:?}", token.selector);
        Ok(outcome)
    }

    /// Removes an instance closure; unwraps the instance once it has no
    /// closures left.
    fn cancel_instance(&self, token: &TokenState, instance: &Object) -> Result<CancelOutcome> {
        if token.mark_canceled() {
            return Ok(CancelOutcome::AlreadyCanceled);
        }
        let key = self.inner.association_key;
        let mut state = self.lock();
        let hooks = instance
            .associated::<InstanceHooks>(key)
            .ok_or_else(|| internal_error!())?;
        let removed = hooks
            .remove(token.selector, token.mode, &token.closure)
            .ok_or_else(|| internal_error!())?;
        if !hooks.is_empty() {
            drop(state);
            drop(removed);
            return Ok(CancelOutcome::NotRestored);
        }

        let record = match state.dynamic.unwrap(instance)? {
            Unwrapped::Restored(record) => record,
            Unwrapped::Reclassed => {
                drop(state);
                drop(removed);
                oxhook_log::warn!(
                    "instance {:#x} was re-classed by someone else; leaving it wrapped",
                    instance.id()
                );
                self.release_when_destroyed(instance);
                return Ok(CancelOutcome::NotRestored);
            }
        };
        let (contexts, association) = Self::discard_instance(&mut state, instance, &record, key);
        drop(state);
        drop((removed, hooks, association, contexts, record));
        oxhook_log::debug!("canceled last hook on instance {:#x}", instance.id());
        Ok(CancelOutcome::Restored)
    }

    /// Removes the contexts of an unwrapped instance's subclass and the
    /// instance's closure store. The caller drops both after unlocking.
    fn discard_instance(
        state: &mut ManagerState,
        instance: &Object,
        record: &ShadowRecord,
        key: usize,
    ) -> (Vec<Arc<HookContext>>, Option<crate::runtime::Associated>) {
        let stale: Vec<MethodIdentity> = state
            .instance_contexts
            .keys()
            .filter(|identity| identity.class == record.subclass)
            .cloned()
            .collect();
        let contexts = stale
            .iter()
            .filter_map(|identity| state.instance_contexts.remove(identity))
            .collect();
        (contexts, instance.remove_associated(key))
    }

    /// Drops the bookkeeping of a re-classed instance once it is destroyed.
    fn release_when_destroyed(&self, instance: &Object) {
        let manager = Arc::downgrade(&self.inner);
        instance.on_dealloc(move |object| {
            let Some(inner) = manager.upgrade() else {
                return;
            };
            let manager = HookManager::from_inner(inner);
            let key = manager.inner.association_key;
            let mut state = manager.lock();
            let hooked = object
                .associated::<InstanceHooks>(key)
                .is_some_and(|hooks| !hooks.is_empty());
            if hooked || state.dynamic.subclass_of(object).is_none() {
                return;
            }
            match state.dynamic.unwrap(object) {
                Ok(Unwrapped::Restored(record)) => {
                    let garbage = Self::discard_instance(&mut state, object, &record, key);
                    drop(state);
                    drop((garbage, record));
                }
                Ok(Unwrapped::Reclassed) => {}
                Err(err) => oxhook_log::error!("releasing a destroyed instance failed: {err}"),
            }
        });
    }

    /// Number of class-scope contexts.
    #[must_use]
    pub fn class_context_count(&self) -> usize {
        self.lock().class_contexts.len()
    }

    /// Number of contexts installed on per-instance subclasses.
    #[must_use]
    pub fn dynamic_context_count(&self) -> usize {
        self.lock().instance_contexts.len()
    }

    /// Number of currently wrapped instances.
    #[must_use]
    pub fn dynamic_class_count(&self) -> usize {
        self.lock().dynamic.len()
    }

    /// Returns `true` if `class` is a per-instance subclass created by
    /// this manager.
    #[must_use]
    pub fn is_dynamic_class(&self, class: &Class) -> bool {
        self.lock().dynamic.is_dynamic(class)
    }

    /// Returns the decoded signature of the method `selector` resolves to
    /// on `class`.
    ///
    /// # Errors
    ///
    /// `NoRespondingMethod`, or an encoding error.
    pub fn method_signature(
        &self,
        class: &Class,
        selector: &Selector,
    ) -> Result<Arc<SignatureDescriptor>> {
        self.lock()
            .signatures
            .method_signature(&MethodIdentity::new(class.clone(), *selector))
    }
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HookManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("HookManager")
            .field("config", &self.inner.config)
            .field("class_contexts", &state.class_contexts.len())
            .field("instance_contexts", &state.instance_contexts.len())
            .field("wrapped_instances", &state.dynamic.len())
            .finish()
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let key = self.association_key;
        let shared = self.shared.load(Ordering::Relaxed);
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if shared {
            return;
        }

        for (identity, context) in state.class_contexts.drain() {
            if context.is_still_installed() {
                if let Err(err) = context.restore() {
                    oxhook_log::warn!("could not restore {identity}: {err}");
                }
            } else {
                oxhook_log::warn!("leaving {identity} hooked: swizzled by someone else");
            }
        }

        let contexts: Vec<_> = state.instance_contexts.drain().collect();
        for record in state.dynamic.drain() {
            if record.is_reclassed() {
                oxhook_log::warn!("leaving {} in place: its instance was re-classed", record.subclass);
                continue;
            }
            if let Some(instance) = record.release_instance() {
                drop(instance.remove_associated(key));
            }
            if let Err(err) = record.subclass.dispose() {
                oxhook_log::warn!("could not dispose {}: {err}", record.subclass);
            }
        }
        drop(contexts);
    }
}
