//! Cancellation tokens.

use crate::error::Result;
use crate::hook::Mode;
use crate::hook::context::HookContext;
use crate::hook::manager::{HookManager, ManagerInner};
use crate::runtime::{Block, Selector, WeakObject};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Result of canceling a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelOutcome {
    /// The closure was removed and the original implementation (or the
    /// instance's original class) is back in place.
    Restored,
    /// The closure was removed, but the replacement stays because other
    /// closures still use it or because someone else swizzled the method
    /// after us.
    NotRestored,
    /// The token was canceled before, or its target is gone.
    AlreadyCanceled,
}

pub(crate) enum TokenTarget {
    Class { context: Weak<HookContext> },
    Instance { object: WeakObject },
}

pub(crate) struct TokenState {
    pub(crate) manager: Weak<ManagerInner>,
    pub(crate) target: TokenTarget,
    pub(crate) closure: Block,
    pub(crate) mode: Mode,
    pub(crate) selector: Selector,
    /// Destruction observer registered on a hooked instance.
    pub(crate) observer: Mutex<Option<u64>>,
    pub(crate) canceled: AtomicBool,
}

impl TokenState {
    /// Marks the token canceled, returning `true` if it already was.
    pub(crate) fn mark_canceled(&self) -> bool {
        self.canceled.swap(true, Ordering::SeqCst)
    }
}

/// Handle to one installed closure.
///
/// Dropping a token does not cancel the hook.
///
/// # Example
///
/// ```rust
/// use oxhook::{Block, CancelOutcome, Class, HookManager, Method, Mode, Object, Selector};
///
/// let class = Class::new_root("TokenDoc").unwrap();
/// let sel = Selector::new("ping").unwrap();
/// class.add_method(Method::new(sel, Block::opaque(|_| {}), "v@:")).unwrap();
///
/// let manager = HookManager::new();
/// let token = manager
///     .hook_class(&class, &sel, Mode::After, Block::new("v@", |_| {}).unwrap())
///     .unwrap();
/// assert_eq!(token.cancel().unwrap(), CancelOutcome::Restored);
/// assert_eq!(token.cancel().unwrap(), CancelOutcome::AlreadyCanceled);
/// ```
#[derive(Clone)]
pub struct Token {
    pub(crate) state: Arc<TokenState>,
}

impl Token {
    pub(crate) fn new(state: TokenState) -> Self {
        Token {
            state: Arc::new(state),
        }
    }

    /// Removes the closure this token stands for.
    ///
    /// # Errors
    ///
    /// `InternalError` if the manager's bookkeeping is inconsistent.
    pub fn cancel(&self) -> Result<CancelOutcome> {
        match self.state.manager.upgrade() {
            Some(inner) => HookManager::from_inner(inner).cancel(self),
            None => {
                // The manager's teardown already removed everything.
                self.state.mark_canceled();
                Ok(CancelOutcome::AlreadyCanceled)
            }
        }
    }

    /// Returns the mode the closure was installed with.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    /// Returns the hooked selector.
    #[must_use]
    pub fn selector(&self) -> Selector {
        self.state.selector
    }

    /// Returns `true` once the token has been canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::SeqCst)
    }

    /// Returns `true` for tokens of single-instance hooks.
    #[must_use]
    pub fn is_instance_hook(&self) -> bool {
        matches!(self.state.target, TokenTarget::Instance { .. })
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("selector", &self.state.selector)
            .field("mode", &self.state.mode)
            .field("instance", &self.is_instance_hook())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
