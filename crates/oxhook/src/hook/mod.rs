//! Method interception.
//!
//! Closures are attached to a method in one of three [`Mode`]s:
//!
//! - `Before`: runs before the implementation; its result is discarded
//! - `After`: runs after the implementation; its result is discarded
//! - `Instead`: replaces the implementation and receives the original as
//!   a callable first argument
//!
//! Before and after closures take any prefix of (receiver, selector,
//! arguments...) and return `v`. An instead closure for a method `R@:A`
//! has the encoding `R@?<R@:A>@:A`.
//!
//! Hooks apply to every instance of a class ([`hook_before`] and friends),
//! to class methods ([`hook_class_method_before`] and friends) or to one
//! instance ([`hook_object_before`] and friends). The free functions use
//! [`HookManager::shared`]; create a [`HookManager`] for an isolated
//! registry.
//!
//! # Example
//!
//! ```rust
//! use oxhook::runtime::dispatch::send_message;
//! use oxhook::{Block, Class, Method, Object, Selector, hook_before, cancel_hook};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let class = Class::new_root("HookModuleDoc").unwrap();
//! let sel = Selector::new("tick").unwrap();
//! class.add_method(Method::new(sel, Block::opaque(|_| {}), "v@:")).unwrap();
//!
//! let calls = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&calls);
//! let token = hook_before(
//!     &class,
//!     &sel,
//!     Block::new("v@", move |_| {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     })
//!     .unwrap(),
//! )
//! .unwrap();
//!
//! let obj = Object::new(&class).unwrap();
//! send_message::<()>(&obj, &sel, &[]).unwrap();
//! cancel_hook(&token).unwrap();
//! send_message::<()>(&obj, &sel, &[]).unwrap();
//! assert_eq!(calls.load(Ordering::SeqCst), 1);
//! ```

mod chain;
mod closures;
mod context;
mod dynamic_class;
pub mod manager;
pub mod signature;
pub mod token;

pub use manager::{Config, HookManager};
pub use signature::{MethodIdentity, closure_signature, is_compatible};
pub use token::{CancelOutcome, Token};

use crate::error::Result;
use crate::runtime::{Block, Class, Object, Selector};
use std::fmt;

/// When a closure runs relative to the hooked implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Before the implementation.
    Before,
    /// After the implementation.
    After,
    /// In place of the implementation.
    Instead,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Before => "before",
            Mode::After => "after",
            Mode::Instead => "instead",
        })
    }
}

/// Runs `closure` before `selector` on every instance of `class`.
///
/// # Errors
///
/// See [`HookManager::hook_class`].
pub fn hook_before(class: &Class, selector: &Selector, closure: Block) -> Result<Token> {
    HookManager::shared().hook_class(class, selector, Mode::Before, closure)
}

/// Runs `closure` after `selector` on every instance of `class`.
///
/// # Errors
///
/// See [`HookManager::hook_class`].
pub fn hook_after(class: &Class, selector: &Selector, closure: Block) -> Result<Token> {
    HookManager::shared().hook_class(class, selector, Mode::After, closure)
}

/// Runs `closure` in place of `selector` on every instance of `class`.
///
/// # Errors
///
/// See [`HookManager::hook_class`].
pub fn hook_instead(class: &Class, selector: &Selector, closure: Block) -> Result<Token> {
    HookManager::shared().hook_class(class, selector, Mode::Instead, closure)
}

/// Runs `closure` before the class method `selector` of `class`.
///
/// # Errors
///
/// See [`HookManager::hook_class_method`].
pub fn hook_class_method_before(
    class: &Class,
    selector: &Selector,
    closure: Block,
) -> Result<Token> {
    HookManager::shared().hook_class_method(class, selector, Mode::Before, closure)
}

/// Runs `closure` after the class method `selector` of `class`.
///
/// # Errors
///
/// See [`HookManager::hook_class_method`].
pub fn hook_class_method_after(
    class: &Class,
    selector: &Selector,
    closure: Block,
) -> Result<Token> {
    HookManager::shared().hook_class_method(class, selector, Mode::After, closure)
}

/// Runs `closure` in place of the class method `selector` of `class`.
///
/// # Errors
///
/// See [`HookManager::hook_class_method`].
pub fn hook_class_method_instead(
    class: &Class,
    selector: &Selector,
    closure: Block,
) -> Result<Token> {
    HookManager::shared().hook_class_method(class, selector, Mode::Instead, closure)
}

/// Runs `closure` before `selector` on `instance` only.
///
/// # Errors
///
/// See [`HookManager::hook_object`].
pub fn hook_object_before(instance: &Object, selector: &Selector, closure: Block) -> Result<Token> {
    HookManager::shared().hook_object(instance, selector, Mode::Before, closure)
}

/// Runs `closure` after `selector` on `instance` only.
///
/// # Errors
///
/// See [`HookManager::hook_object`].
pub fn hook_object_after(instance: &Object, selector: &Selector, closure: Block) -> Result<Token> {
    HookManager::shared().hook_object(instance, selector, Mode::After, closure)
}

/// Runs `closure` in place of `selector` on `instance` only.
///
/// # Errors
///
/// See [`HookManager::hook_object`].
pub fn hook_object_instead(
    instance: &Object,
    selector: &Selector,
    closure: Block,
) -> Result<Token> {
    HookManager::shared().hook_object(instance, selector, Mode::Instead, closure)
}

/// Cancels a hook. Same as [`Token::cancel`].
///
/// # Errors
///
/// See [`HookManager::cancel`].
pub fn cancel_hook(token: &Token) -> Result<CancelOutcome> {
    token.cancel()
}
