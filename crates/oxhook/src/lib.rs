//! `OxHook`: Method Interception for an Objective-C Style Runtime
//!
//! `OxHook` attaches closures to methods of a dynamic object runtime,
//! without touching the code that defines or calls them. It provides:
//!
//! - **Three Modes**: run a closure before, after or instead of a method
//! - **Composition**: any number of closures per method, nested in a
//!   well-defined order
//! - **Three Scopes**: all instances of a class, class methods, or a single
//!   instance (through a private per-instance subclass)
//! - **Clean Cancellation**: tokens that restore the original
//!   implementation once the last closure is gone
//! - **Typed Marshaling**: signature descriptors decoded from type
//!   encodings and a generic invocation engine
//!
//! # Architecture
//!
//! - **Runtime Layer** ([`runtime`]): selectors, classes, objects, blocks and
//!   the invocation engine that moves arguments between callers and
//!   closures
//! - **Hook Layer** ([`hook`]): signature checks, hook contexts, instead
//!   chains, per-instance subclasses and the registry
//!
//! # Example
//!
//! ```rust
//! use oxhook::runtime::dispatch::send_message;
//! use oxhook::{Block, Class, HookManager, Method, Mode, Object, Selector};
//!
//! let class = Class::new_root("LibDoc").unwrap();
//! let sel = Selector::new("sumWith:and:").unwrap();
//! let sum = Block::opaque(|call| {
//!     let a: i64 = call.argument(2).unwrap();
//!     let b: i64 = call.argument(3).unwrap();
//!     call.set_return_value(a + b).unwrap();
//! });
//! class.add_method(Method::new(sel, sum, "q@:qq")).unwrap();
//!
//! let manager = HookManager::new();
//! let plus_one = Block::new("q@?<q@:qq>@:qq", |call| {
//!     let mut original = call.forward(0).unwrap();
//!     original.invoke().unwrap();
//!     let value: i64 = original.return_value().unwrap();
//!     call.set_return_value(value + 1).unwrap();
//! })
//! .unwrap();
//!
//! let obj = Object::new(&class).unwrap();
//! let token = manager.hook_object(&obj, &sel, Mode::Instead, plus_one).unwrap();
//! assert_eq!(send_message::<i64>(&obj, &sel, &[&77i64, &88i64]).unwrap(), 166);
//!
//! let other = Object::new(&class).unwrap();
//! assert_eq!(send_message::<i64>(&other, &sel, &[&77i64, &88i64]).unwrap(), 165);
//!
//! token.cancel().unwrap();
//! assert_eq!(send_message::<i64>(&obj, &sel, &[&77i64, &88i64]).unwrap(), 165);
//! ```

pub mod error;
pub mod hook;
pub mod runtime;

// Re-export commonly used types
pub use error::{Error, Result};
pub use hook::{
    CancelOutcome, Config, HookManager, Mode, Token,
    cancel_hook, hook_after, hook_before, hook_class_method_after, hook_class_method_before,
    hook_class_method_instead, hook_instead, hook_object_after, hook_object_before,
    hook_object_instead,
};
pub use runtime::{
    Block, BlockCall, Class, Encode, Imp, Invocation, Method, Object, Selector,
    SignatureDescriptor, TypeDescriptor,
};
