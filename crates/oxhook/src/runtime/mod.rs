//! The `OxHook` object runtime.
//!
//! A small Objective-C style runtime that the hook engine is built on:
//!
//! - [`selector`]: interned method names
//! - [`class`]: classes, metaclasses, method tables and swizzling
//! - [`object`]: reference-counted instances, weak references, associated
//!   values and destruction observers
//! - [`encoding`]: type encodings, signature descriptors and C layout
//! - [`block`]: closures usable as hook closures and implementations
//! - [`invocation`]: the generic invocation engine
//! - [`dispatch`]: typed message sends

pub mod block;
pub mod class;
pub mod dispatch;
pub mod encoding;
pub mod invocation;
pub mod object;
pub mod selector;

pub use block::{Block, BlockCall, BlockPtr};
pub use class::{Class, Imp, Method, NativeImp};
pub use encoding::{Encode, PointerKind, SignatureDescriptor, TypeDescriptor};
pub use invocation::{Frame, Invocation};
pub use object::{Associated, Object, ObjectPtr, WeakObject};
pub use selector::{Selector, SelectorHandle};
