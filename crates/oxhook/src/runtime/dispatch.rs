//! Typed message sends.
//!
//! The equivalent of `objc_msgSend` for Rust callers: look up the
//! receiver's implementation, marshal the arguments according to the
//! method's type encoding and read back a typed return value. Every send
//! goes through the invocation engine, so hooked methods behave the same
//! whether they are called here or from a native caller.
//!
//! # Example
//!
//! ```rust
//! use oxhook::runtime::dispatch::send_message;
//! use oxhook::{Block, Class, Method, Object, Selector};
//!
//! let class = Class::new_root("DispatchDoc").unwrap();
//! let sel = Selector::new("sumWith:and:").unwrap();
//! let imp = Block::opaque(|call| {
//!     let a: i64 = call.argument(2).unwrap();
//!     let b: i64 = call.argument(3).unwrap();
//!     call.set_return_value(a + b).unwrap();
//! });
//! class.add_method(Method::new(sel, imp, "q@:qq")).unwrap();
//!
//! let obj = Object::new(&class).unwrap();
//! let sum: i64 = send_message(&obj, &sel, &[&77i64, &88i64]).unwrap();
//! assert_eq!(sum, 165);
//! ```

use crate::error::{Error, Result};
use crate::runtime::block::Block;
use crate::runtime::encoding::Encode;
use crate::runtime::invocation::Invocation;
use crate::runtime::object::Object;
use crate::runtime::selector::Selector;

/// A value that can be passed to [`send_message`].
///
/// Objects and blocks are passed as [`Object`] and [`Block`]; their raw
/// pointers are refused by object and block slots.
pub trait Argument {
    /// Writes `self` into argument slot `index` of `invocation`.
    ///
    /// # Errors
    ///
    /// Fails if the value does not fit the slot.
    fn write_to(&self, invocation: &mut Invocation, index: usize) -> Result<()>;
}

impl<T: Encode> Argument for T {
    fn write_to(&self, invocation: &mut Invocation, index: usize) -> Result<()> {
        invocation.set_argument(index, *self)
    }
}

impl Argument for Object {
    fn write_to(&self, invocation: &mut Invocation, index: usize) -> Result<()> {
        invocation.set_object_argument(index, Some(self))
    }
}

impl Argument for Block {
    fn write_to(&self, invocation: &mut Invocation, index: usize) -> Result<()> {
        invocation.set_block_argument(index, Some(self))
    }
}

/// Sends `selector` to `receiver` with `args` (excluding `self` and
/// `_cmd`) and returns the result as `R`.
///
/// # Errors
///
/// - `SelectorNotFound` if the receiver does not respond to `selector`
/// - `ArgumentCountMismatch` if `args` has the wrong length
/// - `ArgumentTypeMismatch` / `ReturnTypeMismatch` on type mismatches
pub fn send_message<R: Encode>(
    receiver: &Object,
    selector: &Selector,
    args: &[&dyn Argument],
) -> Result<R> {
    let mut invocation = Invocation::for_message(receiver, selector)?;
    let expected = invocation.argument_count() - 2;
    if args.len() != expected {
        return Err(Error::ArgumentCountMismatch {
            expected,
            got: args.len(),
        });
    }
    for (offset, argument) in args.iter().enumerate() {
        argument.write_to(&mut invocation, offset + 2)?;
    }
    invocation.invoke()?;
    invocation.return_value::<R>()
}

/// Sends a class method: `selector` to the class object of `class`.
///
/// # Errors
///
/// Same as [`send_message`]; `SelectorNotFound` if `class` is a metaclass.
pub fn send_class_message<R: Encode>(
    class: &crate::runtime::Class,
    selector: &Selector,
    args: &[&dyn Argument],
) -> Result<R> {
    let receiver = class.class_object().ok_or_else(|| Error::SelectorNotFound {
        selector: selector.name().to_string(),
    })?;
    send_message(&receiver, selector, args)
}
