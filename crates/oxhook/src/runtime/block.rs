//! Blocks: reference-counted closures with an optional signature.
//!
//! A [`Block`] is what callers hand to the hook engine, and it can also
//! serve as a method implementation. Its body receives a [`BlockCall`]
//! that gives typed access to the argument slots and the return slot laid
//! out by the invocation engine.
//!
//! Blocks travel through argument slots as [`BlockPtr`], a borrowed
//! pointer that can be upgraded back to an owned `Block`.

use crate::error::{Error, Result, internal_error};
use crate::runtime::encoding::{Encode, PointerKind, SignatureDescriptor, TypeDescriptor};
use crate::runtime::invocation::Invocation;
use crate::runtime::object::{Object, ObjectPtr};
use crate::runtime::selector::{Selector, SelectorHandle};
use std::fmt;
use std::sync::Arc;

type Body = dyn Fn(&mut BlockCall<'_>) + Send + Sync;

struct BlockInner {
    signature: Option<Arc<SignatureDescriptor>>,
    body: Box<Body>,
}

/// A closure callable through the runtime.
///
/// Cloning a block is cheap and keeps its identity: clones compare equal
/// with [`Block::ptr_eq`].
///
/// # Example
///
/// ```rust
/// use oxhook::Block;
///
/// // (receiver, selector, a, b) -> nothing
/// let logger = Block::new("v@:qq", |call| {
///     let a: i64 = call.argument(2).unwrap();
///     let b: i64 = call.argument(3).unwrap();
///     println!("about to add {a} and {b}");
/// })
/// .unwrap();
/// assert!(logger.signature().is_some());
/// ```
#[derive(Clone)]
pub struct Block {
    inner: Arc<BlockInner>,
}

impl Block {
    /// Creates a block whose parameters are described by `encoding`
    /// (return type first, no implicit block parameter).
    ///
    /// # Errors
    ///
    /// Fails if `encoding` is invalid or contains unsupported types.
    pub fn new<F>(encoding: &str, body: F) -> Result<Self>
    where
        F: Fn(&mut BlockCall<'_>) + Send + Sync + 'static,
    {
        let signature = SignatureDescriptor::parse(encoding)?;
        Ok(Self::with_signature(Arc::new(signature), body))
    }

    /// Creates a block from an already decoded signature.
    pub fn with_signature<F>(signature: Arc<SignatureDescriptor>, body: F) -> Self
    where
        F: Fn(&mut BlockCall<'_>) + Send + Sync + 'static,
    {
        Block {
            inner: Arc::new(BlockInner {
                signature: Some(signature),
                body: Box::new(body),
            }),
        }
    }

    /// Creates a block without a signature.
    ///
    /// Such a block can be installed as a method implementation, where the
    /// method's own encoding describes the call, but it can not be used
    /// as a hook closure.
    pub fn opaque<F>(body: F) -> Self
    where
        F: Fn(&mut BlockCall<'_>) + Send + Sync + 'static,
    {
        Block {
            inner: Arc::new(BlockInner {
                signature: None,
                body: Box::new(body),
            }),
        }
    }

    /// Returns the declared signature, if any.
    #[must_use]
    pub fn signature(&self) -> Option<&Arc<SignatureDescriptor>> {
        self.inner.signature.as_ref()
    }

    /// Returns `true` if both handles refer to the same block.
    #[must_use]
    pub fn ptr_eq(&self, other: &Block) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns a borrowed pointer suitable for an `@?` argument slot.
    ///
    /// The pointer is only valid while this block is alive.
    #[must_use]
    pub fn as_ptr(&self) -> BlockPtr {
        BlockPtr(Arc::as_ptr(&self.inner))
    }

    /// Runs the body against raw slots described by `signature`.
    ///
    /// # Safety
    ///
    /// `args` must hold one valid, correctly typed pointer per argument of
    /// `signature`. `ret` must be null or point to storage for the return
    /// type.
    pub(crate) unsafe fn call(
        &self,
        signature: &SignatureDescriptor,
        args: &[*mut u8],
        ret: *mut u8,
    ) {
        let mut call = BlockCall {
            signature,
            args,
            ret,
        };
        (self.inner.body)(&mut call);
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Block");
        debug.field("ptr", &Arc::as_ptr(&self.inner));
        match self.signature() {
            Some(signature) => debug.field("signature", &signature.to_string()),
            None => debug.field("signature", &"<opaque>"),
        };
        debug.finish()
    }
}

/// Borrowed pointer to a block, as stored in `@?` argument slots.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockPtr(*const BlockInner);

impl BlockPtr {
    /// Returns the null block pointer.
    #[must_use]
    pub const fn null() -> Self {
        BlockPtr(std::ptr::null())
    }

    /// Returns `true` if this pointer does not refer to a block.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Takes a new strong reference to the block.
    ///
    /// # Safety
    ///
    /// The pointer must be null or come from [`Block::as_ptr`] on a block
    /// that is still alive.
    #[must_use]
    pub unsafe fn to_block(self) -> Option<Block> {
        if self.0.is_null() {
            return None;
        }
        // SAFETY: the pointer came from `Arc::as_ptr` on a live block, so
        // bumping the count and rebuilding an `Arc` yields a new owner.
        unsafe {
            Arc::increment_strong_count(self.0);
            Some(Block {
                inner: Arc::from_raw(self.0),
            })
        }
    }
}

/// Access to the arguments and return slot of one block invocation.
///
/// Indices follow the signature the block was called with. For hook
/// closures that is the closure's own declared signature, so index 0 is
/// the receiver for before/after closures and the original callable for
/// instead closures.
pub struct BlockCall<'a> {
    signature: &'a SignatureDescriptor,
    args: &'a [*mut u8],
    ret: *mut u8,
}

impl BlockCall<'_> {
    /// Returns the signature of this call.
    #[must_use]
    pub fn signature(&self) -> &SignatureDescriptor {
        self.signature
    }

    /// Returns the number of arguments.
    #[must_use]
    pub fn argument_count(&self) -> usize {
        self.args.len()
    }

    /// Returns the raw argument slots.
    #[must_use]
    pub fn raw_arguments(&self) -> &[*mut u8] {
        self.args
    }

    /// Returns the raw return slot. Null when the caller discards the
    /// result (before and after closures).
    #[must_use]
    pub fn raw_return(&self) -> *mut u8 {
        self.ret
    }

    fn slot(&self, index: usize) -> Result<(&TypeDescriptor, *mut u8)> {
        match (self.signature.arguments().get(index), self.args.get(index)) {
            (Some(ty), Some(&ptr)) => Ok((ty, ptr)),
            _ => Err(Error::ArgumentCountMismatch {
                expected: index + 1,
                got: self.args.len(),
            }),
        }
    }

    /// Reads argument `index`.
    ///
    /// # Errors
    ///
    /// `ArgumentCountMismatch` if `index` is out of range,
    /// `ArgumentTypeMismatch` if `T` does not fit the slot.
    pub fn argument<T: Encode>(&self, index: usize) -> Result<T> {
        let (ty, ptr) = self.slot(index)?;
        check_slot::<T>(ty, index)?;
        // SAFETY: the slot has the layout of `T` (checked above) and the
        // invocation engine keeps it alive for the duration of the call.
        Ok(unsafe { ptr.cast::<T>().read_unaligned() })
    }

    /// Overwrites argument `index` in place.
    ///
    /// Before closures can use this to rewrite the arguments seen by the
    /// rest of the call. Object and block slots can not be overwritten:
    /// nothing would keep the new value alive.
    ///
    /// # Errors
    ///
    /// Same as [`BlockCall::argument`]; `ArgumentTypeMismatch` for object
    /// and block slots.
    pub fn set_argument<T: Encode>(&mut self, index: usize, value: T) -> Result<()> {
        let (ty, ptr) = self.slot(index)?;
        check_slot::<T>(ty, index)?;
        check_unretained::<T>(ty, index)?;
        // SAFETY: see `argument`.
        unsafe { ptr.cast::<T>().write_unaligned(value) };
        Ok(())
    }

    /// Reads an object argument, taking a strong reference.
    ///
    /// # Errors
    ///
    /// Same as [`BlockCall::argument`].
    pub fn object_argument(&self, index: usize) -> Result<Option<Object>> {
        let (ty, _) = self.slot(index)?;
        check_reference(ty, ReferenceKind::Object, index)?;
        let ptr: ObjectPtr = self.argument(index)?;
        // SAFETY: object slots hold pointers to live objects or nil.
        Ok(unsafe { Object::from_ptr(ptr) })
    }

    /// Reads a selector argument.
    ///
    /// # Errors
    ///
    /// Same as [`BlockCall::argument`].
    pub fn selector_argument(&self, index: usize) -> Result<Option<Selector>> {
        let handle: SelectorHandle = self.argument(index)?;
        // SAFETY: selector slots hold handles produced by `as_handle`.
        Ok(unsafe { Selector::from_handle(handle) })
    }

    /// Reads a block argument, taking a strong reference.
    ///
    /// # Errors
    ///
    /// Same as [`BlockCall::argument`].
    pub fn block_argument(&self, index: usize) -> Result<Option<Block>> {
        let (ty, _) = self.slot(index)?;
        check_reference(ty, ReferenceKind::Block, index)?;
        let ptr: BlockPtr = self.argument(index)?;
        // SAFETY: block slots hold pointers to blocks kept alive by the
        // caller for the duration of the call.
        Ok(unsafe { ptr.to_block() })
    }

    /// Writes the return value.
    ///
    /// Does nothing when the caller discards the result.
    ///
    /// # Errors
    ///
    /// `ReturnTypeMismatch` if `T` does not fit the return type.
    pub fn set_return_value<T: Encode>(&mut self, value: T) -> Result<()> {
        check_return::<T>(self.signature.return_type())?;
        if !self.ret.is_null() {
            // SAFETY: the return slot has the layout of `T` (checked above).
            unsafe { self.ret.cast::<T>().write_unaligned(value) };
        }
        Ok(())
    }

    /// Copies the return value of a finished invocation into this call's
    /// return slot.
    ///
    /// Lets an instead closure pass the original result through without
    /// naming its type.
    ///
    /// # Errors
    ///
    /// `ReturnTypeMismatch` if the two return types differ in layout.
    pub fn set_return_from(&mut self, invocation: &Invocation) -> Result<()> {
        let ours = self.signature.return_type();
        let theirs = invocation.signature().return_type();
        if !ours.same_storage(theirs) {
            return Err(Error::ReturnTypeMismatch {
                expected: ours.to_string(),
                got: theirs.to_string(),
            });
        }
        if !self.ret.is_null() && ours.size() > 0 {
            // SAFETY: both slots hold `ours.size()` bytes of the same type.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    invocation.return_ptr(),
                    self.ret,
                    ours.size(),
                );
            }
        }
        Ok(())
    }

    /// Prepares a call of the block found in argument `callable_index`,
    /// pre-filled with the arguments that follow it.
    ///
    /// This is how an instead closure calls the original implementation:
    /// `call.forward(0)?` yields an invocation carrying the receiver,
    /// selector and arguments, which may be changed before `invoke`. The
    /// invocation holds its own references to the objects and blocks it
    /// copied, so it stays valid after this call returns.
    ///
    /// # Errors
    ///
    /// `ArgumentTypeMismatch` if the slot is not a block,
    /// `MissingSignature` if the block has no signature, and
    /// `InternalError` if the slot is nil.
    pub fn forward(&self, callable_index: usize) -> Result<Invocation> {
        let block = self
            .block_argument(callable_index)?
            .ok_or_else(|| internal_error!())?;
        let mut invocation = Invocation::for_block(&block)?;

        let rest = &self.args[callable_index + 1..];
        let rest_types = &self.signature.arguments()[callable_index + 1..];
        let count = rest.len().min(invocation.argument_count());
        for index in 0..count {
            // SAFETY: `rest[index]` is a live slot of type `rest_types[index]`.
            unsafe {
                invocation.copy_argument_from(index, &rest_types[index], rest[index])?;
            }
        }
        Ok(invocation)
    }
}

pub(crate) fn check_slot<T: Encode>(ty: &TypeDescriptor, index: usize) -> Result<()> {
    let expected = T::descriptor()?;
    if ty.same_storage(&expected) && ty.size() == std::mem::size_of::<T>() {
        Ok(())
    } else {
        Err(Error::ArgumentTypeMismatch {
            index,
            expected: ty.to_string(),
            got: T::ENCODING.to_string(),
        })
    }
}

/// Slots holding pointers the runtime upgrades to owned references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReferenceKind {
    Object,
    Block,
}

impl ReferenceKind {
    pub(crate) fn of(ty: &TypeDescriptor) -> Option<Self> {
        match ty {
            TypeDescriptor::Pointer(PointerKind::Object | PointerKind::Class) => {
                Some(ReferenceKind::Object)
            }
            TypeDescriptor::Callable(_) => Some(ReferenceKind::Block),
            _ => None,
        }
    }

    fn encoding(self) -> &'static str {
        match self {
            ReferenceKind::Object => "@",
            ReferenceKind::Block => "@?",
        }
    }
}

/// Refuses typed writes of bare pointers into object and block slots.
pub(crate) fn check_unretained<T: Encode>(ty: &TypeDescriptor, index: usize) -> Result<()> {
    match ReferenceKind::of(ty) {
        Some(_) => Err(Error::ArgumentTypeMismatch {
            index,
            expected: ty.to_string(),
            got: T::ENCODING.to_string(),
        }),
        None => Ok(()),
    }
}

/// Checks that slot `index` holds references of `kind`.
pub(crate) fn check_reference(ty: &TypeDescriptor, kind: ReferenceKind, index: usize) -> Result<()> {
    if ReferenceKind::of(ty) == Some(kind) {
        Ok(())
    } else {
        Err(Error::ArgumentTypeMismatch {
            index,
            expected: ty.to_string(),
            got: kind.encoding().to_string(),
        })
    }
}

pub(crate) fn check_return<T: Encode>(ty: &TypeDescriptor) -> Result<()> {
    let expected = T::descriptor()?;
    if ty.same_storage(&expected) && ty.size() == std::mem::size_of::<T>() {
        Ok(())
    } else {
        Err(Error::ReturnTypeMismatch {
            expected: ty.to_string(),
            got: T::ENCODING.to_string(),
        })
    }
}
