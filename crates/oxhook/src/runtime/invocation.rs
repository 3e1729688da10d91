//! The generic invocation engine.
//!
//! Every call whose signature is only known at runtime goes through here:
//! message sends, hooked methods, hook closures and the "original"
//! callables handed to instead closures.
//!
//! # Design
//!
//! - [`Frame`] owns one zeroed buffer laid out from a
//!   [`SignatureDescriptor`]: one aligned slot per argument followed by a
//!   return slot large enough for the return type, structures included.
//! - [`invoke`] checks the argument count and calls an [`Imp`] with a
//!   vector of slot pointers. It takes no locks, so it is reentrant.
//! - [`Invocation`] is the typed, owning front end (an `NSInvocation`
//!   equivalent): set arguments, invoke, read the return value.
//!
//! # Safety
//!
//! Slot accesses use `read_unaligned`/`write_unaligned` and are checked
//! against the slot's descriptor by the typed API.

use crate::error::{Error, Result, internal_error};
use crate::runtime::block::{
    Block, BlockPtr, ReferenceKind, check_reference, check_return, check_slot, check_unretained,
};
use crate::runtime::class::Imp;
use crate::runtime::encoding::{Encode, SignatureDescriptor, TypeDescriptor};
use crate::runtime::object::{Object, ObjectPtr};
use crate::runtime::selector::Selector;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

/// Calls `imp` with raw argument slots.
///
/// # Errors
///
/// Returns `Error::ArgumentCountMismatch` if `args` does not have one slot
/// per argument of `signature`, or if a native implementation is called
/// without `self` and `_cmd`.
///
/// # Safety
///
/// Each slot must point to a live value of the corresponding argument
/// type; `ret` must be null or point to storage for the return type.
pub unsafe fn invoke(
    imp: &Imp,
    signature: &SignatureDescriptor,
    args: &[*mut u8],
    ret: *mut u8,
) -> Result<()> {
    if args.len() != signature.argument_count() {
        return Err(Error::ArgumentCountMismatch {
            expected: signature.argument_count(),
            got: args.len(),
        });
    }
    if matches!(imp, Imp::Native(_)) && args.len() < 2 {
        return Err(Error::ArgumentCountMismatch {
            expected: 2,
            got: args.len(),
        });
    }
    // SAFETY: forwarded caller contract; counts checked above.
    unsafe { imp.call(signature, args, ret) };
    Ok(())
}

/// Argument and return storage for one call.
pub struct Frame {
    signature: Arc<SignatureDescriptor>,
    buffer: NonNull<u8>,
    layout: Layout,
    offsets: Vec<usize>,
    return_offset: usize,
}

impl Frame {
    /// Allocates a zeroed frame for `signature`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InternalError` if the layout overflows.
    pub fn new(signature: Arc<SignatureDescriptor>) -> Result<Self> {
        let mut offset = 0usize;
        let mut align = std::mem::align_of::<usize>();
        let mut offsets = Vec::with_capacity(signature.argument_count());
        for argument in signature.arguments() {
            let arg_align = argument.align();
            offset = offset.div_ceil(arg_align) * arg_align;
            offsets.push(offset);
            offset += argument.size().max(1);
            align = align.max(arg_align);
        }

        let return_type = signature.return_type();
        let ret_align = return_type.align();
        let return_offset = offset.div_ceil(ret_align) * ret_align;
        let size = return_offset + return_type.size().max(1);
        align = align.max(ret_align);

        let layout = Layout::from_size_align(size, align).map_err(|_| internal_error!())?;
        // SAFETY: `size` is at least 1.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let buffer = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));

        Ok(Frame {
            signature,
            buffer,
            layout,
            offsets,
            return_offset,
        })
    }

    /// Returns the signature the frame was laid out from.
    #[must_use]
    pub fn signature(&self) -> &Arc<SignatureDescriptor> {
        &self.signature
    }

    /// Returns one pointer per argument slot.
    #[must_use]
    pub fn argument_pointers(&self) -> Vec<*mut u8> {
        self.offsets
            .iter()
            // SAFETY: every offset is inside the buffer.
            .map(|&offset| unsafe { self.buffer.as_ptr().add(offset) })
            .collect()
    }

    /// Returns the pointer to argument slot `index`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ArgumentCountMismatch` if `index` is out of range.
    pub fn argument_ptr(&self, index: usize) -> Result<*mut u8> {
        let offset = self.offsets.get(index).ok_or(Error::ArgumentCountMismatch {
            expected: index + 1,
            got: self.offsets.len(),
        })?;
        // SAFETY: the offset is inside the buffer.
        Ok(unsafe { self.buffer.as_ptr().add(*offset) })
    }

    /// Returns the pointer to the return slot.
    #[must_use]
    pub fn return_ptr(&self) -> *mut u8 {
        // SAFETY: the return offset is inside the buffer.
        unsafe { self.buffer.as_ptr().add(self.return_offset) }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.buffer.as_ptr(), self.layout) };
    }
}

// SAFETY: the frame exclusively owns its buffer.
unsafe impl Send for Frame {}

enum Target {
    /// Resolved against the receiver in slot 0 at invoke time.
    Message(Selector),
    Imp(Imp),
    Block(Block),
}

/// A prepared call with owned arguments.
///
/// # Example
///
/// ```rust
/// use oxhook::{Block, Invocation};
///
/// let add = Block::new("qqq", |call| {
///     let a: i64 = call.argument(0).unwrap();
///     let b: i64 = call.argument(1).unwrap();
///     call.set_return_value(a + b).unwrap();
/// })
/// .unwrap();
///
/// let mut invocation = Invocation::for_block(&add).unwrap();
/// invocation.set_argument(0, 77i64).unwrap();
/// invocation.set_argument(1, 88i64).unwrap();
/// invocation.invoke().unwrap();
/// assert_eq!(invocation.return_value::<i64>().unwrap(), 165);
/// ```
pub struct Invocation {
    target: Target,
    frame: Frame,
    retained_objects: Vec<Object>,
    retained_blocks: Vec<Block>,
}

impl Invocation {
    fn with_target(target: Target, signature: Arc<SignatureDescriptor>) -> Result<Self> {
        Ok(Invocation {
            target,
            frame: Frame::new(signature)?,
            retained_objects: Vec::new(),
            retained_blocks: Vec::new(),
        })
    }

    /// Prepares a message send of `selector` to `receiver`.
    ///
    /// The receiver and selector are filled in; the implementation is
    /// resolved when [`Invocation::invoke`] runs.
    ///
    /// # Errors
    ///
    /// `SelectorNotFound` if the receiver does not respond to `selector`,
    /// or an encoding error from the method's types.
    pub fn for_message(receiver: &Object, selector: &Selector) -> Result<Self> {
        let method = receiver
            .class()
            .lookup_method(selector)
            .ok_or_else(|| Error::SelectorNotFound {
                selector: selector.name().to_string(),
            })?;
        let mut invocation = Self::with_target(Target::Message(*selector), method.signature()?)?;
        invocation.set_object_argument(0, Some(receiver))?;
        invocation.set_argument(1, selector.as_handle())?;
        Ok(invocation)
    }

    /// Prepares a call of `imp` with an explicit method signature.
    ///
    /// # Errors
    ///
    /// Returns `Error::InternalError` if the frame cannot be laid out.
    pub fn for_imp(imp: Imp, signature: Arc<SignatureDescriptor>) -> Result<Self> {
        Self::with_target(Target::Imp(imp), signature)
    }

    /// Prepares a call of `block` using its declared signature.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingSignature` for blocks without a signature.
    pub fn for_block(block: &Block) -> Result<Self> {
        let signature = block.signature().cloned().ok_or(Error::MissingSignature)?;
        Self::with_target(Target::Block(block.clone()), signature)
    }

    /// Returns the signature of the call.
    #[must_use]
    pub fn signature(&self) -> &SignatureDescriptor {
        self.frame.signature()
    }

    /// Returns the number of arguments, `self` and `_cmd` included for
    /// methods.
    #[must_use]
    pub fn argument_count(&self) -> usize {
        self.frame.signature().argument_count()
    }

    fn slot(&self, index: usize) -> Result<(&TypeDescriptor, *mut u8)> {
        let ptr = self.frame.argument_ptr(index)?;
        Ok((&self.frame.signature().arguments()[index], ptr))
    }

    /// Writes argument `index`.
    ///
    /// Object and block slots take [`Invocation::set_object_argument`] and
    /// [`Invocation::set_block_argument`], which keep the value alive.
    ///
    /// # Errors
    ///
    /// `ArgumentCountMismatch` if out of range, `ArgumentTypeMismatch` if
    /// `T` does not fit the slot or the slot holds objects or blocks.
    pub fn set_argument<T: Encode>(&mut self, index: usize, value: T) -> Result<()> {
        let (ty, _) = self.slot(index)?;
        check_unretained::<T>(ty, index)?;
        self.write_slot(index, value)
    }

    fn write_slot<T: Encode>(&mut self, index: usize, value: T) -> Result<()> {
        let (ty, ptr) = self.slot(index)?;
        check_slot::<T>(ty, index)?;
        // SAFETY: the slot has the layout of `T`.
        unsafe { ptr.cast::<T>().write_unaligned(value) };
        Ok(())
    }

    /// Reads argument `index`.
    ///
    /// # Errors
    ///
    /// Same as [`Invocation::set_argument`].
    pub fn argument<T: Encode>(&self, index: usize) -> Result<T> {
        let (ty, ptr) = self.slot(index)?;
        check_slot::<T>(ty, index)?;
        // SAFETY: the slot has the layout of `T`.
        Ok(unsafe { ptr.cast::<T>().read_unaligned() })
    }

    /// Writes an object argument and keeps the object alive for the
    /// lifetime of the invocation.
    ///
    /// # Errors
    ///
    /// Same as [`Invocation::set_argument`].
    pub fn set_object_argument(&mut self, index: usize, object: Option<&Object>) -> Result<()> {
        let (ty, _) = self.slot(index)?;
        check_reference(ty, ReferenceKind::Object, index)?;
        let ptr = object.map_or(ObjectPtr::null(), Object::as_ptr);
        self.write_slot(index, ptr)?;
        if let Some(object) = object {
            self.retained_objects.push(object.clone());
        }
        Ok(())
    }

    /// Writes a block argument and keeps the block alive for the lifetime
    /// of the invocation.
    ///
    /// # Errors
    ///
    /// Same as [`Invocation::set_argument`].
    pub fn set_block_argument(&mut self, index: usize, block: Option<&Block>) -> Result<()> {
        let (ty, _) = self.slot(index)?;
        check_reference(ty, ReferenceKind::Block, index)?;
        let ptr = block.map_or(BlockPtr::null(), Block::as_ptr);
        self.write_slot(index, ptr)?;
        if let Some(block) = block {
            self.retained_blocks.push(block.clone());
        }
        Ok(())
    }

    /// Copies a raw value of type `ty` into slot `index`, taking a
    /// reference to copied objects and blocks.
    ///
    /// # Errors
    ///
    /// `ArgumentTypeMismatch` if `ty` and the slot differ in layout or in
    /// reference kind.
    ///
    /// # Safety
    ///
    /// `src` must point to a live value of type `ty`; objects and blocks
    /// it refers to must be alive.
    pub(crate) unsafe fn copy_argument_from(
        &mut self,
        index: usize,
        ty: &TypeDescriptor,
        src: *const u8,
    ) -> Result<()> {
        let (slot_ty, dst) = self.slot(index)?;
        let kind = ReferenceKind::of(slot_ty);
        if !slot_ty.same_storage(ty) || kind != ReferenceKind::of(ty) {
            return Err(Error::ArgumentTypeMismatch {
                index,
                expected: slot_ty.to_string(),
                got: ty.to_string(),
            });
        }
        // SAFETY: both regions hold `ty.size()` bytes of the same type.
        unsafe { std::ptr::copy_nonoverlapping(src, dst, ty.size()) };

        // SAFETY: the copied pointer refers to a live object or block.
        match kind {
            Some(ReferenceKind::Object) => {
                let ptr = unsafe { dst.cast::<ObjectPtr>().read_unaligned() };
                if let Some(object) = unsafe { Object::from_ptr(ptr) } {
                    self.retained_objects.push(object);
                }
            }
            Some(ReferenceKind::Block) => {
                let ptr = unsafe { dst.cast::<BlockPtr>().read_unaligned() };
                if let Some(block) = unsafe { ptr.to_block() } {
                    self.retained_blocks.push(block);
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Performs the call.
    ///
    /// Messages to nil do nothing and leave the return slot zeroed.
    ///
    /// # Errors
    ///
    /// `SelectorNotFound` if the receiver stopped responding to the
    /// selector, or `ArgumentCountMismatch` from [`invoke`].
    pub fn invoke(&mut self) -> Result<()> {
        let args = self.frame.argument_pointers();
        let ret = self.frame.return_ptr();
        let signature = Arc::clone(self.frame.signature());

        let imp = match &self.target {
            Target::Message(selector) => {
                let receiver: ObjectPtr = self.argument(0)?;
                // SAFETY: slot 0 holds an object retained by this invocation.
                let Some(receiver) = (unsafe { Object::from_ptr(receiver) }) else {
                    return Ok(());
                };
                receiver
                    .class()
                    .lookup_imp(selector)
                    .ok_or_else(|| Error::SelectorNotFound {
                        selector: selector.name().to_string(),
                    })?
            }
            Target::Imp(imp) => imp.clone(),
            Target::Block(block) => Imp::Block(block.clone()),
        };

        // SAFETY: slots were laid out from `signature` and typed writes
        // were checked; unset slots are zeroed.
        unsafe { invoke(&imp, &signature, &args, ret) }
    }

    /// Reads the return value.
    ///
    /// # Errors
    ///
    /// `ReturnTypeMismatch` if `T` does not fit the return type.
    pub fn return_value<T: Encode>(&self) -> Result<T> {
        check_return::<T>(self.frame.signature().return_type())?;
        // SAFETY: the return slot has the layout of `T`.
        Ok(unsafe { self.frame.return_ptr().cast::<T>().read_unaligned() })
    }

    /// Returns the raw return slot.
    #[must_use]
    pub fn return_ptr(&self) -> *const u8 {
        self.frame.return_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::Method;
    use crate::runtime::{Class, SelectorHandle};

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Size {
        width: f64,
        height: f64,
    }

    unsafe impl Encode for Size {
        const ENCODING: &'static str = "{Size=dd}";
    }

    unsafe extern "C" fn scale_impl(
        _self: ObjectPtr,
        _cmd: SelectorHandle,
        args: *const *mut u8,
        ret: *mut u8,
    ) {
        unsafe {
            let size = (*args).cast::<Size>().read_unaligned();
            let factor = (*args.add(1)).cast::<f64>().read_unaligned();
            ret.cast::<Size>().write_unaligned(Size {
                width: size.width * factor,
                height: size.height * factor,
            });
        }
    }

    #[test]
    fn test_frame_layout_is_aligned() {
        let signature = Arc::new(SignatureDescriptor::parse("dci{Size=dd}").unwrap());
        let frame = Frame::new(signature).unwrap();
        let pointers = frame.argument_pointers();
        assert_eq!(pointers.len(), 3);
        assert_eq!(pointers[1] as usize % 4, 0);
        assert_eq!(pointers[2] as usize % 8, 0);
        assert_eq!(frame.return_ptr() as usize % 8, 0);
    }

    #[test]
    fn test_invoke_checks_argument_count() {
        let signature = SignatureDescriptor::parse("v@:").unwrap();
        let block = Block::opaque(|_| {});
        let result = unsafe { invoke(&Imp::Block(block), &signature, &[], std::ptr::null_mut()) };
        assert!(matches!(
            result,
            Err(Error::ArgumentCountMismatch {
                expected: 2,
                got: 0
            })
        ));
    }

    #[test]
    fn test_structure_argument_and_return() {
        let class = Class::new_root("InvocationScale").unwrap();
        let sel = Selector::new("scaled:by:").unwrap();
        class
            .add_method(Method::new(
                sel,
                scale_impl as crate::runtime::NativeImp,
                "{Size=dd}@:{Size=dd}d",
            ))
            .unwrap();
        let obj = Object::new(&class).unwrap();

        let mut invocation = Invocation::for_message(&obj, &sel).unwrap();
        invocation
            .set_argument(2, Size { width: 2.0, height: 3.0 })
            .unwrap();
        invocation.set_argument(3, 2.5f64).unwrap();
        invocation.invoke().unwrap();
        assert_eq!(
            invocation.return_value::<Size>().unwrap(),
            Size { width: 5.0, height: 7.5 }
        );
    }

    #[test]
    fn test_typed_access_is_checked() {
        let block = Block::new("i@i", |_| {}).unwrap();
        let mut invocation = Invocation::for_block(&block).unwrap();
        assert!(matches!(
            invocation.set_argument(1, 1.0f64),
            Err(Error::ArgumentTypeMismatch { index: 1, .. })
        ));
        assert!(invocation.set_argument(2, 1i32).is_err());
        assert!(matches!(
            invocation.return_value::<i64>(),
            Err(Error::ReturnTypeMismatch { .. })
        ));
        assert_eq!(invocation.return_value::<i32>().unwrap(), 0);
    }

    #[test]
    fn test_block_without_signature_is_rejected() {
        let block = Block::opaque(|_| {});
        assert!(matches!(
            Invocation::for_block(&block),
            Err(Error::MissingSignature)
        ));
    }

    #[test]
    fn test_message_to_missing_selector() {
        let class = Class::new_root("InvocationMissing").unwrap();
        let obj = Object::new(&class).unwrap();
        let sel = Selector::new("nothingHere").unwrap();
        assert!(matches!(
            Invocation::for_message(&obj, &sel),
            Err(Error::SelectorNotFound { .. })
        ));
    }
}
