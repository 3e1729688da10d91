//! Object allocation and lifecycle management for the `OxHook` runtime.
//!
//! This module implements the object system with:
//! - Atomic strong and weak reference counts
//! - A mutable isa pointer (`set_class`), used for per-instance subclasses
//! - Associated values keyed by `usize`
//! - Destruction observers
//!
//! # Destruction
//!
//! When the last strong reference is released the runtime:
//!
//! 1. marks the object as deallocating, so weak references stop upgrading;
//! 2. sends `dealloc` if the class hierarchy implements it;
//! 3. runs destruction observers in registration order, each exactly once;
//! 4. drops associated values;
//! 5. frees the storage once no weak reference remains.
//!
//! During steps 2-4 the object is still fully usable through the `&Object`
//! handed to `dealloc` and to observers.

use crate::error::{Error, Result};
use crate::runtime::Class;
use crate::runtime::dispatch;
use crate::runtime::selector::Selector;
use fxhash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Value stored with [`Object::set_associated`].
pub type Associated = Arc<dyn Any + Send + Sync>;

type Observer = Box<dyn FnOnce(&Object) + Send>;

/// Heap header of every object.
pub(crate) struct RawObject {
    /// Isa pointer. Only changes through `set_class`.
    isa: RwLock<Class>,
    /// Strong count; storage is torn down when it reaches 0.
    strong: AtomicU32,
    /// Weak count, plus one held collectively by the strong references.
    weak: AtomicU32,
    deallocating: AtomicBool,
    associations: Mutex<FxHashMap<usize, Associated>>,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_observer: AtomicU64,
}

/// Opaque object pointer used by the native method ABI.
///
/// This is the `self` argument of a [`NativeImp`](crate::runtime::NativeImp)
/// and the content of `@` argument slots.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ObjectPtr(*const RawObject);

impl ObjectPtr {
    /// Returns the nil pointer.
    #[must_use]
    pub const fn null() -> Self {
        ObjectPtr(std::ptr::null())
    }

    /// Returns `true` for nil.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// A strong reference to a runtime instance.
///
/// Cloning retains, dropping releases.
///
/// # Example
///
/// ```rust
/// use oxhook::{Class, Object};
///
/// let class = Class::new_root("DocObject").unwrap();
/// let obj = Object::new(&class).unwrap();
/// let other = obj.clone();
/// assert_eq!(obj.retain_count(), 2);
/// assert_eq!(obj, other);
/// ```
pub struct Object {
    ptr: NonNull<RawObject>,
}

impl Object {
    /// Creates an instance of `class` with a retain count of 1.
    ///
    /// # Errors
    ///
    /// Returns `Error::ClassNotRegistered` if `class` has been disposed.
    pub fn new(class: &Class) -> Result<Self> {
        if class.is_disposed() {
            return Err(Error::ClassNotRegistered {
                name: class.name().to_string(),
            });
        }
        Ok(Self::alloc(class.clone()))
    }

    pub(crate) fn alloc(class: Class) -> Self {
        let raw = Box::new(RawObject {
            isa: RwLock::new(class),
            strong: AtomicU32::new(1),
            weak: AtomicU32::new(1),
            deallocating: AtomicBool::new(false),
            associations: Mutex::new(FxHashMap::default()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        });
        Object {
            ptr: NonNull::from(Box::leak(raw)),
        }
    }

    fn raw(&self) -> &RawObject {
        // SAFETY: a strong reference keeps the allocation alive.
        unsafe { self.ptr.as_ref() }
    }

    /// Returns the object's current class.
    #[must_use]
    pub fn class(&self) -> Class {
        self.raw()
            .isa
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the object's class, returning the previous one.
    pub fn set_class(&self, class: &Class) -> Class {
        let mut isa = self.raw().isa.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *isa, class.clone())
    }

    /// Returns `true` if this object is a class object (an instance of a
    /// metaclass).
    #[must_use]
    pub fn is_class_object(&self) -> bool {
        self.class().is_metaclass()
    }

    /// Returns `true` if the class hierarchy implements `selector`.
    #[must_use]
    pub fn responds_to(&self, selector: &Selector) -> bool {
        self.class().responds_to(selector)
    }

    /// Returns the pointer passed to native implementations.
    #[must_use]
    pub fn as_ptr(&self) -> ObjectPtr {
        ObjectPtr(self.ptr.as_ptr())
    }

    /// Takes a new strong reference from a raw pointer.
    ///
    /// Returns `None` for nil.
    ///
    /// # Safety
    ///
    /// `ptr` must be nil or point to an object that is alive (or inside
    /// its `dealloc`/observer phase) for the duration of the call.
    #[must_use]
    pub unsafe fn from_ptr(ptr: ObjectPtr) -> Option<Self> {
        let ptr = NonNull::new(ptr.0.cast_mut())?;
        // SAFETY: caller guarantees the object is alive.
        unsafe { ptr.as_ref() }.strong.fetch_add(1, Ordering::Relaxed);
        Some(Object { ptr })
    }

    /// Returns the current strong count.
    #[must_use]
    pub fn retain_count(&self) -> u32 {
        self.raw().strong.load(Ordering::SeqCst)
    }

    /// Returns `true` once destruction has started.
    #[must_use]
    pub fn is_deallocating(&self) -> bool {
        self.raw().deallocating.load(Ordering::SeqCst)
    }

    /// Returns a unique identifier for this object's lifetime.
    #[must_use]
    pub fn id(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Creates a weak reference.
    #[must_use]
    pub fn downgrade(&self) -> WeakObject {
        self.raw().weak.fetch_add(1, Ordering::Relaxed);
        WeakObject { ptr: self.ptr }
    }

    /// Stores `value` under `key`, returning the previous value.
    ///
    /// Associated values are dropped after destruction observers ran.
    pub fn set_associated(&self, key: usize, value: Associated) -> Option<Associated> {
        self.raw()
            .associations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value)
    }

    /// Returns the value under `key` if it has type `T`.
    #[must_use]
    pub fn associated<T: Any + Send + Sync>(&self, key: usize) -> Option<Arc<T>> {
        let value = self
            .raw()
            .associations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()?;
        value.downcast::<T>().ok()
    }

    /// Removes and returns the value under `key`.
    pub fn remove_associated(&self, key: usize) -> Option<Associated> {
        self.raw()
            .associations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
    }

    /// Registers `observer` to run once, during destruction, after
    /// `dealloc`. Returns an id for [`Object::remove_dealloc_observer`].
    pub fn on_dealloc<F>(&self, observer: F) -> u64
    where
        F: FnOnce(&Object) + Send + 'static,
    {
        let id = self.raw().next_observer.fetch_add(1, Ordering::Relaxed);
        self.raw()
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Box::new(observer)));
        id
    }

    /// Unregisters a destruction observer. Returns `false` if it already
    /// ran or was never registered.
    pub fn remove_dealloc_observer(&self, id: u64) -> bool {
        let removed = {
            let mut observers = self
                .raw()
                .observers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            observers
                .iter()
                .position(|(observer_id, _)| *observer_id == id)
                .map(|index| observers.remove(index))
        };
        // The observer is dropped here, outside the lock.
        removed.is_some()
    }

    /// Tears the object down. Called when the strong count hits zero.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, by the release that took the strong
    /// count to zero.
    unsafe fn destroy(ptr: NonNull<RawObject>) {
        // SAFETY: the implicit weak reference keeps the storage alive.
        let raw = unsafe { ptr.as_ref() };
        raw.deallocating.store(true, Ordering::SeqCst);
        raw.strong.store(1, Ordering::SeqCst);

        let receiver = ManuallyDrop::new(Object { ptr });
        let dealloc = Selector::dealloc();
        if receiver.responds_to(&dealloc) {
            if let Err(err) = dispatch::send_message::<()>(&receiver, &dealloc, &[]) {
                oxhook_log::error!("dealloc of {:?} failed: {err}", receiver.class());
            }
        }

        loop {
            let batch = std::mem::take(
                &mut *raw.observers.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if batch.is_empty() {
                break;
            }
            for (_, observer) in batch {
                observer(&receiver);
            }
        }

        let associations = std::mem::take(
            &mut *raw.associations.lock().unwrap_or_else(PoisonError::into_inner),
        );
        drop(associations);

        raw.strong.store(0, Ordering::SeqCst);
        // SAFETY: this is the implicit weak reference of the strong side.
        unsafe { release_weak(ptr) };
    }
}

/// Drops one weak reference, freeing the storage on the last one.
unsafe fn release_weak(ptr: NonNull<RawObject>) {
    // SAFETY: the caller owns one weak reference.
    if unsafe { ptr.as_ref() }.weak.fetch_sub(1, Ordering::Release) == 1 {
        fence(Ordering::Acquire);
        // SAFETY: no references of any kind remain.
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }
}

// SAFETY: all shared state in `RawObject` is atomic or behind a lock.
unsafe impl Send for Object {}
// SAFETY: see above.
unsafe impl Sync for Object {}

impl Clone for Object {
    fn clone(&self) -> Self {
        self.raw().strong.fetch_add(1, Ordering::Relaxed);
        Object { ptr: self.ptr }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        if self.raw().strong.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        // SAFETY: we released the last strong reference.
        unsafe { Object::destroy(self.ptr) };
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for Object {}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("ptr", &self.ptr)
            .field("class", &self.class().name())
            .field("retain_count", &self.retain_count())
            .finish()
    }
}

/// A weak reference to an object.
///
/// Does not keep the object alive; [`WeakObject::upgrade`] fails once
/// destruction has started.
pub struct WeakObject {
    ptr: NonNull<RawObject>,
}

impl WeakObject {
    fn raw(&self) -> &RawObject {
        // SAFETY: a weak reference keeps the allocation alive.
        unsafe { self.ptr.as_ref() }
    }

    /// Returns a strong reference if the object is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Object> {
        let raw = self.raw();
        let mut count = raw.strong.load(Ordering::SeqCst);
        loop {
            if count == 0 || raw.deallocating.load(Ordering::SeqCst) {
                return None;
            }
            match raw.strong.compare_exchange_weak(
                count,
                count + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }
        if raw.deallocating.load(Ordering::SeqCst) {
            // Raced with destruction, which holds its own strong count.
            raw.strong.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Object { ptr: self.ptr })
    }

    /// Returns `true` if `object` is the referenced object.
    #[must_use]
    pub fn points_to(&self, object: &Object) -> bool {
        self.ptr == object.ptr
    }

    /// Returns `true` if the object has not started destruction.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        let raw = self.raw();
        raw.strong.load(Ordering::SeqCst) > 0 && !raw.deallocating.load(Ordering::SeqCst)
    }
}

impl Clone for WeakObject {
    fn clone(&self) -> Self {
        self.raw().weak.fetch_add(1, Ordering::Relaxed);
        WeakObject { ptr: self.ptr }
    }
}

impl Drop for WeakObject {
    fn drop(&mut self) {
        // SAFETY: this handle owns one weak reference.
        unsafe { release_weak(self.ptr) };
    }
}

// SAFETY: see `Object`.
unsafe impl Send for WeakObject {}
// SAFETY: see `Object`.
unsafe impl Sync for WeakObject {}

impl fmt::Debug for WeakObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakObject")
            .field("ptr", &self.ptr)
            .field("alive", &self.is_alive())
            .finish()
    }
}
