//! `Class` creation and inheritance for the `OxHook` runtime.
//!
//! This module implements the class system with:
//! - `Class` registration by unique name
//! - Single inheritance and a metaclass per class for class methods
//! - `Method` registration, lookup and swizzling
//! - Runtime disposal of classes created on the fly
//!
//! # Architecture
//!
//! Classes are reference counted and registered by name until
//! [`Class::dispose`] is called. Every method table change bumps a global
//! generation counter; per-class dispatch caches are discarded when their
//! generation is stale, so swizzling a superclass is seen by subclasses.
//!
//! # Thread Safety
//!
//! The registry, method tables and caches are each behind an `RwLock`.
//! No lock is held while an implementation runs.

use crate::error::{Error, Result};
use crate::runtime::block::Block;
use crate::runtime::encoding::SignatureDescriptor;
use crate::runtime::object::{Object, ObjectPtr};
use crate::runtime::selector::{Selector, SelectorHandle};
use fxhash::FxHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// Native method implementation.
///
/// - `self`: the receiver
/// - `_cmd`: the selector being sent
/// - `args`: one pointer per argument after `self` and `_cmd`
/// - `ret`: storage for the return value (may be null when the caller
///   discards it)
///
/// # Safety
///
/// Implementations must read each argument with the layout given by the
/// method's type encoding, and write `ret` only for non-void returns.
pub type NativeImp = unsafe extern "C" fn(
    _self: ObjectPtr,
    _cmd: SelectorHandle,
    _args: *const *mut u8,
    _ret: *mut u8,
);

/// A method implementation: a native function or a block.
///
/// Block implementations receive every argument, `self` and `_cmd`
/// included.
#[derive(Clone)]
pub enum Imp {
    /// `extern "C"` function using the boxed-argument convention.
    Native(NativeImp),
    /// Closure implementation.
    Block(Block),
}

impl Imp {
    /// Returns `true` if both are the same function or the same block.
    #[must_use]
    pub fn ptr_eq(&self, other: &Imp) -> bool {
        match (self, other) {
            (Imp::Native(a), Imp::Native(b)) => std::ptr::fn_addr_eq(*a, *b),
            (Imp::Block(a), Imp::Block(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Calls the implementation.
    ///
    /// # Safety
    ///
    /// `args` must hold a valid pointer per argument of `signature`,
    /// starting with `self` and `_cmd`; `ret` must be null or point to
    /// storage for the return type.
    pub(crate) unsafe fn call(
        &self,
        signature: &SignatureDescriptor,
        args: &[*mut u8],
        ret: *mut u8,
    ) {
        match self {
            Imp::Native(function) => {
                // SAFETY: slots 0 and 1 hold the receiver and selector
                // (checked by the invocation engine).
                unsafe {
                    let receiver = args[0].cast::<ObjectPtr>().read_unaligned();
                    let selector = args[1].cast::<SelectorHandle>().read_unaligned();
                    function(receiver, selector, args[2..].as_ptr(), ret);
                }
            }
            // SAFETY: forwarded caller contract.
            Imp::Block(block) => unsafe { block.call(signature, args, ret) },
        }
    }
}

impl From<NativeImp> for Imp {
    fn from(function: NativeImp) -> Self {
        Imp::Native(function)
    }
}

impl From<Block> for Imp {
    fn from(block: Block) -> Self {
        Imp::Block(block)
    }
}

impl fmt::Debug for Imp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Imp::Native(function) => write!(f, "Imp::Native({:p})", *function as *const ()),
            Imp::Block(block) => write!(f, "Imp::{block:?}"),
        }
    }
}

/// `Method` representation with implementation and type encoding.
#[derive(Clone, Debug)]
pub struct Method {
    /// `Method` selector
    pub selector: Selector,
    /// Implementation
    pub imp: Imp,
    /// Type encoding (e.g., "v@:" for void return, id self, SEL _cmd)
    pub types: Arc<str>,
    /// Decoded `types`, shared by clones of this method.
    signature: Arc<OnceLock<Arc<SignatureDescriptor>>>,
}

impl Method {
    /// Creates a method.
    pub fn new(selector: Selector, imp: impl Into<Imp>, types: &str) -> Self {
        Method {
            selector,
            imp: imp.into(),
            types: Arc::from(types),
            signature: Arc::new(OnceLock::new()),
        }
    }

    /// Returns the decoded type encoding, parsing it on first use.
    ///
    /// # Errors
    ///
    /// Fails if `types` is not a valid method encoding.
    pub fn signature(&self) -> Result<Arc<SignatureDescriptor>> {
        if let Some(signature) = self.signature.get() {
            return Ok(Arc::clone(signature));
        }
        let parsed = Arc::new(SignatureDescriptor::parse_method(&self.types)?);
        Ok(Arc::clone(self.signature.get_or_init(|| parsed)))
    }
}

/// Bumped on every method table change anywhere.
static METHOD_GENERATION: AtomicU64 = AtomicU64::new(0);

fn bump_generation() {
    METHOD_GENERATION.fetch_add(1, Ordering::SeqCst);
}

#[derive(Default)]
struct MethodCache {
    generation: u64,
    entries: FxHashMap<Selector, Imp>,
}

pub(crate) struct ClassInner {
    name: Box<str>,
    super_class: Option<Class>,
    /// `None` for metaclasses.
    metaclass: Option<Class>,
    methods: RwLock<FxHashMap<Selector, Method>>,
    cache: RwLock<MethodCache>,
    class_object: OnceLock<Object>,
    disposed: AtomicBool,
}

type Registry = RwLock<FxHashMap<Box<str>, Class>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| RwLock::new(FxHashMap::default()))
}

/// A runtime class.
///
/// Handles are cheap to clone and compare by identity.
///
/// # Example
///
/// ```rust
/// use oxhook::{Block, Class, Method, Object, Selector};
/// use oxhook::runtime::dispatch::send_message;
///
/// let class = Class::new_root("DocCounter").unwrap();
/// let sel = Selector::new("answer").unwrap();
/// let imp = Block::opaque(|call| call.set_return_value(42i32).unwrap());
/// class.add_method(Method::new(sel, imp, "i@:")).unwrap();
///
/// let obj = Object::new(&class).unwrap();
/// let value: i32 = send_message(&obj, &sel, &[]).unwrap();
/// assert_eq!(value, 42);
/// ```
#[derive(Clone)]
pub struct Class {
    inner: Arc<ClassInner>,
}

impl Class {
    /// Creates and registers a class without a superclass.
    ///
    /// # Errors
    ///
    /// Returns `Error::ClassAlreadyExists` if the name is taken.
    pub fn new_root(name: &str) -> Result<Self> {
        Self::create(name, None)
    }

    /// Creates and registers a subclass of `super_class`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ClassAlreadyExists` if the name is taken and
    /// `Error::ClassNotRegistered` if `super_class` was disposed.
    pub fn new(name: &str, super_class: &Class) -> Result<Self> {
        if super_class.is_disposed() {
            return Err(Error::ClassNotRegistered {
                name: super_class.name().to_string(),
            });
        }
        Self::create(name, Some(super_class))
    }

    fn create(name: &str, super_class: Option<&Class>) -> Result<Self> {
        let mut classes = registry().write().unwrap_or_else(PoisonError::into_inner);
        if classes.contains_key(name) {
            return Err(Error::ClassAlreadyExists {
                name: name.to_string(),
            });
        }

        let metaclass = Class::from_inner(ClassInner::new(
            name,
            super_class.and_then(Class::metaclass),
            None,
        ));
        let class = Class::from_inner(ClassInner::new(
            name,
            super_class.cloned(),
            Some(metaclass),
        ));
        classes.insert(name.into(), class.clone());
        Ok(class)
    }

    fn from_inner(inner: ClassInner) -> Self {
        Class {
            inner: Arc::new(inner),
        }
    }

    /// Looks up a registered class by name.
    #[must_use]
    pub fn get(name: &str) -> Option<Class> {
        registry()
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Returns the class name. Metaclasses share their class's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the superclass, if any.
    #[must_use]
    pub fn super_class(&self) -> Option<Class> {
        self.inner.super_class.clone()
    }

    /// Returns the metaclass, which holds class methods. `None` when
    /// `self` is a metaclass.
    #[must_use]
    pub fn metaclass(&self) -> Option<Class> {
        self.inner.metaclass.clone()
    }

    /// Returns `true` for metaclasses.
    #[must_use]
    pub fn is_metaclass(&self) -> bool {
        self.inner.metaclass.is_none()
    }

    /// Returns the class object: the instance of the metaclass that
    /// receives class methods. `None` when `self` is a metaclass.
    #[must_use]
    pub fn class_object(&self) -> Option<Object> {
        let metaclass = self.inner.metaclass.as_ref()?;
        Some(
            self.inner
                .class_object
                .get_or_init(|| Object::alloc(metaclass.clone()))
                .clone(),
        )
    }

    /// Returns `true` after [`Class::dispose`].
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Adds a method to this class.
    ///
    /// # Errors
    ///
    /// Returns `Error::MethodAlreadyExists` if this class (not a
    /// superclass) already has a method for the selector.
    pub fn add_method(&self, method: Method) -> Result<()> {
        let mut methods = self.inner.methods.write().unwrap_or_else(PoisonError::into_inner);
        if methods.contains_key(&method.selector) {
            return Err(Error::MethodAlreadyExists {
                selector: method.selector.name().to_string(),
            });
        }
        methods.insert(method.selector, method);
        drop(methods);
        bump_generation();
        Ok(())
    }

    /// Returns the method defined by this class itself, without searching
    /// superclasses.
    #[must_use]
    pub fn method_without_super(&self, selector: &Selector) -> Option<Method> {
        self.inner
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(selector)
            .cloned()
    }

    /// Looks up a method in this class and its superclasses.
    #[must_use]
    pub fn lookup_method(&self, selector: &Selector) -> Option<Method> {
        let mut current = Some(self.clone());
        while let Some(class) = current {
            if let Some(method) = class.method_without_super(selector) {
                return Some(method);
            }
            current = class.super_class();
        }
        None
    }

    /// Looks up an implementation, using the dispatch cache.
    #[must_use]
    pub fn lookup_imp(&self, selector: &Selector) -> Option<Imp> {
        let generation = METHOD_GENERATION.load(Ordering::SeqCst);
        {
            let cache = self.inner.cache.read().unwrap_or_else(PoisonError::into_inner);
            if cache.generation == generation {
                if let Some(imp) = cache.entries.get(selector) {
                    return Some(imp.clone());
                }
            }
        }

        let imp = self.lookup_method(selector)?.imp;
        let mut cache = self.inner.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.generation != generation {
            cache.entries.clear();
            cache.generation = generation;
        }
        cache.entries.insert(*selector, imp.clone());
        Some(imp)
    }

    /// Returns `true` if this class or a superclass implements `selector`.
    #[must_use]
    pub fn responds_to(&self, selector: &Selector) -> bool {
        self.lookup_method(selector).is_some()
    }

    /// Returns `true` if `self` is `class` or inherits from it.
    #[must_use]
    pub fn is_subclass_of(&self, class: &Class) -> bool {
        let mut current = Some(self.clone());
        while let Some(candidate) = current {
            if candidate == *class {
                return true;
            }
            current = candidate.super_class();
        }
        false
    }

    /// Replaces the implementation of a method defined by this class,
    /// returning the previous implementation.
    ///
    /// Superclass methods are not touched.
    ///
    /// # Errors
    ///
    /// Returns `Error::SelectorNotFound` if this class does not define the
    /// selector itself.
    pub fn swizzle_method(&self, selector: &Selector, new_imp: Imp) -> Result<Imp> {
        let mut methods = self.inner.methods.write().unwrap_or_else(PoisonError::into_inner);
        let method = methods
            .get_mut(selector)
            .ok_or_else(|| Error::SelectorNotFound {
                selector: selector.name().to_string(),
            })?;
        let original = std::mem::replace(&mut method.imp, new_imp);
        drop(methods);
        bump_generation();
        Ok(original)
    }

    /// Unregisters the class and drops its methods.
    ///
    /// Instances still pointing at the class keep it alive but can no
    /// longer be created; a new class may reuse the name.
    ///
    /// # Errors
    ///
    /// Returns `Error::ClassNotRegistered` if the class was already
    /// disposed.
    pub fn dispose(&self) -> Result<()> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Err(Error::ClassNotRegistered {
                name: self.name().to_string(),
            });
        }
        {
            let mut classes = registry().write().unwrap_or_else(PoisonError::into_inner);
            if classes.get(self.name()).is_some_and(|c| c == self) {
                classes.remove(self.name());
            }
        }
        let methods = std::mem::take(
            &mut *self.inner.methods.write().unwrap_or_else(PoisonError::into_inner),
        );
        let metaclass_methods = self.inner.metaclass.as_ref().map(|meta| {
            std::mem::take(&mut *meta.inner.methods.write().unwrap_or_else(PoisonError::into_inner))
        });
        bump_generation();
        drop((methods, metaclass_methods));
        Ok(())
    }

    /// Returns a unique identifier for this class.
    #[must_use]
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl ClassInner {
    fn new(name: &str, super_class: Option<Class>, metaclass: Option<Class>) -> Self {
        ClassInner {
            name: name.into(),
            super_class,
            metaclass,
            methods: RwLock::new(FxHashMap::default()),
            cache: RwLock::new(MethodCache::default()),
            class_object: OnceLock::new(),
            disposed: AtomicBool::new(false),
        }
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Class {}

impl Hash for Class {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.id());
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_metaclass() {
            write!(f, "Class(meta {})", self.name())
        } else {
            write!(f, "Class({})", self.name())
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn return_7(
        _self: ObjectPtr,
        _cmd: SelectorHandle,
        _args: *const *mut u8,
        ret: *mut u8,
    ) {
        unsafe { ret.cast::<i32>().write_unaligned(7) };
    }

    unsafe extern "C" fn return_8(
        _self: ObjectPtr,
        _cmd: SelectorHandle,
        _args: *const *mut u8,
        ret: *mut u8,
    ) {
        unsafe { ret.cast::<i32>().write_unaligned(8) };
    }

    fn sel(name: &str) -> Selector {
        Selector::new(name).unwrap()
    }

    #[test]
    fn test_duplicate_class_name() {
        let _class = Class::new_root("ClassDuplicate").unwrap();
        assert!(matches!(
            Class::new_root("ClassDuplicate"),
            Err(Error::ClassAlreadyExists { .. })
        ));
        assert!(Class::get("ClassDuplicate").is_some());
    }

    #[test]
    fn test_inherited_lookup() {
        let parent = Class::new_root("ClassLookupParent").unwrap();
        let child = Class::new("ClassLookupChild", &parent).unwrap();
        parent
            .add_method(Method::new(sel("seven"), return_7 as NativeImp, "i@:"))
            .unwrap();

        assert!(child.method_without_super(&sel("seven")).is_none());
        assert!(child.lookup_method(&sel("seven")).is_some());
        assert!(child.responds_to(&sel("seven")));
        assert!(child.is_subclass_of(&parent));
        assert!(!parent.is_subclass_of(&child));
    }

    #[test]
    fn test_add_method_twice_fails() {
        let class = Class::new_root("ClassAddTwice").unwrap();
        class
            .add_method(Method::new(sel("seven"), return_7 as NativeImp, "i@:"))
            .unwrap();
        assert!(matches!(
            class.add_method(Method::new(sel("seven"), return_8 as NativeImp, "i@:")),
            Err(Error::MethodAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_colliding_selector_hashes_stay_distinct() {
        // These two names share an FxHash64 value.
        let a = sel("wBMSJOHd00AD050A");
        let b = sel("wJAImTIB60TyxZsu");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a, b);

        let class = Class::new_root("ClassHashCollision").unwrap();
        class
            .add_method(Method::new(a, return_7 as NativeImp, "i@:"))
            .unwrap();
        assert!(class.responds_to(&a));
        assert!(!class.responds_to(&b));
        assert!(class.lookup_imp(&b).is_none());

        class
            .add_method(Method::new(b, return_8 as NativeImp, "i@:"))
            .unwrap();
        assert!(class.lookup_imp(&a).unwrap().ptr_eq(&Imp::Native(return_7)));
        assert!(class.lookup_imp(&b).unwrap().ptr_eq(&Imp::Native(return_8)));

        class.swizzle_method(&b, Imp::Native(return_7)).unwrap();
        assert!(class.method_without_super(&a).unwrap().imp.ptr_eq(&Imp::Native(return_7)));
        assert_eq!(class.method_without_super(&b).unwrap().selector, b);
    }

    #[test]
    fn test_method_signature_is_parsed_once() {
        let class = Class::new_root("ClassMethodSignature").unwrap();
        class
            .add_method(Method::new(sel("seven"), return_7 as NativeImp, "i@:"))
            .unwrap();
        let first = class.lookup_method(&sel("seven")).unwrap().signature().unwrap();
        let second = class.lookup_method(&sel("seven")).unwrap().signature().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.to_string(), "i@:");

        let broken = Method::new(sel("broken"), return_7 as NativeImp, "i");
        assert!(matches!(broken.signature(), Err(Error::InvalidEncoding { .. })));
    }

    #[test]
    fn test_swizzle_invalidates_subclass_cache() {
        let parent = Class::new_root("ClassCacheParent").unwrap();
        let child = Class::new("ClassCacheChild", &parent).unwrap();
        parent
            .add_method(Method::new(sel("seven"), return_7 as NativeImp, "i@:"))
            .unwrap();

        let before = child.lookup_imp(&sel("seven")).unwrap();
        assert!(before.ptr_eq(&Imp::Native(return_7)));

        let original = parent
            .swizzle_method(&sel("seven"), Imp::Native(return_8))
            .unwrap();
        assert!(original.ptr_eq(&Imp::Native(return_7)));
        let after = child.lookup_imp(&sel("seven")).unwrap();
        assert!(after.ptr_eq(&Imp::Native(return_8)));
    }

    #[test]
    fn test_swizzle_only_own_methods() {
        let parent = Class::new_root("ClassSwizzleParent").unwrap();
        let child = Class::new("ClassSwizzleChild", &parent).unwrap();
        parent
            .add_method(Method::new(sel("seven"), return_7 as NativeImp, "i@:"))
            .unwrap();
        assert!(matches!(
            child.swizzle_method(&sel("seven"), Imp::Native(return_8)),
            Err(Error::SelectorNotFound { .. })
        ));
    }

    #[test]
    fn test_metaclass_and_class_object() {
        let parent = Class::new_root("ClassMetaParent").unwrap();
        let child = Class::new("ClassMetaChild", &parent).unwrap();
        let meta = child.metaclass().unwrap();
        assert!(meta.is_metaclass());
        assert_eq!(meta.super_class(), parent.metaclass());
        assert!(meta.metaclass().is_none());

        let object = child.class_object().unwrap();
        assert!(object.is_class_object());
        assert_eq!(object, child.class_object().unwrap());
        assert!(meta.class_object().is_none());
    }

    #[test]
    fn test_dispose_frees_name() {
        let class = Class::new_root("ClassDisposeMe").unwrap();
        class.dispose().unwrap();
        assert!(class.is_disposed());
        assert!(Class::get("ClassDisposeMe").is_none());
        assert!(matches!(
            class.dispose(),
            Err(Error::ClassNotRegistered { .. })
        ));
        let again = Class::new_root("ClassDisposeMe").unwrap();
        assert_ne!(again, class);
    }
}
