//! `Selector` interning for the `OxHook` runtime.
//!
//! Each unique selector name maps to exactly one interned entry that lives
//! for the rest of the program. Comparison is pointer equality and the hash
//! is computed once, at interning time, with `FxHash`.
//!
//! # Thread Safety
//!
//! The registry is a single `RwLock`. A hit only takes the read lock; a
//! miss re-checks under the write lock before inserting.

use crate::error::{Error, Result};
use fxhash::FxHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{OnceLock, PoisonError, RwLock};

/// Name of the selector sent to an instance right before it is destroyed.
pub const DEALLOC: &str = "dealloc";

/// Opaque handle to a selector for the native method ABI.
///
/// This is the `_cmd` argument of a [`NativeImp`](crate::runtime::NativeImp).
/// Convert it back with [`Selector::from_handle`].
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SelectorHandle(*const InternedSelector);

impl SelectorHandle {
    /// Returns the null handle.
    #[must_use]
    pub const fn null() -> Self {
        SelectorHandle(std::ptr::null())
    }

    /// Returns `true` if this handle does not refer to a selector.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

struct InternedSelector {
    name: Box<str>,
    hash: u64,
}

type Registry = RwLock<FxHashMap<&'static str, &'static InternedSelector>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| RwLock::new(FxHashMap::default()))
}

/// An interned method name.
///
/// Equal names give equal selectors.
///
/// # Example
///
/// ```rust
/// use oxhook::Selector;
/// use std::str::FromStr;
///
/// let a = Selector::from_str("sumWith:and:").unwrap();
/// let b = Selector::from_str("sumWith:and:").unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.hash(), b.hash());
/// ```
#[derive(Copy, Clone)]
pub struct Selector {
    inner: &'static InternedSelector,
}

impl Selector {
    /// Interns `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSelector` if `name` is empty or contains
    /// characters other than ASCII alphanumerics, `_` and `:`.
    pub fn new(name: &str) -> Result<Self> {
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b':')
            && !name.as_bytes()[0].is_ascii_digit();
        if !valid {
            return Err(Error::InvalidSelector {
                name: name.to_string(),
            });
        }
        Ok(Self::intern(name))
    }

    /// Returns the `dealloc` selector.
    #[must_use]
    pub fn dealloc() -> Self {
        Self::intern(DEALLOC)
    }

    fn intern(name: &str) -> Self {
        let registry = registry();
        if let Some(&inner) = registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Selector { inner };
        }

        let mut entries =
            registry.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(&inner) = entries.get(name) {
            return Selector { inner };
        }

        let inner: &'static InternedSelector =
            Box::leak(Box::new(InternedSelector {
                name: name.into(),
                hash: fxhash::hash64(name),
            }));
        entries.insert(&*inner.name, inner);
        Selector { inner }
    }

    /// Returns the selector name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        &self.inner.name
    }

    /// Returns the precomputed hash.
    #[must_use]
    pub fn hash(&self) -> u64 {
        self.inner.hash
    }

    /// Returns the handle passed as `_cmd` to native implementations.
    #[must_use]
    pub fn as_handle(&self) -> SelectorHandle {
        SelectorHandle(std::ptr::from_ref(self.inner))
    }

    /// Converts a handle back to a selector.
    ///
    /// Returns `None` for the null handle.
    ///
    /// # Safety
    ///
    /// `handle` must be null or have been obtained from
    /// [`Selector::as_handle`].
    #[must_use]
    pub unsafe fn from_handle(handle: SelectorHandle) -> Option<Self> {
        // SAFETY: interned selectors are leaked and never freed, so a
        // handle from `as_handle` points to a live `InternedSelector`.
        unsafe { handle.0.as_ref() }.map(|inner| Selector { inner })
    }

    /// Returns `true` if this is the `dealloc` selector.
    #[must_use]
    pub fn is_dealloc(&self) -> bool {
        self.name() == DEALLOC
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Selector::new(s)
    }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.inner, other.inner)
    }
}

impl Eq for Selector {}

impl Hash for Selector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.inner.hash);
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({})", self.name())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
