//! Method identities and closure compatibility.

use crate::error::{Error, Result};
use crate::hook::Mode;
use crate::runtime::{Block, Class, Selector, SignatureDescriptor, TypeDescriptor};
use fxhash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// A (class, selector) pair. Each hook context is keyed by one.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MethodIdentity {
    /// The class whose method table is hooked.
    pub class: Class,
    /// The hooked selector.
    pub selector: Selector,
}

impl MethodIdentity {
    /// Creates an identity.
    #[must_use]
    pub fn new(class: Class, selector: Selector) -> Self {
        MethodIdentity { class, selector }
    }
}

impl fmt::Display for MethodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.class.is_metaclass() { '+' } else { '-' };
        write!(f, "{prefix}[{} {}]", self.class.name(), self.selector)
    }
}

/// Decoded method signatures, shared by type encoding.
#[derive(Default)]
pub(crate) struct SignatureCache {
    entries: FxHashMap<Arc<str>, Arc<SignatureDescriptor>>,
}

impl SignatureCache {
    /// Decodes the signature of the method `identity` resolves to,
    /// searching superclasses.
    pub(crate) fn method_signature(
        &mut self,
        identity: &MethodIdentity,
    ) -> Result<Arc<SignatureDescriptor>> {
        let method = identity
            .class
            .lookup_method(&identity.selector)
            .ok_or_else(|| Error::NoRespondingMethod {
                class: identity.class.name().to_string(),
                selector: identity.selector.name().to_string(),
            })?;
        if let Some(signature) = self.entries.get(&method.types) {
            return Ok(Arc::clone(signature));
        }
        let signature = method.signature()?;
        self.entries.insert(method.types, Arc::clone(&signature));
        Ok(signature)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Returns the declared signature of a hook closure.
///
/// # Errors
///
/// Returns `Error::MissingSignature` for blocks created with
/// [`Block::opaque`].
pub fn closure_signature(closure: &Block) -> Result<Arc<SignatureDescriptor>> {
    closure.signature().cloned().ok_or(Error::MissingSignature)
}

/// Checks whether a closure signature fits a method signature for `mode`.
///
/// - before/after: void return, parameters are a prefix (possibly empty)
///   of (receiver, selector, arguments...)
/// - instead: the first parameter is a block whose signature matches the
///   method, followed by exactly the method's parameters, with the same
///   return type
#[must_use]
pub fn is_compatible(
    method: &SignatureDescriptor,
    mode: Mode,
    closure: &SignatureDescriptor,
) -> bool {
    match mode {
        Mode::Before | Mode::After => {
            closure.return_type().is_void()
                && closure.argument_count() <= method.argument_count()
                && closure
                    .arguments()
                    .iter()
                    .zip(method.arguments())
                    .all(|(c, m)| c.matches(m))
        }
        Mode::Instead => {
            let Some((first, rest)) = closure.arguments().split_first() else {
                return false;
            };
            let TypeDescriptor::Callable(Some(original)) = first else {
                return false;
            };
            original.matches(method)
                && closure.return_type().matches(method.return_type())
                && rest.len() == method.argument_count()
                && rest.iter().zip(method.arguments()).all(|(c, m)| c.matches(m))
        }
    }
}

/// [`is_compatible`] as a `Result`.
pub(crate) fn check_compatible(
    method: &SignatureDescriptor,
    mode: Mode,
    closure: &SignatureDescriptor,
) -> Result<()> {
    if is_compatible(method, mode, closure) {
        Ok(())
    } else {
        Err(Error::IncompatibleClosureSignature {
            mode,
            method: method.to_string(),
            closure: closure.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(encoding: &str) -> SignatureDescriptor {
        SignatureDescriptor::parse(encoding).unwrap()
    }

    #[test]
    fn test_before_accepts_prefixes() {
        let method = sig("q@:qq");
        for closure in ["v", "v@", "v@:", "v@:q", "v@:qq"] {
            assert!(is_compatible(&method, Mode::Before, &sig(closure)), "{closure}");
            assert!(is_compatible(&method, Mode::After, &sig(closure)), "{closure}");
        }
    }

    #[test]
    fn test_before_rejects_bad_closures() {
        let method = sig("q@:qq");
        for closure in ["q@:", "v@:qqq", "v@:i", "v:"] {
            assert!(!is_compatible(&method, Mode::Before, &sig(closure)), "{closure}");
        }
    }

    #[test]
    fn test_instead_requires_matching_original() {
        let method = sig("q@:qq");
        assert!(is_compatible(&method, Mode::Instead, &sig("q@?<q@:qq>@:qq")));
        // Wrong return type.
        assert!(!is_compatible(&method, Mode::Instead, &sig("v@?<q@:qq>@:qq")));
        // Original callable has no signature.
        assert!(!is_compatible(&method, Mode::Instead, &sig("q@?@:qq")));
        // Original callable has the wrong signature.
        assert!(!is_compatible(&method, Mode::Instead, &sig("q@?<q@:q>@:qq")));
        // Missing trailing argument.
        assert!(!is_compatible(&method, Mode::Instead, &sig("q@?<q@:qq>@:q")));
        // No arguments at all.
        assert!(!is_compatible(&method, Mode::Instead, &sig("q")));
    }

    #[test]
    fn test_structure_names_are_ignored() {
        let method = sig("{CGRect={CGPoint=dd}{CGSize=dd}}@:{CGPoint=dd}");
        let closure = sig("{?={?=dd}{?=dd}}@?<{R={P=dd}{S=dd}}@:{P=dd}>@:{P=dd}");
        assert!(is_compatible(&method, Mode::Instead, &closure));
    }

    #[test]
    fn test_opaque_block_arguments_match_any_block() {
        let method = sig("v@:@?<v@>");
        assert!(is_compatible(&method, Mode::Before, &sig("v@:@?")));
    }

    #[test]
    fn test_check_compatible_reports_both_encodings() {
        let err = check_compatible(&sig("v@:"), Mode::After, &sig("i@:")).unwrap_err();
        assert_eq!(
            err,
            Error::IncompatibleClosureSignature {
                mode: Mode::After,
                method: "v@:".to_string(),
                closure: "i@:".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_signature() {
        let block = Block::opaque(|_| {});
        assert_eq!(closure_signature(&block).unwrap_err(), Error::MissingSignature);
    }

    #[test]
    fn test_method_identity_display() {
        let class = Class::new_root("IdentityDisplay").unwrap();
        let sel = Selector::new("run:").unwrap();
        assert_eq!(
            MethodIdentity::new(class.clone(), sel).to_string(),
            "-[IdentityDisplay run:]"
        );
        assert_eq!(
            MethodIdentity::new(class.metaclass().unwrap(), sel).to_string(),
            "+[IdentityDisplay run:]"
        );
    }

    #[test]
    fn test_signature_cache_reuses_descriptors() {
        let class = Class::new_root("SignatureCacheReuse").unwrap();
        let a = Selector::new("first").unwrap();
        let b = Selector::new("second").unwrap();
        for sel in [a, b] {
            class
                .add_method(crate::runtime::Method::new(sel, Block::opaque(|_| {}), "v@:"))
                .unwrap();
        }
        let mut cache = SignatureCache::default();
        let first = cache.method_signature(&MethodIdentity::new(class.clone(), a)).unwrap();
        let second = cache.method_signature(&MethodIdentity::new(class.clone(), b)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        let missing = Selector::new("third").unwrap();
        assert!(matches!(
            cache.method_signature(&MethodIdentity::new(class, missing)),
            Err(Error::NoRespondingMethod { .. })
        ));
    }
}
