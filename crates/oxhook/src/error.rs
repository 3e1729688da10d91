//! Error types for `OxHook`.
//!
//! One enum covers both the runtime (classes, selectors, encodings,
//! invocations) and the hook engine. Hook-level failures are reported to
//! the caller of `hook_*`/`cancel`. Nothing is retried.

use crate::hook::Mode;
use std::fmt;

/// Errors that can occur in the runtime or the hook engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Class name already exists in registry.
    ClassAlreadyExists {
        /// The requested class name.
        name: String,
    },

    /// The class was disposed and can no longer be used.
    ClassNotRegistered {
        /// The class name.
        name: String,
    },

    /// Selector name is empty or contains invalid characters.
    InvalidSelector {
        /// The rejected name.
        name: String,
    },

    /// Malformed type encoding string.
    InvalidEncoding {
        /// The full encoding that failed to parse.
        encoding: String,
    },

    /// Well-formed encoding that the engine cannot marshal (bit-fields,
    /// unions, vectors, long double, opaque value structs, C arrays).
    UnsupportedType {
        /// The full encoding containing the unsupported type.
        encoding: String,
    },

    /// Selector not found in class or inheritance chain.
    SelectorNotFound {
        /// The selector name.
        selector: String,
    },

    /// The class already defines a method for this selector.
    MethodAlreadyExists {
        /// The selector name.
        selector: String,
    },

    /// Argument count mismatch for a signature.
    ArgumentCountMismatch {
        /// Expected number of arguments
        expected: usize,
        /// Actual number of arguments provided
        got: usize,
    },

    /// Argument type mismatch for a signature.
    ArgumentTypeMismatch {
        /// Argument index
        index: usize,
        /// Expected type encoding
        expected: String,
        /// Actual type encoding
        got: String,
    },

    /// Return value type mismatch for a signature.
    ReturnTypeMismatch {
        /// Expected type encoding
        expected: String,
        /// Actual type encoding
        got: String,
    },

    /// Neither the class nor any superclass implements the selector.
    NoRespondingMethod {
        /// Class name.
        class: String,
        /// Selector name.
        selector: String,
    },

    /// The closure was created without a signature.
    MissingSignature,

    /// The closure's signature does not fit the method for the mode.
    IncompatibleClosureSignature {
        /// Requested hook mode.
        mode: Mode,
        /// Method type encoding.
        method: String,
        /// Closure type encoding.
        closure: String,
    },

    /// Class objects must be hooked through the class-method API.
    CanNotHookClassWithObjectApi,

    /// `dealloc` was requested on an instance whose class has no `dealloc`.
    UnsupportedHookPureObjectDealloc,

    /// The instance already carries hooks installed by another manager.
    InstanceHookedByAnotherManager,

    /// An internal invariant was violated.
    InternalError {
        /// Source file where the violation was detected.
        file: &'static str,
        /// Source line where the violation was detected.
        line: u32,
    },
}

impl Error {
    /// Builds an `InternalError`, logging it together with a backtrace
    /// when the `internal_backtrace` feature is enabled.
    ///
    /// Called through the crate's `internal_error!` macro.
    #[doc(hidden)]
    #[must_use]
    pub fn internal(file: &'static str, line: u32) -> Self {
        oxhook_log::error!("internal error at {file}:{line}");
        #[cfg(feature = "internal_backtrace")]
        oxhook_log::error!("{:?}", backtrace::Backtrace::new());
        Error::InternalError { file, line }
    }
}

/// Creates an [`Error::InternalError`] carrying the current file and line.
macro_rules! internal_error {
    () => {
        $crate::error::Error::internal(file!(), line!())
    };
}

pub(crate) use internal_error;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ClassAlreadyExists { name } => {
                write!(f, "Class name already exists in registry: {name}")
            }
            Error::ClassNotRegistered { name } => {
                write!(f, "Class {name} has been disposed")
            }
            Error::InvalidSelector { name } => {
                write!(f, "Invalid selector name: '{name}'")
            }
            Error::InvalidEncoding { encoding } => {
                write!(f, "Invalid type encoding string: '{encoding}'")
            }
            Error::UnsupportedType { encoding } => {
                write!(f, "Unsupported type in encoding '{encoding}'")
            }
            Error::SelectorNotFound { selector } => {
                write!(
                    f,
                    "Selector '{selector}' not found in class or inheritance chain"
                )
            }
            Error::MethodAlreadyExists { selector } => {
                write!(f, "Method '{selector}' already exists in class")
            }
            Error::ArgumentCountMismatch { expected, got } => {
                write!(
                    f,
                    "Argument count mismatch: expected {expected}, got {got}"
                )
            }
            Error::ArgumentTypeMismatch {
                index,
                expected,
                got,
            } => {
                write!(
                    f,
                    "Argument type mismatch at index {index}: expected '{expected}', got '{got}'"
                )
            }
            Error::ReturnTypeMismatch { expected, got } => {
                write!(
                    f,
                    "Return type mismatch: expected '{expected}', got '{got}'"
                )
            }
            Error::NoRespondingMethod { class, selector } => {
                write!(f, "{class} does not respond to '{selector}'")
            }
            Error::MissingSignature => {
                write!(f, "Closure has no signature")
            }
            Error::IncompatibleClosureSignature {
                mode,
                method,
                closure,
            } => {
                write!(
                    f,
                    "Closure signature '{closure}' is incompatible with method signature '{method}' for {mode} hooks"
                )
            }
            Error::CanNotHookClassWithObjectApi => {
                write!(
                    f,
                    "Class objects can not be hooked with the object API; hook the class method instead"
                )
            }
            Error::UnsupportedHookPureObjectDealloc => {
                write!(
                    f,
                    "Can not hook dealloc on an instance whose class does not implement dealloc"
                )
            }
            Error::InstanceHookedByAnotherManager => {
                write!(f, "Instance is already hooked by another hook manager")
            }
            Error::InternalError { file, line } => {
                write!(f, "Internal error at {file}:{line}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type alias for `OxHook` operations.
pub type Result<T> = std::result::Result<T, Error>;
