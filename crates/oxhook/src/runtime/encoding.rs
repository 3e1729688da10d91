//! Type encodings and signature descriptors.
//!
//! Methods and blocks describe their arguments with Objective-C style
//! `@encode` strings. This module parses them into [`TypeDescriptor`]
//! trees and computes the C layout (size, alignment, field offsets) the
//! invocation engine needs to marshal values of that type.
//!
//! # Supported Encodings
//!
//! | Code | Type |
//! |------|------|
//! | `v` | void |
//! | `c` `C` `B` | 8-bit integers and bool |
//! | `s` `S` | 16-bit integers |
//! | `i` `I` | 32-bit integers |
//! | `l` `L` `q` `Q` | 64-bit integers |
//! | `f` `d` | float, double |
//! | `*` | C string |
//! | `:` | selector |
//! | `#` | class |
//! | `@` `@"Name"` | object |
//! | `@?` `@?<sig>` | block, optionally with its signature |
//! | `^type` | pointer |
//! | `{Name=fields}` | structure |
//!
//! Type qualifiers (`r n N o O R V A j`) and frame offsets are skipped.
//! Bit-fields, unions, vectors, `long double`, bare `?`, structures with
//! no fields and top-level arrays are rejected with
//! `Error::UnsupportedType`, as are types nested deeper than
//! [`MAX_NESTING`] levels and array fields that would expand past
//! [`MAX_EXPANDED_FIELDS`] entries.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

const POINTER_SIZE: usize = std::mem::size_of::<usize>();

/// Deepest nesting of structures and block signatures a parser accepts.
pub const MAX_NESTING: usize = 64;

/// Most type nodes array fields (`[N type]`) may expand to in one encoding.
pub const MAX_EXPANDED_FIELDS: usize = 4096;

/// What a pointer-sized argument points to.
///
/// Only affects equality; every kind has pointer layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    /// `@`
    Object,
    /// `#`
    Class,
    /// `:`
    Selector,
    /// `*`
    CString,
    /// `^type`
    Raw,
}

/// A decoded type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDescriptor {
    /// No value.
    Void,
    /// Integer of `width` bytes.
    Integer {
        /// Width in bytes (1, 2, 4 or 8).
        width: u8,
        /// Whether the integer is signed.
        signed: bool,
    },
    /// IEEE float of `width` bytes.
    Floating {
        /// Width in bytes (4 or 8).
        width: u8,
    },
    /// Pointer-sized reference.
    Pointer(PointerKind),
    /// C structure passed by value.
    Structure {
        /// Structure tag, `None` for anonymous (`?`) structures.
        name: Option<String>,
        /// Field types in declaration order.
        fields: Vec<TypeDescriptor>,
    },
    /// Block reference, with the block's own signature when declared.
    Callable(Option<Arc<SignatureDescriptor>>),
}

impl TypeDescriptor {
    /// Parses a single type.
    ///
    /// # Errors
    ///
    /// `Error::InvalidEncoding` for malformed input or trailing characters,
    /// `Error::UnsupportedType` for types the engine cannot marshal.
    pub fn parse(encoding: &str) -> Result<Self> {
        let mut parser = Parser::new(encoding);
        let ty = parser.parse_type()?;
        parser.skip_offset();
        if !parser.at_end() {
            return Err(parser.invalid());
        }
        Ok(ty)
    }

    /// Returns the size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            TypeDescriptor::Void => 0,
            TypeDescriptor::Integer { width, .. }
            | TypeDescriptor::Floating { width } => usize::from(*width),
            TypeDescriptor::Pointer(_) | TypeDescriptor::Callable(_) => {
                POINTER_SIZE
            }
            TypeDescriptor::Structure { fields, .. } => {
                struct_layout(fields).0
            }
        }
    }

    /// Returns the alignment in bytes.
    #[must_use]
    pub fn align(&self) -> usize {
        match self {
            TypeDescriptor::Void => 1,
            TypeDescriptor::Integer { width, .. }
            | TypeDescriptor::Floating { width } => usize::from(*width),
            TypeDescriptor::Pointer(_) | TypeDescriptor::Callable(_) => {
                POINTER_SIZE
            }
            TypeDescriptor::Structure { fields, .. } => {
                struct_layout(fields).1
            }
        }
    }

    /// Returns the byte offset of each field. Empty for non-structures.
    #[must_use]
    pub fn field_offsets(&self) -> Vec<usize> {
        match self {
            TypeDescriptor::Structure { fields, .. } => {
                struct_layout(fields).2
            }
            _ => Vec::new(),
        }
    }

    /// Returns `true` for `Void`.
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, TypeDescriptor::Void)
    }

    /// Compares two types the way closure compatibility needs.
    ///
    /// Structure tags are ignored, object and class pointers are
    /// interchangeable, and a callable without a declared signature
    /// matches any callable.
    #[must_use]
    pub fn matches(&self, other: &TypeDescriptor) -> bool {
        use TypeDescriptor as T;
        match (self, other) {
            (T::Void, T::Void) => true,
            (
                T::Integer { width, signed },
                T::Integer {
                    width: other_width,
                    signed: other_signed,
                },
            ) => width == other_width && signed == other_signed,
            (T::Floating { width }, T::Floating { width: other_width }) => {
                width == other_width
            }
            (T::Pointer(a), T::Pointer(b)) => {
                a == b
                    || matches!(
                        (a, b),
                        (PointerKind::Object, PointerKind::Class)
                            | (PointerKind::Class, PointerKind::Object)
                    )
            }
            (T::Structure { fields: a, .. }, T::Structure { fields: b, .. }) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| x.matches(y))
            }
            (T::Callable(Some(a)), T::Callable(Some(b))) => a.matches(b),
            (T::Callable(_), T::Callable(_)) => true,
            _ => false,
        }
    }

    /// Returns `true` if a value of `other` can be stored in a slot of
    /// this type bit for bit.
    ///
    /// Used by typed reads and writes: signedness and pointer kinds are
    /// ignored, but sizes and register classes must agree.
    #[must_use]
    pub fn same_storage(&self, other: &TypeDescriptor) -> bool {
        use TypeDescriptor as T;
        match (self, other) {
            (T::Void, T::Void) => true,
            (T::Integer { width, .. }, T::Integer { width: w, .. })
            | (T::Floating { width }, T::Floating { width: w }) => width == w,
            (
                T::Pointer(_) | T::Callable(_),
                T::Pointer(_) | T::Callable(_),
            ) => true,
            (T::Structure { fields: a, .. }, T::Structure { fields: b, .. }) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| x.same_storage(y))
            }
            _ => false,
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Void => f.write_str("v"),
            TypeDescriptor::Integer { width, signed } => {
                let code = match (width, signed) {
                    (1, true) => "c",
                    (1, false) => "C",
                    (2, true) => "s",
                    (2, false) => "S",
                    (4, true) => "i",
                    (4, false) => "I",
                    (_, true) => "q",
                    (_, false) => "Q",
                };
                f.write_str(code)
            }
            TypeDescriptor::Floating { width } => {
                f.write_str(if *width == 4 { "f" } else { "d" })
            }
            TypeDescriptor::Pointer(kind) => f.write_str(match kind {
                PointerKind::Object => "@",
                PointerKind::Class => "#",
                PointerKind::Selector => ":",
                PointerKind::CString => "*",
                PointerKind::Raw => "^v",
            }),
            TypeDescriptor::Structure { name, fields } => {
                write!(f, "{{{}=", name.as_deref().unwrap_or("?"))?;
                for field in fields {
                    write!(f, "{field}")?;
                }
                f.write_str("}")
            }
            TypeDescriptor::Callable(None) => f.write_str("@?"),
            TypeDescriptor::Callable(Some(signature)) => {
                write!(f, "@?<{signature}>")
            }
        }
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}

/// Returns (size, align, field offsets) using C struct rules.
fn struct_layout(fields: &[TypeDescriptor]) -> (usize, usize, Vec<usize>) {
    let mut offset = 0;
    let mut align = 1;
    let mut offsets = Vec::with_capacity(fields.len());
    for field in fields {
        let field_align = field.align();
        offset = align_up(offset, field_align);
        offsets.push(offset);
        offset += field.size();
        align = align.max(field_align);
    }
    (align_up(offset, align), align, offsets)
}

/// A decoded method or block signature.
///
/// For methods, `arguments` starts with the receiver and the selector.
/// Block signatures only list the block's declared parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureDescriptor {
    return_type: TypeDescriptor,
    arguments: Vec<TypeDescriptor>,
}

impl SignatureDescriptor {
    /// Builds a signature from already decoded parts.
    #[must_use]
    pub fn new(return_type: TypeDescriptor, arguments: Vec<TypeDescriptor>) -> Self {
        SignatureDescriptor {
            return_type,
            arguments,
        }
    }

    /// Parses a block signature: the return type followed by the
    /// parameter types.
    ///
    /// # Errors
    ///
    /// Same as [`TypeDescriptor::parse`]; an empty string is invalid.
    pub fn parse(encoding: &str) -> Result<Self> {
        let mut parser = Parser::new(encoding);
        let signature = parser.parse_signature(None)?;
        if !parser.at_end() {
            return Err(parser.invalid());
        }
        Ok(signature)
    }

    /// Parses a method signature, which must take a receiver (`@` or `#`)
    /// and a selector (`:`) first.
    ///
    /// # Errors
    ///
    /// Same as [`SignatureDescriptor::parse`], plus `Error::InvalidEncoding`
    /// when the receiver or selector is missing.
    pub fn parse_method(encoding: &str) -> Result<Self> {
        let signature = Self::parse(encoding)?;
        let receiver_ok = matches!(
            signature.arguments.first(),
            Some(TypeDescriptor::Pointer(
                PointerKind::Object | PointerKind::Class
            ))
        );
        let selector_ok = matches!(
            signature.arguments.get(1),
            Some(TypeDescriptor::Pointer(PointerKind::Selector))
        );
        if !(receiver_ok && selector_ok) {
            return Err(Error::InvalidEncoding {
                encoding: encoding.to_string(),
            });
        }
        Ok(signature)
    }

    /// Returns the return type.
    #[must_use]
    pub fn return_type(&self) -> &TypeDescriptor {
        &self.return_type
    }

    /// Returns the argument types.
    #[must_use]
    pub fn arguments(&self) -> &[TypeDescriptor] {
        &self.arguments
    }

    /// Returns the number of arguments.
    #[must_use]
    pub fn argument_count(&self) -> usize {
        self.arguments.len()
    }

    /// Compares return and argument types with [`TypeDescriptor::matches`].
    #[must_use]
    pub fn matches(&self, other: &SignatureDescriptor) -> bool {
        self.return_type.matches(&other.return_type)
            && self.arguments.len() == other.arguments.len()
            && self
                .arguments
                .iter()
                .zip(&other.arguments)
                .all(|(a, b)| a.matches(b))
    }
}

impl fmt::Display for SignatureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.return_type)?;
        for argument in &self.arguments {
            write!(f, "{argument}")?;
        }
        Ok(())
    }
}

const QUALIFIERS: &[u8] = b"rnNoORVAj";

struct Parser<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
    /// Type nodes materialized by array expansion so far.
    expanded: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Parser {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            depth: 0,
            expanded: 0,
        }
    }

    fn invalid(&self) -> Error {
        Error::InvalidEncoding {
            encoding: self.source.to_string(),
        }
    }

    fn unsupported(&self) -> Error {
        Error::UnsupportedType {
            encoding: self.source.to_string(),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next(&mut self) -> Result<u8> {
        let byte = self.peek().ok_or_else(|| self.invalid())?;
        self.pos += 1;
        Ok(byte)
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.next()? == byte {
            Ok(())
        } else {
            Err(self.invalid())
        }
    }

    fn skip_qualifiers(&mut self) {
        while self.peek().is_some_and(|b| QUALIFIERS.contains(&b)) {
            self.pos += 1;
        }
    }

    fn skip_offset(&mut self) {
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn read_number(&mut self) -> Result<usize> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        self.source[start..self.pos]
            .parse()
            .map_err(|_| self.invalid())
    }

    fn skip_quoted(&mut self) -> Result<()> {
        self.expect(b'"')?;
        while self.next()? != b'"' {}
        Ok(())
    }

    /// Skips past the closing `close`, the opening byte already consumed.
    fn skip_balanced(&mut self, open: u8, close: u8) -> Result<()> {
        let mut depth = 1usize;
        while depth > 0 {
            match self.next()? {
                b'"' => while self.next()? != b'"' {},
                b if b == open => depth += 1,
                b if b == close => depth -= 1,
                _ => {}
            }
        }
        Ok(())
    }

    /// Parses a return type followed by argument types, up to the end of
    /// input or the `terminator` byte (which is consumed).
    fn parse_signature(
        &mut self,
        terminator: Option<u8>,
    ) -> Result<SignatureDescriptor> {
        let return_type = self.parse_type()?;
        self.skip_offset();
        let mut arguments = Vec::new();
        loop {
            match (self.peek(), terminator) {
                (None, None) => break,
                (None, Some(_)) => return Err(self.invalid()),
                (Some(b), Some(t)) if b == t => {
                    self.pos += 1;
                    break;
                }
                _ => {
                    arguments.push(self.parse_type()?);
                    self.skip_offset();
                }
            }
        }
        Ok(SignatureDescriptor::new(return_type, arguments))
    }

    fn parse_type(&mut self) -> Result<TypeDescriptor> {
        if self.depth >= MAX_NESTING {
            return Err(self.unsupported());
        }
        self.depth += 1;
        let ty = self.parse_type_inner();
        self.depth -= 1;
        ty
    }

    fn parse_type_inner(&mut self) -> Result<TypeDescriptor> {
        self.skip_qualifiers();
        let ty = match self.next()? {
            b'v' => TypeDescriptor::Void,
            b'c' => integer(1, true),
            b'C' | b'B' => integer(1, false),
            b's' => integer(2, true),
            b'S' => integer(2, false),
            b'i' => integer(4, true),
            b'I' => integer(4, false),
            b'l' | b'q' => integer(8, true),
            b'L' | b'Q' => integer(8, false),
            b'f' => TypeDescriptor::Floating { width: 4 },
            b'd' => TypeDescriptor::Floating { width: 8 },
            b'*' => TypeDescriptor::Pointer(PointerKind::CString),
            b':' => TypeDescriptor::Pointer(PointerKind::Selector),
            b'#' => TypeDescriptor::Pointer(PointerKind::Class),
            b'@' => self.parse_object()?,
            b'^' => {
                self.skip_type()?;
                TypeDescriptor::Pointer(PointerKind::Raw)
            }
            b'{' => self.parse_structure()?,
            b'[' | b'(' | b'b' | b'!' | b'?' | b'D' => {
                return Err(self.unsupported());
            }
            _ => return Err(self.invalid()),
        };
        Ok(ty)
    }

    fn parse_object(&mut self) -> Result<TypeDescriptor> {
        match self.peek() {
            Some(b'?') => {
                self.pos += 1;
                if self.peek() == Some(b'<') {
                    self.pos += 1;
                    let signature = self.parse_signature(Some(b'>'))?;
                    Ok(TypeDescriptor::Callable(Some(Arc::new(signature))))
                } else {
                    Ok(TypeDescriptor::Callable(None))
                }
            }
            Some(b'"') => {
                self.skip_quoted()?;
                Ok(TypeDescriptor::Pointer(PointerKind::Object))
            }
            _ => Ok(TypeDescriptor::Pointer(PointerKind::Object)),
        }
    }

    fn parse_structure(&mut self) -> Result<TypeDescriptor> {
        let start = self.pos;
        while !matches!(self.peek(), Some(b'=' | b'}') | None) {
            self.pos += 1;
        }
        let name = &self.source[start..self.pos];
        if self.next()? == b'}' {
            // Forward-declared structure: no layout to marshal.
            return Err(self.unsupported());
        }

        let mut fields = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.invalid()),
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                Some(b'"') => self.skip_quoted()?,
                Some(b'[') => {
                    self.pos += 1;
                    let count = self.read_number()?;
                    let element = self.parse_type()?;
                    self.expect(b']')?;
                    self.reserve_expansion(count, &element)?;
                    fields.extend(std::iter::repeat_n(element, count));
                }
                Some(_) => fields.push(self.parse_type()?),
            }
        }

        if fields.is_empty() {
            return Err(self.unsupported());
        }
        let name = (!name.is_empty() && name != "?").then(|| name.to_string());
        Ok(TypeDescriptor::Structure { name, fields })
    }

    /// Accounts for `count` copies of `element`.
    fn reserve_expansion(&mut self, count: usize, element: &TypeDescriptor) -> Result<()> {
        let total = count
            .checked_mul(node_count(element))
            .and_then(|nodes| nodes.checked_add(self.expanded))
            .filter(|&total| total <= MAX_EXPANDED_FIELDS)
            .ok_or_else(|| self.unsupported())?;
        self.expanded = total;
        Ok(())
    }

    /// Skips a pointee type without decoding it.
    fn skip_type(&mut self) -> Result<()> {
        self.skip_qualifiers();
        let mut code = self.next()?;
        while code == b'^' {
            self.skip_qualifiers();
            code = self.next()?;
        }
        match code {
            b'@' => {
                match self.peek() {
                    Some(b'?') => {
                        self.pos += 1;
                        if self.peek() == Some(b'<') {
                            self.pos += 1;
                            self.skip_balanced(b'<', b'>')?;
                        }
                    }
                    Some(b'"') => self.skip_quoted()?,
                    _ => {}
                }
                Ok(())
            }
            b'{' => self.skip_balanced(b'{', b'}'),
            b'[' => self.skip_balanced(b'[', b']'),
            b'(' => self.skip_balanced(b'(', b')'),
            b'b' => self.read_number().map(|_| ()),
            _ => Ok(()),
        }
    }
}

const fn integer(width: u8, signed: bool) -> TypeDescriptor {
    TypeDescriptor::Integer { width, signed }
}

fn node_count(ty: &TypeDescriptor) -> usize {
    match ty {
        TypeDescriptor::Structure { fields, .. } => {
            1 + fields.iter().map(node_count).sum::<usize>()
        }
        _ => 1,
    }
}

/// Types with a fixed encoding that can be read from and written to
/// argument slots.
///
/// # Safety
///
/// `ENCODING` must describe the exact layout of `Self`: same size,
/// alignment and register class. Implement it for `#[repr(C)]` structures
/// whose fields are themselves `Encode`.
///
/// # Example
///
/// ```rust
/// use oxhook::Encode;
///
/// #[repr(C)]
/// #[derive(Clone, Copy)]
/// struct Point {
///     x: f64,
///     y: f64,
/// }
///
/// unsafe impl Encode for Point {
///     const ENCODING: &'static str = "{Point=dd}";
/// }
///
/// assert_eq!(Point::descriptor().unwrap().size(), 16);
/// ```
pub unsafe trait Encode: Copy + 'static {
    /// The `@encode` string of this type.
    const ENCODING: &'static str;

    /// Decodes [`Self::ENCODING`].
    ///
    /// # Errors
    ///
    /// Fails if the encoding is invalid or unsupported.
    fn descriptor() -> Result<TypeDescriptor> {
        TypeDescriptor::parse(Self::ENCODING)
    }
}

macro_rules! impl_encode {
    ($($ty:ty => $encoding:literal),* $(,)?) => {
        $(
            // SAFETY: the encoding matches the primitive's layout.
            unsafe impl Encode for $ty {
                const ENCODING: &'static str = $encoding;
            }
        )*
    };
}

impl_encode! {
    i8 => "c",
    u8 => "C",
    bool => "B",
    i16 => "s",
    u16 => "S",
    i32 => "i",
    u32 => "I",
    i64 => "q",
    u64 => "Q",
    isize => "q",
    usize => "Q",
    f32 => "f",
    f64 => "d",
    () => "v",
    *const std::ffi::c_char => "*",
    *mut std::ffi::c_void => "^v",
    *const std::ffi::c_void => "^v",
    crate::runtime::ObjectPtr => "@",
    crate::runtime::SelectorHandle => ":",
    crate::runtime::BlockPtr => "@?",
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(encoding: &str) -> SignatureDescriptor {
        SignatureDescriptor::parse(encoding).unwrap()
    }

    #[test]
    fn test_primitive_encodings() {
        assert_eq!(TypeDescriptor::parse("i").unwrap(), integer(4, true));
        assert_eq!(TypeDescriptor::parse("Q").unwrap(), integer(8, false));
        assert_eq!(TypeDescriptor::parse("l").unwrap().size(), 8);
        assert_eq!(TypeDescriptor::parse("B").unwrap().size(), 1);
        assert_eq!(
            TypeDescriptor::parse("d").unwrap(),
            TypeDescriptor::Floating { width: 8 }
        );
        assert_eq!(
            TypeDescriptor::parse("#").unwrap(),
            TypeDescriptor::Pointer(PointerKind::Class)
        );
    }

    #[test]
    fn test_method_signature_with_offsets_and_qualifiers() {
        let signature =
            SignatureDescriptor::parse_method("q32@0:8q16rn*24").unwrap();
        assert_eq!(signature.return_type(), &integer(8, true));
        assert_eq!(signature.argument_count(), 4);
        assert_eq!(
            signature.arguments()[3],
            TypeDescriptor::Pointer(PointerKind::CString)
        );
    }

    #[test]
    fn test_method_signature_requires_receiver_and_selector() {
        assert!(matches!(
            SignatureDescriptor::parse_method("v@i"),
            Err(Error::InvalidEncoding { .. })
        ));
        assert!(SignatureDescriptor::parse_method("v#:").is_ok());
    }

    #[test]
    fn test_structure_layout() {
        let ty = TypeDescriptor::parse("{Mixed=cid}").unwrap();
        assert_eq!(ty.size(), 16);
        assert_eq!(ty.align(), 8);
        assert_eq!(ty.field_offsets(), vec![0, 4, 8]);

        let ty = TypeDescriptor::parse("{Tail=dc}").unwrap();
        assert_eq!(ty.size(), 16);

        let nested = TypeDescriptor::parse("{Rect={Point=dd}{Size=dd}}").unwrap();
        assert_eq!(nested.size(), 32);
    }

    #[test]
    fn test_structure_with_field_names_and_arrays() {
        let ty =
            TypeDescriptor::parse("{Vec3=\"x\"f\"y\"f\"z\"f}").unwrap();
        assert_eq!(ty.size(), 12);
        let ty = TypeDescriptor::parse("{Matrix=[4f]i}").unwrap();
        match &ty {
            TypeDescriptor::Structure { fields, .. } => {
                assert_eq!(fields.len(), 5);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ty.size(), 20);
    }

    #[test]
    fn test_structure_names_ignored_by_matches() {
        let a = TypeDescriptor::parse("{CGPoint=dd}").unwrap();
        let b = TypeDescriptor::parse("{?=dd}").unwrap();
        assert!(a.matches(&b));
        assert_ne!(a, b);
        let c = TypeDescriptor::parse("{CGPoint=ff}").unwrap();
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_block_encodings() {
        assert_eq!(
            TypeDescriptor::parse("@?").unwrap(),
            TypeDescriptor::Callable(None)
        );
        let ty = TypeDescriptor::parse("@?<q@:qq>").unwrap();
        match &ty {
            TypeDescriptor::Callable(Some(inner)) => {
                assert_eq!(inner.argument_count(), 4);
                assert_eq!(inner.to_string(), "q@:qq");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(ty.matches(&TypeDescriptor::Callable(None)));

        let nested = sig("v@?<v@?<v>>i");
        assert_eq!(nested.argument_count(), 2);
    }

    #[test]
    fn test_pointer_pointee_is_skipped() {
        assert_eq!(
            TypeDescriptor::parse("^{Opaque}").unwrap(),
            TypeDescriptor::Pointer(PointerKind::Raw)
        );
        assert_eq!(
            TypeDescriptor::parse("^^?").unwrap(),
            TypeDescriptor::Pointer(PointerKind::Raw)
        );
        assert_eq!(sig("v^(U=if)").argument_count(), 1);
    }

    #[test]
    fn test_unsupported_types() {
        for encoding in ["D", "v@:b4", "v@:(U=if)", "v@:[4i]", "v@:?", "{Opaque}", "{Empty=}"]
        {
            assert!(
                matches!(
                    SignatureDescriptor::parse(encoding),
                    Err(Error::UnsupportedType { .. })
                ),
                "{encoding} should be unsupported"
            );
        }
    }

    #[test]
    fn test_array_expansion_is_bounded() {
        for encoding in [
            "v{S=[18446744073709551615c]}",
            "v{S=[5000c]}",
            "v{S=[64{T=[64{U=[64c]}]}]}",
            "v{S=[4000c]{T=[100c]}}",
        ] {
            assert!(
                matches!(
                    SignatureDescriptor::parse(encoding),
                    Err(Error::UnsupportedType { .. })
                ),
                "{encoding} should be unsupported"
            );
        }
        assert!(matches!(
            SignatureDescriptor::parse("v{S=[99999999999999999999999c]}"),
            Err(Error::InvalidEncoding { .. })
        ));

        let ty = TypeDescriptor::parse("{Big=[4096c]}").unwrap();
        assert_eq!(ty.size(), 4096);
        let ty = TypeDescriptor::parse("{S=[8{T=[8i]}]}").unwrap();
        assert_eq!(ty.size(), 256);
    }

    #[test]
    fn test_nesting_is_bounded() {
        let nested = |depth: usize| {
            format!("v{}c{}", "{S=".repeat(depth), "}".repeat(depth))
        };
        assert!(SignatureDescriptor::parse(&nested(MAX_NESTING - 1)).is_ok());
        assert!(matches!(
            SignatureDescriptor::parse(&nested(MAX_NESTING)),
            Err(Error::UnsupportedType { .. })
        ));
        assert!(matches!(
            SignatureDescriptor::parse(&nested(100_000)),
            Err(Error::UnsupportedType { .. })
        ));

        let blocks = format!("v{}v{}", "@?<".repeat(100_000), ">".repeat(100_000));
        assert!(matches!(
            SignatureDescriptor::parse(&blocks),
            Err(Error::UnsupportedType { .. })
        ));

        // Pointees are skipped without recursion.
        let pointers = format!("v{}v", "^".repeat(2_000_000));
        let signature = SignatureDescriptor::parse(&pointers).unwrap();
        assert_eq!(
            signature.arguments(),
            [TypeDescriptor::Pointer(PointerKind::Raw)]
        );
    }

    #[test]
    fn test_invalid_encodings() {
        for encoding in ["", "x", "{Point=dd", "@?<v@:"] {
            assert!(
                matches!(
                    SignatureDescriptor::parse(encoding),
                    Err(Error::InvalidEncoding { .. })
                ),
                "{encoding} should be invalid"
            );
        }
    }

    #[test]
    fn test_same_storage_ignores_sign_and_pointer_kind() {
        let signed = integer(4, true);
        let unsigned = integer(4, false);
        assert!(signed.same_storage(&unsigned));
        assert!(!signed.matches(&unsigned));
        let object = TypeDescriptor::Pointer(PointerKind::Object);
        assert!(object.same_storage(&TypeDescriptor::Callable(None)));
        assert!(!object.same_storage(&integer(8, true)));
    }

    #[test]
    fn test_display_roundtrip() {
        for encoding in ["v@:", "q@:qq", "{Point=dd}@:{Point=dd}", "v@?<i@:i>@:"] {
            assert_eq!(sig(encoding).to_string(), encoding);
        }
    }

    #[test]
    fn test_encode_descriptors() {
        assert_eq!(i32::descriptor().unwrap().size(), 4);
        assert!(<()>::descriptor().unwrap().is_void());
        assert_eq!(
            crate::runtime::BlockPtr::descriptor().unwrap(),
            TypeDescriptor::Callable(None)
        );
    }
}
