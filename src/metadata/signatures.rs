//! Type signatures for fields, locals, parameters and type specifications.
//!
//! This is the subset of the ECMA-335 signature grammar (II.23.2.12) the rewriter needs to
//! describe captured storage and synthesized members. Generic method parameters can be lifted
//! into type parameters with [`GenericContext`] when code moves from a generic method into a
//! synthesized generic type.

use std::fmt;

use crate::metadata::token::Token;

/// A type signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    /// `void`, only valid as a return type
    Void,
    /// `bool`
    Boolean,
    /// `int32`
    I4,
    /// `int64`
    I8,
    /// `float32`
    R4,
    /// `float64`
    R8,
    /// `native int`
    IntPtr,
    /// `string`
    String,
    /// `object`
    Object,
    /// A reference type named by a TypeDef or TypeRef token
    Class(Token),
    /// A value type named by a TypeDef or TypeRef token
    ValueType(Token),
    /// A managed pointer
    ByRef(Box<TypeSig>),
    /// A single-dimensional, zero-based array
    SzArray(Box<TypeSig>),
    /// `!n`, a generic parameter of the enclosing type
    GenericParam(u16),
    /// `!!n`, a generic parameter of the enclosing method
    MethodGenericParam(u16),
    /// A generic type instantiated with arguments
    GenericInst(Token, Vec<TypeSig>),
}

impl TypeSig {
    /// Returns `true` for managed pointers.
    #[must_use]
    pub fn is_byref(&self) -> bool {
        matches!(self, TypeSig::ByRef(_))
    }

    /// Returns `true` if `!!n` appears anywhere in the signature.
    #[must_use]
    pub fn mentions_method_generics(&self) -> bool {
        match self {
            TypeSig::MethodGenericParam(_) => true,
            TypeSig::ByRef(inner) | TypeSig::SzArray(inner) => inner.mentions_method_generics(),
            TypeSig::GenericInst(_, args) => args.iter().any(TypeSig::mentions_method_generics),
            _ => false,
        }
    }

    /// Returns `true` if any generic parameter (`!n` or `!!n`) appears in the signature.
    #[must_use]
    pub fn mentions_generics(&self) -> bool {
        match self {
            TypeSig::GenericParam(_) | TypeSig::MethodGenericParam(_) => true,
            TypeSig::ByRef(inner) | TypeSig::SzArray(inner) => inner.mentions_generics(),
            TypeSig::GenericInst(_, args) => args.iter().any(TypeSig::mentions_generics),
            _ => false,
        }
    }

    /// Signature of a generic type as seen from inside itself: `T<!0, !1, ...>`.
    ///
    /// Non-generic types collapse to a plain [`TypeSig::Class`].
    #[must_use]
    pub fn self_instance(token: Token, generic_count: u16) -> Self {
        if generic_count == 0 {
            TypeSig::Class(token)
        } else {
            TypeSig::GenericInst(token, (0..generic_count).map(TypeSig::GenericParam).collect())
        }
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Void => write!(f, "void"),
            TypeSig::Boolean => write!(f, "bool"),
            TypeSig::I4 => write!(f, "int32"),
            TypeSig::I8 => write!(f, "int64"),
            TypeSig::R4 => write!(f, "float32"),
            TypeSig::R8 => write!(f, "float64"),
            TypeSig::IntPtr => write!(f, "native int"),
            TypeSig::String => write!(f, "string"),
            TypeSig::Object => write!(f, "object"),
            TypeSig::Class(token) => write!(f, "class {token}"),
            TypeSig::ValueType(token) => write!(f, "valuetype {token}"),
            TypeSig::ByRef(inner) => write!(f, "{inner}&"),
            TypeSig::SzArray(inner) => write!(f, "{inner}[]"),
            TypeSig::GenericParam(index) => write!(f, "!{index}"),
            TypeSig::MethodGenericParam(index) => write!(f, "!!{index}"),
            TypeSig::GenericInst(token, args) => {
                write!(f, "{token}<")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ">")
            }
        }
    }
}

/// Generic parameter layout of a method being rewritten.
///
/// Synthesized types declare the owner type's generic parameters followed by the owner
/// method's, so `!!n` in the owner method becomes `!(type_count + n)` inside them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenericContext {
    /// Number of generic parameters on the declaring type
    pub type_count: u16,
    /// Number of generic parameters on the method
    pub method_count: u16,
}

impl GenericContext {
    /// Creates a context for a method with the given parameter counts.
    #[must_use]
    pub fn new(type_count: u16, method_count: u16) -> Self {
        Self {
            type_count,
            method_count,
        }
    }

    /// Total number of generic parameters a synthesized type must declare.
    #[must_use]
    pub fn total(&self) -> u16 {
        self.type_count + self.method_count
    }

    /// Returns `true` if neither the type nor the method is generic.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Rewrites `!!n` into `!(type_count + n)`.
    #[must_use]
    pub fn lift(&self, sig: &TypeSig) -> TypeSig {
        match sig {
            TypeSig::MethodGenericParam(index) => TypeSig::GenericParam(self.type_count + index),
            TypeSig::ByRef(inner) => TypeSig::ByRef(Box::new(self.lift(inner))),
            TypeSig::SzArray(inner) => TypeSig::SzArray(Box::new(self.lift(inner))),
            TypeSig::GenericInst(token, args) => {
                TypeSig::GenericInst(*token, args.iter().map(|arg| self.lift(arg)).collect())
            }
            other => other.clone(),
        }
    }

    /// Instantiation of a synthesized type as seen from the owner method:
    /// `T<!0, .., !(type_count-1), !!0, .., !!(method_count-1)>`.
    #[must_use]
    pub fn owner_instance(&self, token: Token) -> TypeSig {
        if self.is_empty() {
            return TypeSig::Class(token);
        }

        let args = (0..self.type_count)
            .map(TypeSig::GenericParam)
            .chain((0..self.method_count).map(TypeSig::MethodGenericParam))
            .collect();
        TypeSig::GenericInst(token, args)
    }
}
