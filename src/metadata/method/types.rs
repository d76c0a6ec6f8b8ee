//! Method attribute flags and supporting types for method definitions.
//!
//! # Key Types
//! - [`MethodAccessFlags`], [`MethodModifiers`]: Attribute flags
//! - [`LocalVariable`], [`Parameter`]: Variable slot and parameter descriptions

use bitflags::bitflags;

use crate::metadata::signatures::TypeSig;

/// Low bits of the raw method attributes that hold the member access
pub const METHOD_ACCESS_MASK: u32 = 0x0007;

bitflags! {
    /// Who may reference a method (ECMA-335 II.23.1.10, `MemberAccessMask` values)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodAccessFlags: u32 {
        /// `privatescope`
        const COMPILER_CONTROLLED = 0x0000;
        /// `private`
        const PRIVATE = 0x0001;
        /// `famandassem`
        const FAM_AND_ASSEM = 0x0002;
        /// `assembly`, used for every synthesized member
        const ASSEM = 0x0003;
        /// `family`
        const FAMILY = 0x0004;
        /// `famorassem`
        const FAM_OR_ASSEM = 0x0005;
        /// `public`
        const PUBLIC = 0x0006;
    }
}

impl MethodAccessFlags {
    /// Splits the access bits out of raw method attributes, as read by a module reader.
    #[must_use]
    pub fn from_method_flags(flags: u32) -> Self {
        Self::from_bits_truncate(flags & METHOD_ACCESS_MASK)
    }
}

bitflags! {
    /// The non-access bits of the method attributes the rewriter reads or emits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodModifiers: u32 {
        /// No `this` argument
        const STATIC = 0x0010;
        /// `final`
        const FINAL = 0x0020;
        /// `virtual`
        const VIRTUAL = 0x0040;
        /// `hidebysig`
        const HIDE_BY_SIG = 0x0080;
        /// `newslot`
        const NEW_SLOT = 0x0100;
        /// `abstract`, no body
        const ABSTRACT = 0x0400;
        /// `specialname`
        const SPECIAL_NAME = 0x0800;
        /// `rtspecialname`, set on `.ctor` and `.cctor`
        const RTSPECIAL_NAME = 0x1000;
    }
}

impl MethodModifiers {
    /// Everything but the access bits of raw method attributes.
    #[must_use]
    pub fn from_method_flags(flags: u32) -> Self {
        Self::from_bits_truncate(flags & !METHOD_ACCESS_MASK)
    }

    /// `hidebysig specialname rtspecialname`, the modifiers of an instance constructor.
    #[must_use]
    pub fn constructor() -> Self {
        MethodModifiers::HIDE_BY_SIG | MethodModifiers::SPECIAL_NAME | MethodModifiers::RTSPECIAL_NAME
    }
}

/// A local variable slot of a method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    /// Debug name, if known
    pub name: Option<String>,
    /// Slot type
    pub signature: TypeSig,
}

impl LocalVariable {
    /// Creates an unnamed local of the given type.
    #[must_use]
    pub fn new(signature: TypeSig) -> Self {
        LocalVariable {
            name: None,
            signature,
        }
    }

    /// Returns `true` for `T&` locals, which cannot move into a field.
    #[must_use]
    pub fn is_byref(&self) -> bool {
        self.signature.is_byref()
    }
}

/// A declared method parameter. The implicit `this` is not listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    /// Name, used to name the capture field of the argument
    pub name: String,
    /// Declared type
    pub signature: TypeSig,
}

impl Parameter {
    /// Creates a parameter.
    #[must_use]
    pub fn new(name: impl Into<String>, signature: TypeSig) -> Self {
        Parameter {
            name: name.into(),
            signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_extraction() {
        let raw = 0x0096; // public static hidebysig
        assert_eq!(
            MethodAccessFlags::from_method_flags(raw),
            MethodAccessFlags::PUBLIC
        );
        let modifiers = MethodModifiers::from_method_flags(raw);
        assert!(modifiers.contains(MethodModifiers::STATIC));
        assert!(modifiers.contains(MethodModifiers::HIDE_BY_SIG));
        assert!(!modifiers.contains(MethodModifiers::VIRTUAL));
    }

    #[test]
    fn test_byref_local() {
        assert!(LocalVariable::new(TypeSig::ByRef(Box::new(TypeSig::I4))).is_byref());
        assert!(!LocalVariable::new(TypeSig::Object).is_byref());
    }
}
