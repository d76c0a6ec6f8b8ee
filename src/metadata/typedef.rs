//! Type and field definitions of the module model.
//!
//! Attribute values use the raw ECMA-335 bit layout (II.23.1.15 and II.23.1.5), exposed as
//! constant modules so they can be combined with plain `|`.

use crate::metadata::{signatures::TypeSig, token::Token};

/// Raw `TypeAttributes` bits used by the model
#[allow(non_snake_case)]
pub mod TypeAttributes {
    /// Visibility bits
    pub const VISIBILITY_MASK: u32 = 0x0000_0007;
    /// Top-level, visible outside the assembly
    pub const PUBLIC: u32 = 0x0000_0001;
    /// Nested, visible to the enclosing type only; used for synthesized types
    pub const NESTED_PRIVATE: u32 = 0x0000_0003;
    /// `interface`
    pub const INTERFACE: u32 = 0x0000_0020;
    /// `abstract`
    pub const ABSTRACT: u32 = 0x0000_0080;
    /// `sealed`
    pub const SEALED: u32 = 0x0000_0100;
}

/// Raw `FieldAttributes` bits used by the model
#[allow(non_snake_case)]
pub mod FieldAttributes {
    /// Access bits
    pub const FIELD_ACCESS_MASK: u32 = 0x0007;
    /// `private`
    pub const PRIVATE: u32 = 0x0001;
    /// `assembly`; capture and filter fields are reached from sibling types
    pub const ASSEMBLY: u32 = 0x0003;
    /// `public`
    pub const PUBLIC: u32 = 0x0006;
    /// `static`
    pub const STATIC: u32 = 0x0010;
}

/// A type defined in the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    /// The TypeDef token of this type
    pub token: Token,
    /// Namespace, empty for nested types
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Raw `TypeAttributes`
    pub flags: u32,
    /// Base type (TypeDef, TypeRef or TypeSpec token)
    pub extends: Option<Token>,
    /// The enclosing type for nested types
    pub enclosing: Option<Token>,
    /// Nested types, in declaration order
    pub nested: Vec<Token>,
    /// Field definitions, in declaration order
    pub fields: Vec<Token>,
    /// Method definitions, in declaration order
    pub methods: Vec<Token>,
    /// Names of the generic parameters
    pub generic_params: Vec<String>,
}

impl TypeDef {
    /// Creates a type without members. The token is assigned by
    /// [`crate::metadata::module::Module::add_type`].
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, flags: u32) -> Self {
        TypeDef {
            token: Token(0),
            namespace: namespace.into(),
            name: name.into(),
            flags,
            extends: None,
            enclosing: None,
            nested: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            generic_params: Vec::new(),
        }
    }

    /// Sets the base type.
    #[must_use]
    pub fn with_extends(mut self, extends: Token) -> Self {
        self.extends = Some(extends);
        self
    }

    /// Declares generic parameters.
    #[must_use]
    pub fn with_generic_params<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.generic_params = names.iter().map(|name| name.as_ref().to_string()).collect();
        self
    }

    /// Number of generic parameters
    #[must_use]
    pub fn generic_count(&self) -> u16 {
        self.generic_params.len() as u16
    }

    /// Returns `true` for interfaces.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.flags & TypeAttributes::INTERFACE != 0
    }
}

/// A field defined in the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// The Field token of this field
    pub token: Token,
    /// Simple name
    pub name: String,
    /// Raw `FieldAttributes`
    pub flags: u32,
    /// Field type
    pub signature: TypeSig,
    /// Declaring type
    pub owner: Token,
}

impl FieldDef {
    /// Defined on type, else per instance
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags & FieldAttributes::STATIC != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_builders() {
        let ty = TypeDef::new("Demo", "List`1", TypeAttributes::PUBLIC)
            .with_generic_params(&["T"])
            .with_extends(Token(0x0100_0001));
        assert_eq!(ty.generic_count(), 1);
        assert_eq!(ty.extends, Some(Token(0x0100_0001)));
        assert!(!ty.is_interface());
    }

    #[test]
    fn test_field_static() {
        let field = FieldDef {
            token: Token(0x0400_0001),
            name: "count".to_string(),
            flags: FieldAttributes::PRIVATE | FieldAttributes::STATIC,
            signature: TypeSig::I4,
            owner: Token(0x0200_0001),
        };
        assert!(field.is_static());
    }
}
