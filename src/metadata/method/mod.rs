//! Method definitions, bodies and exception handling regions.
//!
//! # Key Components
//!
//! - [`MethodDef`] - A method definition with its signature and optional body
//! - [`MethodBody`] - Editable instruction sequence, locals and exception regions
//! - [`ExceptionHandler`] - A try region and its handler
//! - [`MethodAccessFlags`], [`MethodModifiers`] - Attribute flags
//!
//! Argument indexing follows CIL: for instance methods argument `0` is `this` and declared
//! parameter `i` is argument `i + 1`.

mod body;
mod exceptions;
mod types;

pub use body::{BodyLayout, MethodBody};
pub use exceptions::{ExceptionHandler, ExceptionHandlerFlags};
pub use types::{LocalVariable, MethodAccessFlags, MethodModifiers, Parameter, METHOD_ACCESS_MASK};

use crate::metadata::{signatures::TypeSig, token::Token};

/// A method definition.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// The MethodDef token of this method
    pub token: Token,
    /// Simple name
    pub name: String,
    /// Visibility
    pub access: MethodAccessFlags,
    /// Static, virtual, special-name, ...
    pub modifiers: MethodModifiers,
    /// TypeDef token of the declaring type
    pub declaring_type: Token,
    /// Return type
    pub return_type: TypeSig,
    /// Declared parameters, excluding `this`
    pub params: Vec<Parameter>,
    /// Names of the method's generic parameters
    pub generic_params: Vec<String>,
    /// The body, absent for abstract and runtime-provided methods
    pub body: Option<MethodBody>,
}

impl MethodDef {
    /// Creates a method without body. The token and declaring type are assigned by
    /// [`crate::metadata::module::Module::add_method`].
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        access: MethodAccessFlags,
        modifiers: MethodModifiers,
        return_type: TypeSig,
        params: Vec<Parameter>,
    ) -> Self {
        MethodDef {
            token: Token(0),
            name: name.into(),
            access,
            modifiers,
            declaring_type: Token(0),
            return_type,
            params,
            generic_params: Vec::new(),
            body: None,
        }
    }

    /// Attaches a body.
    #[must_use]
    pub fn with_body(mut self, body: MethodBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Declares generic parameters.
    #[must_use]
    pub fn with_generic_params(mut self, names: &[&str]) -> Self {
        self.generic_params = names.iter().map(|name| (*name).to_string()).collect();
        self
    }

    /// Defined on type, else per instance
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.modifiers.contains(MethodModifiers::STATIC)
    }

    /// Returns `true` if argument 0 is `this`.
    #[must_use]
    pub fn has_this(&self) -> bool {
        !self.is_static()
    }

    /// Returns `true` for `.ctor` and `.cctor`.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.modifiers.contains(MethodModifiers::RTSPECIAL_NAME)
            && (self.name == ".ctor" || self.name == ".cctor")
    }

    /// Number of arguments including `this`.
    #[must_use]
    pub fn arg_count(&self) -> u16 {
        self.params.len() as u16 + u16::from(self.has_this())
    }

    /// Declared parameter behind argument `index`, `None` for `this` or out of range.
    #[must_use]
    pub fn param_for_arg(&self, index: u16) -> Option<&Parameter> {
        let offset = u16::from(self.has_this());
        if index < offset {
            return None;
        }
        self.params.get(usize::from(index - offset))
    }

    /// Returns `true` if the body contains at least one filtered handler.
    #[must_use]
    pub fn has_filters(&self) -> bool {
        self.body
            .as_ref()
            .is_some_and(|body| body.exception_handlers.iter().any(ExceptionHandler::is_filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_indexing() {
        let instance = MethodDef::new(
            "Run",
            MethodAccessFlags::PUBLIC,
            MethodModifiers::HIDE_BY_SIG,
            TypeSig::Void,
            vec![Parameter::new("count", TypeSig::I4)],
        );
        assert!(instance.has_this());
        assert_eq!(instance.arg_count(), 2);
        assert!(instance.param_for_arg(0).is_none());
        assert_eq!(instance.param_for_arg(1).map(|p| p.name.as_str()), Some("count"));
        assert!(instance.param_for_arg(2).is_none());

        let shared = MethodDef::new(
            "Run",
            MethodAccessFlags::PUBLIC,
            MethodModifiers::STATIC,
            TypeSig::Void,
            vec![Parameter::new("count", TypeSig::I4)],
        );
        assert_eq!(shared.arg_count(), 1);
        assert_eq!(shared.param_for_arg(0).map(|p| p.name.as_str()), Some("count"));
    }

    #[test]
    fn test_constructor_and_filters() {
        let ctor = MethodDef::new(
            ".ctor",
            MethodAccessFlags::PUBLIC,
            MethodModifiers::constructor(),
            TypeSig::Void,
            vec![],
        );
        assert!(ctor.is_constructor());
        assert!(!ctor.has_filters());
    }
}
