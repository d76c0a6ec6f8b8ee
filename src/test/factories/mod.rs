//! Module, method and body builders shared by the unit tests.

mod filters;

pub use filters::*;

use crate::metadata::{
    method::{MethodAccessFlags, MethodBody, MethodDef, MethodModifiers, Parameter},
    module::Module,
    signatures::TypeSig,
    token::Token,
    typedef::{TypeAttributes, TypeDef},
};

const PARAM_NAMES: [&str; 4] = ["value", "count", "text", "flag"];

/// `Demo.dll` with a public class `Demo.Program : System.Object`.
pub fn program_module() -> (Module, Token) {
    let mut module = Module::new("Demo.dll");
    let object = module.import_type("System.Runtime", "System", "Object");
    let program = module.add_type(
        TypeDef::new("Demo", "Program", TypeAttributes::PUBLIC).with_extends(object),
    );
    (module, program)
}

fn params(signatures: Vec<TypeSig>) -> Vec<Parameter> {
    signatures
        .into_iter()
        .enumerate()
        .map(|(index, signature)| {
            let name = PARAM_NAMES
                .get(index)
                .map_or_else(|| format!("p{index}"), |name| (*name).to_string());
            Parameter::new(name, signature)
        })
        .collect()
}

/// Adds a public instance method returning `int32`.
pub fn instance_method(
    module: &mut Module,
    owner: Token,
    name: &str,
    signatures: Vec<TypeSig>,
    body: MethodBody,
) -> Token {
    module
        .add_method(
            owner,
            MethodDef::new(
                name,
                MethodAccessFlags::PUBLIC,
                MethodModifiers::HIDE_BY_SIG,
                TypeSig::I4,
                params(signatures),
            )
            .with_body(body),
        )
        .unwrap()
}

/// Adds a public static method returning `int32`.
pub fn static_method(
    module: &mut Module,
    owner: Token,
    name: &str,
    signatures: Vec<TypeSig>,
    body: MethodBody,
) -> Token {
    module
        .add_method(
            owner,
            MethodDef::new(
                name,
                MethodAccessFlags::PUBLIC,
                MethodModifiers::STATIC | MethodModifiers::HIDE_BY_SIG,
                TypeSig::I4,
                params(signatures),
            )
            .with_body(body),
        )
        .unwrap()
}
