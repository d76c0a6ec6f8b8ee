//! In-memory module model.
//!
//! A [`Module`] owns one arena per metadata table the rewriter touches. Rows are addressed
//! by [`Token`]s, so instructions can reference members of types that were synthesized a
//! moment ago. Type references, type specifications and member references are interned:
//! asking for the same reference twice returns the same token.
//!
//! # Checkpoints
//!
//! [`Module::checkpoint`] starts journaling. While a checkpoint is open, every row that is
//! handed out mutably is copied the first time it is touched, and [`Module::rollback`]
//! restores those copies and truncates every arena to its size at checkpoint time. This is
//! how a failed method rewrite is undone without cloning the whole module.
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilfilter::metadata::{
//!     module::Module,
//!     typedef::{TypeAttributes, TypeDef},
//! };
//!
//! let mut module = Module::new("Demo.dll");
//! let object = module.import_type("System.Runtime", "System", "Object");
//! let program = module.add_type(
//!     TypeDef::new("Demo", "Program", TypeAttributes::PUBLIC).with_extends(object),
//! );
//!
//! let snapshot = module.checkpoint();
//! module.add_nested_type(program, TypeDef::new("", "Scratch", TypeAttributes::NESTED_PRIVATE))?;
//! module.rollback(snapshot);
//! assert!(module.type_def(program)?.nested.is_empty());
//! # Ok::<(), cilfilter::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    metadata::{
        method::{MethodBody, MethodDef},
        signatures::TypeSig,
        token::{TableId, Token},
        typedef::{FieldDef, TypeDef},
    },
    Error, Result,
};

/// A reference to a type defined in another module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    /// The TypeRef token
    pub token: Token,
    /// Resolution scope (assembly name)
    pub scope: String,
    /// Namespace
    pub namespace: String,
    /// Simple name
    pub name: String,
}

/// A constructed type signature with its own token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSpec {
    /// The TypeSpec token
    pub token: Token,
    /// The signature
    pub signature: TypeSig,
}

/// Signature of a member reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemberSig {
    /// A method, `has_this` for instance methods
    Method {
        /// Instance method
        has_this: bool,
        /// Parameter types, excluding `this`
        params: Vec<TypeSig>,
        /// Return type
        ret: TypeSig,
    },
    /// A field of the given type
    Field(TypeSig),
}

impl MemberSig {
    /// Instance method signature.
    #[must_use]
    pub fn instance(params: Vec<TypeSig>, ret: TypeSig) -> Self {
        MemberSig::Method {
            has_this: true,
            params,
            ret,
        }
    }

    /// Static method signature.
    #[must_use]
    pub fn static_method(params: Vec<TypeSig>, ret: TypeSig) -> Self {
        MemberSig::Method {
            has_this: false,
            params,
            ret,
        }
    }
}

/// A reference to a field or method through a parent type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    /// The MemberRef token
    pub token: Token,
    /// Declaring type (TypeDef, TypeRef or TypeSpec token)
    pub parent: Token,
    /// Member name
    pub name: String,
    /// Member signature
    pub signature: MemberSig,
}

/// Arena sizes captured by [`Module::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleSnapshot {
    types: usize,
    type_refs: usize,
    type_specs: usize,
    fields: usize,
    methods: usize,
    member_refs: usize,
}

#[derive(Debug, Default)]
struct Journal {
    types: HashMap<usize, TypeDef>,
    fields: HashMap<usize, FieldDef>,
    methods: HashMap<usize, MethodDef>,
}

/// An in-memory .NET module.
#[derive(Debug, Default)]
pub struct Module {
    /// Module name, e.g. `Demo.dll`
    pub name: String,
    types: Vec<TypeDef>,
    type_refs: Vec<TypeRef>,
    type_specs: Vec<TypeSpec>,
    fields: Vec<FieldDef>,
    methods: Vec<MethodDef>,
    member_refs: Vec<MemberRef>,
    type_ref_index: HashMap<(String, String, String), Token>,
    type_spec_index: HashMap<TypeSig, Token>,
    member_ref_index: HashMap<(Token, String, MemberSig), Token>,
    journal: Option<Journal>,
}

fn next_token(table: TableId, len: usize) -> Token {
    Token::from_parts(table, len as u32 + 1)
}

impl Module {
    /// Creates an empty module.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Adds a top-level type and returns its token.
    pub fn add_type(&mut self, mut ty: TypeDef) -> Token {
        let token = next_token(TableId::TypeDef, self.types.len());
        ty.token = token;
        ty.enclosing = None;
        self.types.push(ty);
        token
    }

    /// Adds a type nested in `enclosing` and returns its token.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] if `enclosing` is not a type of this module.
    pub fn add_nested_type(&mut self, enclosing: Token, mut ty: TypeDef) -> Result<Token> {
        let token = next_token(TableId::TypeDef, self.types.len());
        self.type_def_mut(enclosing)?.nested.push(token);
        ty.token = token;
        ty.enclosing = Some(enclosing);
        self.types.push(ty);
        Ok(token)
    }

    /// Adds a field to `owner` and returns its token.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] if `owner` is not a type of this module.
    pub fn add_field(
        &mut self,
        owner: Token,
        name: impl Into<String>,
        flags: u32,
        signature: TypeSig,
    ) -> Result<Token> {
        let token = next_token(TableId::Field, self.fields.len());
        self.type_def_mut(owner)?.fields.push(token);
        self.fields.push(FieldDef {
            token,
            name: name.into(),
            flags,
            signature,
            owner,
        });
        Ok(token)
    }

    /// Adds a method to `owner` and returns its token.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] if `owner` is not a type of this module.
    pub fn add_method(&mut self, owner: Token, mut method: MethodDef) -> Result<Token> {
        let token = next_token(TableId::MethodDef, self.methods.len());
        self.type_def_mut(owner)?.methods.push(token);
        method.token = token;
        method.declaring_type = owner;
        self.methods.push(method);
        Ok(token)
    }

    /// Interns a reference to `namespace.name` in `scope`.
    pub fn import_type(&mut self, scope: &str, namespace: &str, name: &str) -> Token {
        let key = (scope.to_string(), namespace.to_string(), name.to_string());
        if let Some(token) = self.type_ref_index.get(&key) {
            return *token;
        }

        let token = next_token(TableId::TypeRef, self.type_refs.len());
        self.type_refs.push(TypeRef {
            token,
            scope: key.0.clone(),
            namespace: key.1.clone(),
            name: key.2.clone(),
        });
        self.type_ref_index.insert(key, token);
        token
    }

    /// Interns a type specification.
    ///
    /// Plain class and value type signatures do not need one; their TypeDef or TypeRef token
    /// is returned directly.
    pub fn type_spec(&mut self, signature: TypeSig) -> Token {
        match signature {
            TypeSig::Class(token) | TypeSig::ValueType(token) => return token,
            _ => {}
        }
        if let Some(token) = self.type_spec_index.get(&signature) {
            return *token;
        }

        let token = next_token(TableId::TypeSpec, self.type_specs.len());
        self.type_specs.push(TypeSpec {
            token,
            signature: signature.clone(),
        });
        self.type_spec_index.insert(signature, token);
        token
    }

    /// Interns a member reference.
    pub fn member_ref(&mut self, parent: Token, name: &str, signature: MemberSig) -> Token {
        let key = (parent, name.to_string(), signature);
        if let Some(token) = self.member_ref_index.get(&key) {
            return *token;
        }

        let token = next_token(TableId::MemberRef, self.member_refs.len());
        self.member_refs.push(MemberRef {
            token,
            parent,
            name: key.1.clone(),
            signature: key.2.clone(),
        });
        self.member_ref_index.insert(key, token);
        token
    }

    /// Signature of a field or method definition as a member reference would carry it.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] for tokens that are not Fields or MethodDefs of this
    /// module.
    pub fn member_signature(&self, member: Token) -> Result<MemberSig> {
        match member.table_id() {
            Some(TableId::Field) => Ok(MemberSig::Field(self.field(member)?.signature.clone())),
            Some(TableId::MethodDef) => {
                let method = self.method(member)?;
                Ok(MemberSig::Method {
                    has_this: method.has_this(),
                    params: method
                        .params
                        .iter()
                        .map(|param| param.signature.clone())
                        .collect(),
                    ret: method.return_type.clone(),
                })
            }
            _ => Err(Error::TokenNotFound(member)),
        }
    }

    /// Token that names `member` of a type defined here, as seen through `instance`.
    ///
    /// Members of generic types must be referenced through an instantiation, so for a
    /// [`TypeSig::GenericInst`] this interns a TypeSpec and a MemberRef on it. For plain
    /// instances the definition token itself is returned.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] if `member` is not a field or method of this module.
    pub fn member_in(&mut self, instance: &TypeSig, member: Token) -> Result<Token> {
        let signature = self.member_signature(member)?;
        match instance {
            TypeSig::GenericInst(..) => {
                let name = match member.table_id() {
                    Some(TableId::Field) => self.field(member)?.name.clone(),
                    _ => self.method(member)?.name.clone(),
                };
                let parent = self.type_spec(instance.clone());
                Ok(self.member_ref(parent, &name, signature))
            }
            _ => Ok(member),
        }
    }

    /// Looks up a type definition.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] for tokens that are not TypeDefs of this module.
    pub fn type_def(&self, token: Token) -> Result<&TypeDef> {
        Self::lookup(&self.types, TableId::TypeDef, token)
    }

    /// Looks up a type definition for modification.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] for tokens that are not TypeDefs of this module.
    pub fn type_def_mut(&mut self, token: Token) -> Result<&mut TypeDef> {
        let index = Self::index_of(self.types.len(), TableId::TypeDef, token)?;
        if let Some(journal) = &mut self.journal {
            journal
                .types
                .entry(index)
                .or_insert_with(|| self.types[index].clone());
        }
        Ok(&mut self.types[index])
    }

    /// Looks up a field definition.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] for tokens that are not Fields of this module.
    pub fn field(&self, token: Token) -> Result<&FieldDef> {
        Self::lookup(&self.fields, TableId::Field, token)
    }

    /// Looks up a field definition for modification.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] for tokens that are not Fields of this module.
    pub fn field_mut(&mut self, token: Token) -> Result<&mut FieldDef> {
        let index = Self::index_of(self.fields.len(), TableId::Field, token)?;
        if let Some(journal) = &mut self.journal {
            journal
                .fields
                .entry(index)
                .or_insert_with(|| self.fields[index].clone());
        }
        Ok(&mut self.fields[index])
    }

    /// Looks up a method definition.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] for tokens that are not MethodDefs of this module.
    pub fn method(&self, token: Token) -> Result<&MethodDef> {
        Self::lookup(&self.methods, TableId::MethodDef, token)
    }

    /// Looks up a method definition for modification.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] for tokens that are not MethodDefs of this module.
    pub fn method_mut(&mut self, token: Token) -> Result<&mut MethodDef> {
        let index = Self::index_of(self.methods.len(), TableId::MethodDef, token)?;
        if let Some(journal) = &mut self.journal {
            journal
                .methods
                .entry(index)
                .or_insert_with(|| self.methods[index].clone());
        }
        Ok(&mut self.methods[index])
    }

    /// Body of a method for modification.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] for unknown methods and [`Error::Consistency`] for
    /// methods without body.
    pub fn body_mut(&mut self, token: Token) -> Result<&mut MethodBody> {
        self.method_mut(token)?
            .body
            .as_mut()
            .ok_or_else(|| consistency_error!("Method {} has no body", token))
    }

    /// Looks up a type reference.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] for tokens that are not TypeRefs of this module.
    pub fn type_ref(&self, token: Token) -> Result<&TypeRef> {
        Self::lookup(&self.type_refs, TableId::TypeRef, token)
    }

    /// Looks up a type specification.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] for tokens that are not TypeSpecs of this module.
    pub fn type_spec_def(&self, token: Token) -> Result<&TypeSpec> {
        Self::lookup(&self.type_specs, TableId::TypeSpec, token)
    }

    /// Looks up a member reference.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] for tokens that are not MemberRefs of this module.
    pub fn member_ref_def(&self, token: Token) -> Result<&MemberRef> {
        Self::lookup(&self.member_refs, TableId::MemberRef, token)
    }

    /// Returns `true` if the token names a row of this module.
    #[must_use]
    pub fn resolves(&self, token: Token) -> bool {
        let len = match token.table_id() {
            Some(TableId::TypeRef) => self.type_refs.len(),
            Some(TableId::TypeDef) => self.types.len(),
            Some(TableId::Field) => self.fields.len(),
            Some(TableId::MethodDef) => self.methods.len(),
            Some(TableId::MemberRef) => self.member_refs.len(),
            Some(TableId::TypeSpec) => self.type_specs.len(),
            None => return false,
        };
        token.index().is_some_and(|index| index < len)
    }

    /// All type definitions in token order.
    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.iter()
    }

    /// All method definitions in token order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.methods.iter()
    }

    /// Tokens of all method definitions in token order.
    #[must_use]
    pub fn method_tokens(&self) -> Vec<Token> {
        self.methods.iter().map(|method| method.token).collect()
    }

    /// Finds a top-level type by namespace and name.
    #[must_use]
    pub fn find_type(&self, namespace: &str, name: &str) -> Option<Token> {
        self.types
            .iter()
            .find(|ty| ty.enclosing.is_none() && ty.namespace == namespace && ty.name == name)
            .map(|ty| ty.token)
    }

    /// Finds a method of `owner` by name.
    #[must_use]
    pub fn find_method(&self, owner: Token, name: &str) -> Option<Token> {
        let ty = self.type_def(owner).ok()?;
        ty.methods
            .iter()
            .copied()
            .find(|token| self.method(*token).is_ok_and(|method| method.name == name))
    }

    /// Full name of a TypeDef, TypeRef or TypeSpec: `Namespace.Outer/Inner`.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] if the token does not resolve.
    pub fn type_name(&self, token: Token) -> Result<String> {
        match token.table_id() {
            Some(TableId::TypeDef) => {
                let ty = self.type_def(token)?;
                match ty.enclosing {
                    Some(enclosing) => Ok(format!("{}/{}", self.type_name(enclosing)?, ty.name)),
                    None if ty.namespace.is_empty() => Ok(ty.name.clone()),
                    None => Ok(format!("{}.{}", ty.namespace, ty.name)),
                }
            }
            Some(TableId::TypeRef) => {
                let ty = self.type_ref(token)?;
                if ty.namespace.is_empty() {
                    Ok(ty.name.clone())
                } else {
                    Ok(format!("{}.{}", ty.namespace, ty.name))
                }
            }
            Some(TableId::TypeSpec) => match &self.type_spec_def(token)?.signature {
                TypeSig::GenericInst(generic, args) => {
                    let args: Vec<String> = args.iter().map(ToString::to_string).collect();
                    Ok(format!("{}<{}>", self.type_name(*generic)?, args.join(", ")))
                }
                other => Ok(other.to_string()),
            },
            _ => Err(Error::TokenNotFound(token)),
        }
    }

    /// Full name of a method definition: `Namespace.Outer/Inner::Method`.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] if the method or its type does not resolve.
    pub fn method_name(&self, token: Token) -> Result<String> {
        let method = self.method(token)?;
        Ok(format!(
            "{}::{}",
            self.type_name(method.declaring_type)?,
            method.name
        ))
    }

    /// Returns `true` if the token names `System.Object`.
    #[must_use]
    pub fn is_system_object(&self, token: Token) -> bool {
        self.is_named(token, "System", "Object")
    }

    /// Returns `true` if the token names a type deriving from `System.ValueType` or
    /// `System.Enum`.
    #[must_use]
    pub fn is_value_type(&self, token: Token) -> bool {
        match token.table_id() {
            Some(TableId::TypeDef) => self
                .type_def(token)
                .ok()
                .and_then(|ty| ty.extends)
                .is_some_and(|base| {
                    self.is_named(base, "System", "ValueType") || self.is_named(base, "System", "Enum")
                }),
            Some(TableId::TypeSpec) => match self.type_spec_def(token).map(|spec| &spec.signature) {
                Ok(TypeSig::GenericInst(generic, _)) => self.is_value_type(*generic),
                Ok(TypeSig::ValueType(_)) => true,
                _ => false,
            },
            _ => false,
        }
    }

    fn is_named(&self, token: Token, namespace: &str, name: &str) -> bool {
        match token.table_id() {
            Some(TableId::TypeRef) => self
                .type_ref(token)
                .is_ok_and(|ty| ty.namespace == namespace && ty.name == name),
            Some(TableId::TypeDef) => self
                .type_def(token)
                .is_ok_and(|ty| ty.enclosing.is_none() && ty.namespace == namespace && ty.name == name),
            _ => false,
        }
    }

    /// Signature of `this` inside instance methods of `ty`: the type instantiated over its
    /// own generic parameters, behind a managed pointer for value types.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] if `ty` is not a type of this module.
    pub fn this_signature(&self, ty: Token) -> Result<TypeSig> {
        let def = self.type_def(ty)?;
        let value_type = self.is_value_type(ty);
        let inner = match (def.generic_count(), value_type) {
            (0, true) => TypeSig::ValueType(ty),
            (count, _) => TypeSig::self_instance(ty, count),
        };
        if value_type {
            Ok(TypeSig::ByRef(Box::new(inner)))
        } else {
            Ok(inner)
        }
    }

    /// Signature of argument `index` of `method`, including `this`.
    ///
    /// # Errors
    /// Returns [`Error::TokenNotFound`] for unknown methods and [`Error::Consistency`] for
    /// argument indices out of range.
    pub fn arg_signature(&self, method: Token, index: u16) -> Result<TypeSig> {
        let def = self.method(method)?;
        if def.has_this() && index == 0 {
            return self.this_signature(def.declaring_type);
        }
        def.param_for_arg(index)
            .map(|param| param.signature.clone())
            .ok_or_else(|| {
                consistency_error!("Argument {} out of range for method {}", index, method)
            })
    }

    /// Starts journaling changes so they can be undone with [`Module::rollback`].
    ///
    /// Opening a new checkpoint discards the journal of the previous one.
    pub fn checkpoint(&mut self) -> ModuleSnapshot {
        self.journal = Some(Journal::default());
        ModuleSnapshot {
            types: self.types.len(),
            type_refs: self.type_refs.len(),
            type_specs: self.type_specs.len(),
            fields: self.fields.len(),
            methods: self.methods.len(),
            member_refs: self.member_refs.len(),
        }
    }

    /// Keeps all changes since the checkpoint and stops journaling.
    pub fn commit(&mut self) {
        self.journal = None;
    }

    /// Undoes every change since `snapshot` was taken and stops journaling.
    pub fn rollback(&mut self, snapshot: ModuleSnapshot) {
        self.types.truncate(snapshot.types);
        self.type_refs.truncate(snapshot.type_refs);
        self.type_specs.truncate(snapshot.type_specs);
        self.fields.truncate(snapshot.fields);
        self.methods.truncate(snapshot.methods);
        self.member_refs.truncate(snapshot.member_refs);

        if let Some(journal) = self.journal.take() {
            for (index, ty) in journal.types {
                if index < self.types.len() {
                    self.types[index] = ty;
                }
            }
            for (index, field) in journal.fields {
                if index < self.fields.len() {
                    self.fields[index] = field;
                }
            }
            for (index, method) in journal.methods {
                if index < self.methods.len() {
                    self.methods[index] = method;
                }
            }
        }

        let keep = |token: &Token, len: usize| token.index().is_some_and(|index| index < len);
        self.type_ref_index
            .retain(|_, token| keep(token, snapshot.type_refs));
        self.type_spec_index
            .retain(|_, token| keep(token, snapshot.type_specs));
        self.member_ref_index
            .retain(|_, token| keep(token, snapshot.member_refs));
    }

    fn index_of(len: usize, table: TableId, token: Token) -> Result<usize> {
        match token.index() {
            Some(index) if token.is(table) && index < len => Ok(index),
            _ => Err(Error::TokenNotFound(token)),
        }
    }

    fn lookup<T>(rows: &[T], table: TableId, token: Token) -> Result<&T> {
        let index = Self::index_of(rows.len(), table, token)?;
        Ok(&rows[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        method::{MethodAccessFlags, MethodModifiers, Parameter},
        typedef::{FieldAttributes, TypeAttributes},
    };

    fn module_with_program() -> (Module, Token) {
        let mut module = Module::new("Demo.dll");
        let object = module.import_type("System.Runtime", "System", "Object");
        let program = module.add_type(
            TypeDef::new("Demo", "Program", TypeAttributes::PUBLIC).with_extends(object),
        );
        (module, program)
    }

    #[test]
    fn test_interning() {
        let (mut module, program) = module_with_program();
        let object = module.import_type("System.Runtime", "System", "Object");
        assert_eq!(object, Token(0x0100_0001));
        assert!(module.is_system_object(object));

        let sig = MemberSig::static_method(vec![TypeSig::Object], TypeSig::Void);
        let first = module.member_ref(object, "Helper", sig.clone());
        let second = module.member_ref(object, "Helper", sig);
        assert_eq!(first, second);
        assert!(first.is(TableId::MemberRef));

        let spec = TypeSig::GenericInst(program, vec![TypeSig::I4]);
        assert_eq!(module.type_spec(spec.clone()), module.type_spec(spec));
        assert_eq!(module.type_spec(TypeSig::Class(program)), program);
    }

    #[test]
    fn test_full_names() {
        let (mut module, program) = module_with_program();
        let nested = module
            .add_nested_type(program, TypeDef::new("", "Inner", TypeAttributes::NESTED_PRIVATE))
            .unwrap();
        let method = module
            .add_method(
                nested,
                MethodDef::new(
                    "Run",
                    MethodAccessFlags::PUBLIC,
                    MethodModifiers::STATIC,
                    TypeSig::Void,
                    vec![],
                ),
            )
            .unwrap();
        assert_eq!(module.type_name(nested).unwrap(), "Demo.Program/Inner");
        assert_eq!(module.method_name(method).unwrap(), "Demo.Program/Inner::Run");
        assert_eq!(module.find_method(nested, "Run"), Some(method));
        assert_eq!(module.find_type("Demo", "Program"), Some(program));
    }

    #[test]
    fn test_value_type_this_is_byref() {
        let mut module = Module::new("Demo.dll");
        let value_type = module.import_type("System.Runtime", "System", "ValueType");
        let point = module.add_type(
            TypeDef::new("Demo", "Point", TypeAttributes::PUBLIC).with_extends(value_type),
        );
        let method = module
            .add_method(
                point,
                MethodDef::new(
                    "Move",
                    MethodAccessFlags::PUBLIC,
                    MethodModifiers::HIDE_BY_SIG,
                    TypeSig::Void,
                    vec![Parameter::new("dx", TypeSig::I4)],
                ),
            )
            .unwrap();

        assert!(module.is_value_type(point));
        assert_eq!(
            module.arg_signature(method, 0).unwrap(),
            TypeSig::ByRef(Box::new(TypeSig::ValueType(point)))
        );
        assert_eq!(module.arg_signature(method, 1).unwrap(), TypeSig::I4);
        assert!(module.arg_signature(method, 2).unwrap_err().is_consistency());
    }

    #[test]
    fn test_rollback_restores_touched_rows() {
        let (mut module, program) = module_with_program();
        let field = module
            .add_field(program, "count", FieldAttributes::PRIVATE, TypeSig::I4)
            .unwrap();

        let snapshot = module.checkpoint();
        module.field_mut(field).unwrap().name = "renamed".to_string();
        let extra = module
            .add_field(program, "extra", FieldAttributes::PRIVATE, TypeSig::I4)
            .unwrap();
        let helper = module.import_type("Support", "Support", "Helper");
        module.rollback(snapshot);

        assert_eq!(module.field(field).unwrap().name, "count");
        assert!(module.field(extra).is_err());
        assert!(!module.resolves(helper));
        assert_eq!(module.type_def(program).unwrap().fields, vec![field]);
        // interning table forgot the rolled back reference
        assert_eq!(module.import_type("Support", "Support", "Helper"), helper);
    }

    #[test]
    fn test_member_in_generic_instance() {
        let (mut module, program) = module_with_program();
        let holder = module
            .add_nested_type(
                program,
                TypeDef::new("", "Holder", TypeAttributes::NESTED_PRIVATE).with_generic_params(&["T"]),
            )
            .unwrap();
        let field = module
            .add_field(holder, "value", FieldAttributes::ASSEMBLY, TypeSig::GenericParam(0))
            .unwrap();

        assert_eq!(module.member_in(&TypeSig::Class(holder), field).unwrap(), field);

        let instance = TypeSig::self_instance(holder, 1);
        let reference = module.member_in(&instance, field).unwrap();
        assert!(reference.is(TableId::MemberRef));
        let row = module.member_ref_def(reference).unwrap();
        assert_eq!(row.name, "value");
        assert_eq!(row.signature, MemberSig::Field(TypeSig::GenericParam(0)));
        assert_eq!(
            module.type_spec_def(row.parent).unwrap().signature,
            instance
        );
        assert_eq!(module.member_in(&instance, field).unwrap(), reference);
    }

    #[test]
    fn test_commit_keeps_changes() {
        let (mut module, program) = module_with_program();
        module.checkpoint();
        let field = module
            .add_field(program, "kept", FieldAttributes::PRIVATE, TypeSig::I4)
            .unwrap();
        module.commit();
        assert_eq!(module.field(field).unwrap().name, "kept");
    }

    #[test]
    fn test_unknown_tokens() {
        let (module, _) = module_with_program();
        assert!(matches!(
            module.type_def(Token(0x0200_0009)),
            Err(Error::TokenNotFound(_))
        ));
        assert!(module.method(Token(0x0200_0001)).is_err());
        assert!(!module.resolves(Token(0x7000_0001)));
    }
}
