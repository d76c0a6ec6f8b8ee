//! Capture record synthesis.
//!
//! Code that moves out of a method can no longer see that method's locals and arguments. The
//! closure synthesizer gives every variable used by a filter or handler a field on a nested
//! *capture record* type and redirects all accesses in the owner method through it:
//!
//! ```text
//! stloc.1        ->  ldloc rec; call __closure0::set_local1(value, rec)
//! ldloc.1        ->  ldloc rec; ldfld __closure0::local1
//! ldloca.s 1     ->  ldloc rec; ldflda __closure0::local1
//! ```
//!
//! The record is constructed once at method entry from the captured arguments. Managed
//! pointers cannot live on the heap, so byref parameters and the `this` of value types are
//! never captured; they are forwarded to extracted units as extra parameters instead.
//!
//! A record is cached per owner method. Rewriting the same method again reuses it and only
//! adds what is missing.

use std::collections::BTreeMap;

use crate::{
    assembly::{InstrId, InstructionAssembler, Opcode, VariableAccess},
    metadata::{
        method::{MethodAccessFlags, MethodBody, MethodDef, MethodModifiers, Parameter},
        module::Module,
        signatures::TypeSig,
        token::Token,
        typedef::{FieldAttributes, TypeAttributes, TypeDef},
    },
    rewriter::{context::RewriteContext, editor, events::EventKind, runtime::FilterRuntime, scanner::Usage},
    Error, Result,
};

/// A variable of the owner method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Captured {
    /// Local variable slot
    Local(u16),
    /// Argument, `this` included
    Argument(u16),
}

impl Captured {
    fn from_access(access: VariableAccess, index: u16) -> Self {
        if access.is_local() {
            Captured::Local(index)
        } else {
            Captured::Argument(index)
        }
    }
}

/// The record field backing one captured variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedField {
    /// The field definition
    pub field: Token,
    /// The field as referenced from the owner method
    pub from_owner: Token,
    /// The field as referenced from code inside the record type
    pub from_record: Token,
    /// `set_<field>(value, record)`, as referenced from the owner method
    pub setter: Token,
}

/// The capture record of one owner method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureRecord {
    /// The record type, nested in the owner's declaring type
    pub ty: Token,
    /// The record type instantiated as the owner sees it
    pub owner_instance: TypeSig,
    /// The record type instantiated over its own generic parameters
    pub self_instance: TypeSig,
    /// Owner local holding the record
    pub local: u16,
    /// The constructor definition
    pub ctor: Token,
    /// Arguments copied in by the constructor, in parameter order
    pub ctor_params: Vec<u16>,
    /// Captured variables
    pub fields: BTreeMap<Captured, CapturedField>,
    /// Byref arguments forwarded to catch units, in parameter order
    pub passthrough: Vec<u16>,
    /// Owner instructions that build the record at method entry
    pub prologue: Vec<InstrId>,
}

impl ClosureRecord {
    /// Field backing `item`.
    ///
    /// # Errors
    /// Returns [`Error::Consistency`] if `item` was never captured.
    pub fn field(&self, item: Captured) -> Result<&CapturedField> {
        self.fields
            .get(&item)
            .ok_or_else(|| consistency_error!("{:?} has no field in the capture record", item))
    }

    /// Returns `true` if `arg` is forwarded instead of captured.
    #[must_use]
    pub fn is_passthrough(&self, arg: u16) -> bool {
        self.passthrough.contains(&arg)
    }
}

/// Builds or extends the capture record of `ctx.method` so it covers `usage`, and routes every
/// access in `body` to a captured variable through it.
///
/// # Errors
/// Returns [`Error::Eligibility`] for byref locals and for constructors that would capture
/// `this`, [`Error::TokenNotFound`] if the owner does not resolve and
/// [`Error::Consistency`] for variable indices out of range.
pub fn capture(
    module: &mut Module,
    runtime: &FilterRuntime,
    ctx: &mut RewriteContext,
    body: &mut MethodBody,
    cached: Option<ClosureRecord>,
    usage: &Usage,
) -> Result<ClosureRecord> {
    let owner = module.method(ctx.method)?.clone();

    let mut captured = Vec::new();
    let mut passthrough = Vec::new();
    for index in &usage.locals {
        let local = body
            .locals
            .get(usize::from(*index))
            .ok_or_else(|| consistency_error!("Local {} out of range", index))?;
        if local.is_byref() {
            return Err(Error::Eligibility {
                method: ctx.method_name.clone(),
                reason: format!("byref local {index} is used by a filter or handler"),
            });
        }
        captured.push((Captured::Local(*index), local.signature.clone()));
    }
    for index in &usage.args {
        let signature = module.arg_signature(ctx.method, *index)?;
        if signature.is_byref() {
            passthrough.push(*index);
            continue;
        }
        if *index == 0 && owner.has_this() && owner.is_constructor() {
            return Err(Error::Eligibility {
                method: ctx.method_name.clone(),
                reason: "constructor would capture an uninitialized this".to_string(),
            });
        }
        captured.push((Captured::Argument(*index), signature));
    }

    let mut record = match cached {
        Some(record) => record,
        None => create_record(module, runtime, ctx, &owner, body)?,
    };
    for arg in passthrough {
        if !record.is_passthrough(arg) {
            record.passthrough.push(arg);
        }
    }
    record.passthrough.sort_unstable();

    let mut added = Vec::new();
    for (item, signature) in captured {
        if record.fields.contains_key(&item) {
            continue;
        }
        let field = add_field(module, ctx, &record, &owner, item, &signature)?;
        let name = module.field(field.field)?.name.clone();
        ctx.events
            .record(EventKind::VariableCaptured)
            .method(ctx.method)
            .message(format!("{item:?} -> {name}"));
        record.fields.insert(item, field);
        added.push(item);
    }

    redirect_accesses(ctx, body, &record)?;

    if record.prologue.is_empty() {
        finish_constructor(module, runtime, &mut record)?;
        emit_prologue(module, body, &mut record)?;
    } else {
        initialize_late_arguments(body, &mut record, &added)?;
    }

    log::debug!(
        "{}: capture record {} holds {} variables, {} forwarded",
        ctx.method_name,
        module.type_name(record.ty)?,
        record.fields.len(),
        record.passthrough.len()
    );
    Ok(record)
}

fn create_record(
    module: &mut Module,
    runtime: &FilterRuntime,
    ctx: &mut RewriteContext,
    owner: &MethodDef,
    body: &mut MethodBody,
) -> Result<ClosureRecord> {
    let number = ctx.counters.next_closure();
    let generic_params: Vec<String> = module
        .type_def(owner.declaring_type)?
        .generic_params
        .iter()
        .chain(owner.generic_params.iter())
        .cloned()
        .collect();

    let ty = module.add_nested_type(
        owner.declaring_type,
        TypeDef::new(
            "",
            format!("__closure{number}"),
            TypeAttributes::NESTED_PRIVATE | TypeAttributes::SEALED,
        )
        .with_extends(runtime.object)
        .with_generic_params(&generic_params),
    )?;

    let ctor = module.add_method(
        ty,
        MethodDef::new(
            ".ctor",
            MethodAccessFlags::ASSEM,
            MethodModifiers::constructor(),
            TypeSig::Void,
            Vec::new(),
        ),
    )?;

    let owner_instance = ctx.generics.owner_instance(ty);
    let local = body.add_local(owner_instance.clone())?;
    body.locals[usize::from(local)].name = Some("closure".to_string());

    let name = module.type_name(ty)?;
    ctx.events
        .record(EventKind::ClosureCreated)
        .method(ctx.method)
        .message(name);

    Ok(ClosureRecord {
        ty,
        owner_instance,
        self_instance: TypeSig::self_instance(ty, ctx.generics.total()),
        local,
        ctor,
        ctor_params: Vec::new(),
        fields: BTreeMap::new(),
        passthrough: Vec::new(),
        prologue: Vec::new(),
    })
}

fn field_name(owner: &MethodDef, item: Captured) -> String {
    match item {
        Captured::Local(index) => format!("local{index}"),
        Captured::Argument(0) if owner.has_this() => "this".to_string(),
        Captured::Argument(index) => match owner.param_for_arg(index) {
            Some(param) if !param.name.is_empty() => format!("arg_{}", param.name),
            _ => format!("arg{index}"),
        },
    }
}

fn add_field(
    module: &mut Module,
    ctx: &RewriteContext,
    record: &ClosureRecord,
    owner: &MethodDef,
    item: Captured,
    signature: &TypeSig,
) -> Result<CapturedField> {
    let name = field_name(owner, item);
    let signature = ctx.generics.lift(signature);
    let field = module.add_field(record.ty, name.as_str(), FieldAttributes::ASSEMBLY, signature.clone())?;
    let from_owner = module.member_in(&record.owner_instance, field)?;
    let from_record = module.member_in(&record.self_instance, field)?;

    let mut setter_body = MethodBody::new();
    let mut asm = InstructionAssembler::new(&mut setter_body);
    asm.ldarg(1)?
        .ldarg(0)?
        .field(Opcode::Stfld, from_record)?
        .op(Opcode::Ret)?;
    asm.append_to_body()?;

    let setter = module.add_method(
        record.ty,
        MethodDef::new(
            format!("set_{name}"),
            MethodAccessFlags::ASSEM,
            MethodModifiers::STATIC | MethodModifiers::HIDE_BY_SIG,
            TypeSig::Void,
            vec![
                Parameter::new("value", signature),
                Parameter::new("closure", record.self_instance.clone()),
            ],
        )
        .with_body(setter_body),
    )?;
    let setter = module.member_in(&record.owner_instance, setter)?;

    Ok(CapturedField {
        field,
        from_owner,
        from_record,
        setter,
    })
}

/// Rewrites every load, store and address load of a captured variable in the owner body.
fn redirect_accesses(
    ctx: &mut RewriteContext,
    body: &mut MethodBody,
    record: &ClosureRecord,
) -> Result<()> {
    let code = body.code().to_vec();
    for id in code {
        if record.prologue.contains(&id) {
            continue;
        }
        let Some((access, index)) = body.instr(id)?.variable() else {
            continue;
        };
        let item = Captured::from_access(access, index);
        let Some(field) = record.fields.get(&item) else {
            continue;
        };

        let mut asm = InstructionAssembler::new(body);
        asm.ldloc(record.local)?;
        if access.is_store() {
            asm.method(Opcode::Call, field.setter)?;
        } else if access.is_address() {
            asm.field(Opcode::Ldflda, field.from_owner)?;
        } else {
            asm.field(Opcode::Ldfld, field.from_owner)?;
        }
        let replacement = asm.finish()?;
        editor::replace_with(body, ctx, id, &replacement)?;
    }
    Ok(())
}

/// Gives the constructor one parameter per captured argument and its body.
fn finish_constructor(
    module: &mut Module,
    runtime: &FilterRuntime,
    record: &mut ClosureRecord,
) -> Result<()> {
    let mut params = Vec::new();
    let mut fields = Vec::new();
    for (item, field) in &record.fields {
        if let Captured::Argument(index) = item {
            record.ctor_params.push(*index);
            let def = module.field(field.field)?;
            params.push(Parameter::new(def.name.clone(), def.signature.clone()));
            fields.push(field.from_record);
        }
    }

    let mut ctor_body = MethodBody::new();
    let mut asm = InstructionAssembler::new(&mut ctor_body);
    asm.ldarg(0)?.method(Opcode::Call, runtime.object_ctor)?;
    for (slot, field) in fields.iter().enumerate() {
        asm.ldarg(0)?
            .ldarg(slot as u16 + 1)?
            .field(Opcode::Stfld, *field)?;
    }
    asm.op(Opcode::Ret)?;
    asm.append_to_body()?;

    let ctor = module.method_mut(record.ctor)?;
    ctor.params = params;
    ctor.body = Some(ctor_body);
    Ok(())
}

/// `ldarg a...; newobj .ctor; stloc rec` at the very start of the owner, entered by nothing
/// but method entry.
fn emit_prologue(
    module: &mut Module,
    body: &mut MethodBody,
    record: &mut ClosureRecord,
) -> Result<()> {
    let ctor = module.member_in(&record.owner_instance, record.ctor)?;
    let mut asm = InstructionAssembler::new(body);
    for arg in &record.ctor_params {
        asm.ldarg(*arg)?;
    }
    asm.method(Opcode::Newobj, ctor)?.stloc(record.local)?;
    let prologue = asm.finish()?;

    editor::insert(body, 0, &prologue);
    record.prologue = prologue;
    Ok(())
}

/// Copies arguments captured on a later visit into the existing record, right after it is
/// constructed.
fn initialize_late_arguments(
    body: &mut MethodBody,
    record: &mut ClosureRecord,
    added: &[Captured],
) -> Result<()> {
    let mut asm = InstructionAssembler::new(body);
    let mut any = false;
    for item in added {
        if let Captured::Argument(index) = item {
            asm.ldloc(record.local)?
                .ldarg(*index)?
                .field(Opcode::Stfld, record.field(*item)?.from_owner)?;
            any = true;
        }
    }
    if !any {
        return Ok(());
    }
    let init = asm.finish()?;

    let anchor = record
        .prologue
        .last()
        .copied()
        .ok_or_else(|| consistency_error!("Capture record has no prologue"))?;
    let position = body.require_position(anchor)? + 1;
    editor::insert(body, position, &init);
    record.prologue.extend(init);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::signatures::GenericContext,
        rewriter::{context::NameCounters, RewriteConfig},
        test::factories::{instance_method, program_module},
    };

    fn usage(locals: &[u16], args: &[u16]) -> Usage {
        Usage {
            locals: locals.iter().copied().collect(),
            args: args.iter().copied().collect(),
        }
    }

    #[test]
    fn test_capture_rewrites_all_accesses() {
        let (mut module, program) = program_module();
        let mut body = MethodBody::new();
        body.add_local(TypeSig::I4).unwrap();
        let mut asm = InstructionAssembler::new(&mut body);
        asm.ldarg(1)
            .unwrap()
            .stloc(0)
            .unwrap()
            .ldloc(0)
            .unwrap()
            .ldloca(0)
            .unwrap()
            .op(Opcode::Pop)
            .unwrap()
            .op(Opcode::Pop)
            .unwrap()
            .op(Opcode::Ret)
            .unwrap();
        asm.append_to_body().unwrap();
        let method = instance_method(&mut module, program, "Run", vec![TypeSig::I4], body);

        let runtime = FilterRuntime::import(&mut module, &RewriteConfig::default());
        let mut ctx = RewriteContext::new(
            method,
            "Demo.Program::Run",
            GenericContext::default(),
            NameCounters::default(),
        );
        let mut body = module.method_mut(method).unwrap().body.take().unwrap();
        let record = capture(
            &mut module,
            &runtime,
            &mut ctx,
            &mut body,
            None,
            &usage(&[0], &[1]),
        )
        .unwrap();

        assert_eq!(record.local, 1);
        assert_eq!(record.ctor_params, vec![1]);
        assert_eq!(module.type_name(record.ty).unwrap(), "Demo.Program/__closure0");
        assert_eq!(
            body.opcodes(),
            vec![
                Opcode::Ldarg1,
                Opcode::Newobj,
                Opcode::Stloc1,
                // ldarg.1
                Opcode::Ldloc1,
                Opcode::Ldfld,
                // stloc.0
                Opcode::Ldloc1,
                Opcode::Call,
                // ldloc.0
                Opcode::Ldloc1,
                Opcode::Ldfld,
                // ldloca.s 0
                Opcode::Ldloc1,
                Opcode::Ldflda,
                Opcode::Pop,
                Opcode::Pop,
                Opcode::Ret,
            ]
        );

        let names: Vec<String> = module
            .type_def(record.ty)
            .unwrap()
            .methods
            .iter()
            .map(|m| module.method(*m).unwrap().name.clone())
            .collect();
        assert_eq!(names, vec![".ctor", "set_local0", "set_arg_value"]);
        assert_eq!(module.method(record.ctor).unwrap().params.len(), 1);
        assert_eq!(ctx.counters.closures, 1);
    }

    #[test]
    fn test_byref_arguments_are_forwarded() {
        let (mut module, program) = program_module();
        let mut body = MethodBody::new();
        body.push(crate::assembly::Instruction::simple(Opcode::Ret));
        let method = instance_method(
            &mut module,
            program,
            "Run",
            vec![TypeSig::ByRef(Box::new(TypeSig::I4))],
            body,
        );
        let runtime = FilterRuntime::import(&mut module, &RewriteConfig::default());
        let mut ctx = RewriteContext::new(
            method,
            "Demo.Program::Run",
            GenericContext::default(),
            NameCounters::default(),
        );
        let mut body = module.method_mut(method).unwrap().body.take().unwrap();
        let record = capture(
            &mut module,
            &runtime,
            &mut ctx,
            &mut body,
            None,
            &usage(&[], &[1]),
        )
        .unwrap();

        assert!(record.fields.is_empty());
        assert_eq!(record.passthrough, vec![1]);
        assert!(record.field(Captured::Argument(1)).unwrap_err().is_consistency());
    }

    #[test]
    fn test_byref_local_is_not_eligible() {
        let (mut module, program) = program_module();
        let mut body = MethodBody::new();
        body.add_local(TypeSig::ByRef(Box::new(TypeSig::I4))).unwrap();
        body.push(crate::assembly::Instruction::simple(Opcode::Ret));
        let method = instance_method(&mut module, program, "Run", vec![], body);
        let runtime = FilterRuntime::import(&mut module, &RewriteConfig::default());
        let mut ctx = RewriteContext::new(
            method,
            "Demo.Program::Run",
            GenericContext::default(),
            NameCounters::default(),
        );
        let mut body = module.method_mut(method).unwrap().body.take().unwrap();
        let err = capture(
            &mut module,
            &runtime,
            &mut ctx,
            &mut body,
            None,
            &usage(&[0], &[]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Eligibility { .. }));
    }

    #[test]
    fn test_revisit_adds_missing_fields_only() {
        let (mut module, program) = program_module();
        let mut body = MethodBody::new();
        body.add_local(TypeSig::I4).unwrap();
        let mut asm = InstructionAssembler::new(&mut body);
        asm.ldloc(0)
            .unwrap()
            .starg(1)
            .unwrap()
            .op(Opcode::Ret)
            .unwrap();
        asm.append_to_body().unwrap();
        let method = instance_method(&mut module, program, "Run", vec![TypeSig::I4], body);
        let runtime = FilterRuntime::import(&mut module, &RewriteConfig::default());
        let mut ctx = RewriteContext::new(
            method,
            "Demo.Program::Run",
            GenericContext::default(),
            NameCounters::default(),
        );
        let mut body = module.method_mut(method).unwrap().body.take().unwrap();

        let first = capture(
            &mut module,
            &runtime,
            &mut ctx,
            &mut body,
            None,
            &usage(&[0], &[]),
        )
        .unwrap();
        let fields_before = module.type_def(first.ty).unwrap().fields.len();

        let second = capture(
            &mut module,
            &runtime,
            &mut ctx,
            &mut body,
            Some(first.clone()),
            &usage(&[0], &[1]),
        )
        .unwrap();

        assert_eq!(second.ty, first.ty);
        assert_eq!(ctx.counters.closures, 1);
        assert_eq!(
            module.type_def(second.ty).unwrap().fields.len(),
            fields_before + 1
        );
        // newobj; stloc; then the late argument copy
        assert_eq!(
            &body.opcodes()[..5],
            &[
                Opcode::Newobj,
                Opcode::Stloc1,
                Opcode::Ldloc1,
                Opcode::Ldarg1,
                Opcode::Stfld
            ]
        );
        assert_eq!(second.prologue.len(), 5);
        assert!(!body.opcodes().contains(&Opcode::StargS));
    }
}
