//! Filter activation protocol.
//!
//! Each filter gets a small object deriving from the runtime filter base type, whose
//! `Evaluate` override calls the extracted predicate with the capture record:
//!
//! ```text
//! __closure0                      capture record
//! ├── filter0                     ExceptionFilter field, created on first activation
//! ├── filter0(record, object)     predicate
//! ├── activate_filter0(record)    create once, Push
//! ├── deactivate_filter0(record)  Pop
//! └── __filter0 : ExceptionFilter
//!     ├── closure
//!     └── Evaluate(object) => __closure0.filter0(closure, object)
//! ```
//!
//! Activation runs right before the protected range is entered, deactivation right before
//! every `leave` that exits it. The replacement handler deactivates on entry, so a catch
//! body that throws cannot leave a stale filter behind.

use crate::{
    assembly::{InstrId, InstructionAssembler, Opcode},
    metadata::{
        method::{MethodAccessFlags, MethodBody, MethodDef, MethodModifiers, Parameter},
        module::Module,
        signatures::TypeSig,
        token::Token,
        typedef::{FieldAttributes, TypeAttributes, TypeDef},
    },
    rewriter::{
        closure::ClosureRecord,
        context::{FilterUnits, RewriteContext},
        editor,
        runtime::FilterRuntime,
        units::PredicateUnit,
    },
    Result,
};

/// Synthesizes the filter type and the activation units for an extracted predicate.
///
/// # Errors
/// Returns [`crate::Error::TokenNotFound`] if the record type does not resolve.
pub fn synthesize(
    module: &mut Module,
    runtime: &FilterRuntime,
    record: &ClosureRecord,
    predicate: PredicateUnit,
) -> Result<FilterUnits> {
    let number = predicate.number;
    let generic_params = module.type_def(record.ty)?.generic_params.clone();
    let arity = generic_params.len() as u16;

    let filter_type = module.add_nested_type(
        record.ty,
        TypeDef::new(
            "",
            format!("__filter{number}"),
            TypeAttributes::NESTED_PRIVATE | TypeAttributes::SEALED,
        )
        .with_extends(runtime.filter_type)
        .with_generic_params(&generic_params),
    )?;
    let filter_instance = TypeSig::self_instance(filter_type, arity);

    let closure_field = module.add_field(
        filter_type,
        "closure",
        FieldAttributes::ASSEMBLY,
        record.self_instance.clone(),
    )?;
    let closure_field = module.member_in(&filter_instance, closure_field)?;

    let mut ctor_body = MethodBody::new();
    let mut asm = InstructionAssembler::new(&mut ctor_body);
    asm.ldarg(0)?
        .method(Opcode::Call, runtime.filter_ctor)?
        .ldarg(0)?
        .ldarg(1)?
        .field(Opcode::Stfld, closure_field)?
        .op(Opcode::Ret)?;
    asm.append_to_body()?;
    let ctor = module.add_method(
        filter_type,
        MethodDef::new(
            ".ctor",
            MethodAccessFlags::ASSEM,
            MethodModifiers::constructor(),
            TypeSig::Void,
            vec![Parameter::new("closure", record.self_instance.clone())],
        )
        .with_body(ctor_body),
    )?;

    let predicate_ref = module.member_in(&record.self_instance, predicate.method)?;
    let mut evaluate_body = MethodBody::new();
    let mut asm = InstructionAssembler::new(&mut evaluate_body);
    asm.ldarg(0)?
        .field(Opcode::Ldfld, closure_field)?
        .ldarg(1)?
        .method(Opcode::Call, predicate_ref)?
        .op(Opcode::Ret)?;
    asm.append_to_body()?;
    module.add_method(
        filter_type,
        MethodDef::new(
            FilterRuntime::EVALUATE,
            MethodAccessFlags::PUBLIC,
            MethodModifiers::VIRTUAL | MethodModifiers::HIDE_BY_SIG,
            TypeSig::I4,
            vec![Parameter::new("exception", TypeSig::Object)],
        )
        .with_body(evaluate_body),
    )?;

    let slot = module.add_field(
        record.ty,
        format!("filter{number}"),
        FieldAttributes::ASSEMBLY,
        filter_instance.clone(),
    )?;
    let slot_in_record = module.member_in(&record.self_instance, slot)?;
    let ctor_ref = module.member_in(&filter_instance, ctor)?;

    let mut activate_body = MethodBody::new();
    let mut asm = InstructionAssembler::new(&mut activate_body);
    let have = asm.new_label();
    asm.ldarg(0)?
        .field(Opcode::Ldfld, slot_in_record)?
        .branch(Opcode::Brtrue, have)?
        .ldarg(0)?
        .ldarg(0)?
        .method(Opcode::Newobj, ctor_ref)?
        .field(Opcode::Stfld, slot_in_record)?;
    asm.bind(have)?;
    asm.ldarg(0)?
        .field(Opcode::Ldfld, slot_in_record)?
        .method(Opcode::Call, runtime.push)?
        .op(Opcode::Ret)?;
    asm.append_to_body()?;
    let activate = add_unit(module, record, format!("activate_filter{number}"), activate_body)?;

    let mut deactivate_body = MethodBody::new();
    let mut asm = InstructionAssembler::new(&mut deactivate_body);
    asm.ldarg(0)?
        .field(Opcode::Ldfld, slot_in_record)?
        .method(Opcode::Call, runtime.pop)?
        .op(Opcode::Ret)?;
    asm.append_to_body()?;
    let deactivate = add_unit(module, record, format!("deactivate_filter{number}"), deactivate_body)?;

    Ok(FilterUnits {
        field: module.member_in(&record.owner_instance, slot)?,
        activate: module.member_in(&record.owner_instance, activate)?,
        deactivate: module.member_in(&record.owner_instance, deactivate)?,
    })
}

fn add_unit(module: &mut Module, record: &ClosureRecord, name: String, body: MethodBody) -> Result<Token> {
    module.add_method(
        record.ty,
        MethodDef::new(
            name,
            MethodAccessFlags::ASSEM,
            MethodModifiers::STATIC | MethodModifiers::HIDE_BY_SIG,
            TypeSig::Void,
            vec![Parameter::new("closure", record.self_instance.clone())],
        )
        .with_body(body),
    )
}

/// Allocates `ldloc record; call unit` for every unit, in the given order.
pub(crate) fn calls<'a>(
    body: &mut MethodBody,
    record: &ClosureRecord,
    units: impl IntoIterator<Item = &'a Token>,
) -> Result<Vec<InstrId>> {
    let mut asm = InstructionAssembler::new(body);
    for unit in units {
        asm.ldloc(record.local)?.method(Opcode::Call, *unit)?;
    }
    asm.finish()
}

/// Activates the filters of group `index`, in declared order, right before its try range.
///
/// Only references from outside the try range move to the activation; jumps within the range
/// back to its first instruction and regions nested in it keep their boundary.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if the group's range is not placed.
pub fn insert_activation(
    body: &mut MethodBody,
    ctx: &mut RewriteContext,
    record: &ClosureRecord,
    index: usize,
) -> Result<()> {
    let group = ctx.groups[index].clone();
    let ids = calls(body, record, group.filters().map(|units| &units.activate))?;
    let Some(first) = ids.first().copied() else {
        return Ok(());
    };

    let position = body.require_position(group.try_start)?;
    editor::insert(body, position, &ids);
    let (try_first, try_after) = body.span(group.try_start, Some(group.try_end))?;

    editor::retarget_operands(body, group.try_start, first, |position, _| {
        position < try_first.saturating_sub(ids.len()) || position >= try_after
    });

    let mut nested = Vec::with_capacity(body.exception_handlers.len());
    for region in &body.exception_handlers {
        let (start, end) = body.span(region.try_start, Some(region.try_end))?;
        nested.push(start >= try_first && end <= try_after);
    }
    for (region, nested) in body.exception_handlers.iter_mut().zip(nested) {
        if !nested {
            region.retarget(group.try_start, first);
        }
    }
    ctx.remap_except(group.try_start, first, Some(index));
    Ok(())
}

/// Deactivates the filters of group `index`, in reverse order, before every `leave` that exits
/// its try range. Returns the number of exits instrumented.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if the group's range is not placed.
pub fn insert_deactivations(
    body: &mut MethodBody,
    ctx: &mut RewriteContext,
    record: &ClosureRecord,
    index: usize,
) -> Result<usize> {
    let group = ctx.groups[index].clone();
    let (try_first, try_after) = body.span(group.try_start, Some(group.try_end))?;
    let positions = body.positions();

    let mut exits = Vec::new();
    for id in &body.code()[try_first..try_after] {
        let instruction = body.instr(*id)?;
        if !instruction.is_leave() {
            continue;
        }
        let leaves_try = instruction
            .target()
            .and_then(|target| positions.get(&target))
            .map_or(true, |position| *position < try_first || *position >= try_after);
        if leaves_try {
            exits.push(*id);
        }
    }

    for exit in &exits {
        let ids = calls(body, record, group.filters().rev().map(|units| &units.deactivate))?;
        editor::insert_before(body, ctx, *exit, &ids)?;
    }
    Ok(exits.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        rewriter::{context::CatchUnit, units},
        test::factories::{captured_record, FilterFixture},
    };

    fn prepared() -> (FilterFixture, ClosureRecord, FilterUnits) {
        let mut fx = FilterFixture::new();
        let record = captured_record(&mut fx);
        let region = fx.body.exception_handlers[0].clone();
        let predicate =
            units::extract_filter(&mut fx.module, &mut fx.ctx, &record, &mut fx.body, &region, 0).unwrap();
        let filter = synthesize(&mut fx.module, &fx.runtime, &record, predicate).unwrap();
        fx.ctx.groups = vec![fx.group(Some(filter.clone()))];
        (fx, record, filter)
    }

    #[test]
    fn test_filter_type_layout() {
        let (fx, record, _) = prepared();
        let closure = fx.module.type_def(record.ty).unwrap();
        let filter_type = fx.module.type_def(closure.nested[0]).unwrap();
        assert_eq!(filter_type.name, "__filter0");
        assert_eq!(filter_type.extends, Some(fx.runtime.filter_type));

        let names: Vec<&str> = filter_type
            .methods
            .iter()
            .map(|m| fx.module.method(*m).unwrap().name.as_str())
            .collect();
        assert_eq!(names, vec![".ctor", "Evaluate"]);

        let record_methods: Vec<String> = closure
            .methods
            .iter()
            .map(|m| fx.module.method(*m).unwrap().name.clone())
            .collect();
        assert!(record_methods.contains(&"activate_filter0".to_string()));
        assert!(record_methods.contains(&"deactivate_filter0".to_string()));
    }

    #[test]
    fn test_activation_precedes_try() {
        let (mut fx, record, filter) = prepared();
        let try_start = fx.ctx.groups[0].try_start;
        insert_activation(&mut fx.body, &mut fx.ctx, &record, 0).unwrap();

        let position = fx.body.require_position(try_start).unwrap();
        let call = fx.body.instr(fx.body.at(position - 1).unwrap()).unwrap();
        assert_eq!(call.operand.token(), Some(filter.activate));
        assert_eq!(fx.body.exception_handlers[0].try_start, try_start);
        assert_eq!(fx.ctx.groups[0].try_start, try_start);
    }

    #[test]
    fn test_catch_resuming_at_try_start_reactivates() {
        let (mut fx, record, filter) = prepared();
        let try_start = fx.ctx.groups[0].try_start;
        fx.ctx.groups[0].handlers[0].catch = Some(CatchUnit {
            method: Token(0x0600_0009),
            targets: vec![try_start],
            rethrows: true,
        });
        insert_activation(&mut fx.body, &mut fx.ctx, &record, 0).unwrap();

        let position = fx.body.require_position(try_start).unwrap();
        let activation = fx.body.at(position - 2).unwrap();
        let call = fx.body.instr(fx.body.at(position - 1).unwrap()).unwrap();
        assert_eq!(call.operand.token(), Some(filter.activate));

        let group = &fx.ctx.groups[0];
        assert_eq!(group.handlers[0].catch.as_ref().unwrap().targets, vec![activation]);
        assert_eq!(group.try_start, try_start);
        assert_eq!(fx.body.exception_handlers[0].try_start, try_start);
    }

    #[test]
    fn test_deactivation_before_exit() {
        let (mut fx, record, filter) = prepared();
        let exits = insert_deactivations(&mut fx.body, &mut fx.ctx, &record, 0).unwrap();
        assert_eq!(exits, 1);

        let position = fx.body.require_position(fx.try_leave).unwrap();
        let call = fx.body.instr(fx.body.at(position - 1).unwrap()).unwrap();
        assert_eq!(call.operand.token(), Some(filter.deactivate));
    }
}
