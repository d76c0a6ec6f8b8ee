//! Filter predicates and catch bodies moved onto the capture record.
//!
//! Both kinds of unit are static methods on the record type whose first parameter is the
//! record itself. Inside them the record local of the owner maps to argument 0 and the
//! exception, which the runtime pushes on entry to a filter or handler, is passed in as the
//! last argument.
//!
//! A catch unit cannot `leave` to code of the owner. Every outbound `leave` becomes a store
//! of a resumption code into the result local followed by a `leave` to the unit's exit, and
//! the owner dispatches on the returned code:
//!
//! ```text
//! 0        rethrow the original exception
//! k >= 1   leave to targets[k - 1]
//! ```

use crate::{
    assembly::{InstrId, Instruction, Opcode, Operand, VariableAccess},
    metadata::{
        method::{ExceptionHandler, MethodAccessFlags, MethodBody, MethodDef, MethodModifiers, Parameter},
        module::Module,
        signatures::TypeSig,
        token::Token,
    },
    rewriter::{
        closure::ClosureRecord,
        context::{CatchUnit, RewriteContext},
        events::EventKind,
        extract::{self, lift_token, ExtractRange, Slot, VariableMapping},
        scanner,
    },
    Result,
};

/// A filter predicate `filterN(record, exception) -> int32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredicateUnit {
    /// Number shared by the predicate, its filter type and activation units
    pub number: u32,
    /// The method definition
    pub method: Token,
}

/// Overwrites `[start, end)` of the owner with placeholders.
fn consume(body: &mut MethodBody, ctx: &mut RewriteContext, start: usize, end: usize) -> Result<()> {
    let consumed = body.code()[start..end].to_vec();
    for id in consumed {
        *body.instr_mut(id)? = Instruction::nop();
        ctx.placeholders.insert(id);
    }
    Ok(())
}

fn unit_flags() -> (MethodAccessFlags, MethodModifiers) {
    (
        MethodAccessFlags::ASSEM,
        MethodModifiers::STATIC | MethodModifiers::HIDE_BY_SIG,
    )
}

/// Last instruction before `end`, or of the body when `end` is `None`.
fn last_before(body: &MethodBody, start: InstrId, end: Option<InstrId>) -> Result<(usize, usize, InstrId)> {
    let (first, after) = body.span(start, end)?;
    if after <= first {
        return Err(consistency_error!("Empty region starting at {}", start));
    }
    let last = body
        .at(after - 1)
        .ok_or_else(|| consistency_error!("Region starting at {} has no last instruction", start))?;
    Ok((first, after, last))
}

/// Moves the filter range of `region` into a new predicate on the record type.
///
/// # Errors
/// Returns [`crate::Error::Shape`] if the filter does not end in `endfilter` or uses a byref
/// parameter, and [`crate::Error::Consistency`] if it still touches owner variables other than
/// the record.
pub fn extract_filter(
    module: &mut Module,
    ctx: &mut RewriteContext,
    record: &ClosureRecord,
    body: &mut MethodBody,
    region: &ExceptionHandler,
    group: usize,
) -> Result<PredicateUnit> {
    let filter_start = region
        .filter_start
        .ok_or_else(|| consistency_error!("Region at {} has no filter", region.try_start))?;
    let (first, after, last) = last_before(body, filter_start, Some(region.handler_start))?;

    let usage = scanner::scan(body, filter_start, last, Some(record.local))?;
    if let Some(arg) = usage.args.iter().find(|arg| record.is_passthrough(**arg)) {
        return Err(shape_error!(
            "{}: filter at {} uses byref parameter {}",
            ctx.method_name,
            filter_start,
            arg
        ));
    }

    let number = ctx.counters.next_filter();
    let mut unit = MethodBody::new();
    unit.push(Instruction::simple(Opcode::Ldarg1));
    let mut mapping = VariableMapping::new().with_local(record.local, Slot::Argument(0));
    let method_name = ctx.method_name.clone();
    let extraction = extract::extract(
        module,
        &ctx.generics,
        body,
        &mut unit,
        ExtractRange {
            first: filter_start,
            last,
            end_anchor: None,
        },
        &mut mapping,
        |site| {
            if site.is_last && site.instruction.opcode != Opcode::Endfilter {
                return Err(shape_error!(
                    "{}: filter at {} ends in {} instead of endfilter",
                    method_name,
                    filter_start,
                    site.instruction.opcode.mnemonic()
                ));
            }
            if site.instruction.opcode == Opcode::Endfilter {
                return Ok(Some(vec![Instruction::simple(Opcode::Ret)]));
            }
            Ok(None)
        },
    )?;
    for id in &extraction.code {
        unit.append(*id);
    }
    unit.max_stack = (body.max_stack + 1).max(2);

    let (access, modifiers) = unit_flags();
    let method = module.add_method(
        record.ty,
        MethodDef::new(
            format!("filter{number}"),
            access,
            modifiers,
            TypeSig::I4,
            vec![
                Parameter::new("closure", record.self_instance.clone()),
                Parameter::new("exception", TypeSig::Object),
            ],
        )
        .with_body(unit),
    )?;

    consume(body, ctx, first, after)?;
    ctx.events
        .record(EventKind::FilterExtracted)
        .at(ctx.method, group)
        .message(format!("filter at {filter_start} -> filter{number}"));
    log::trace!("{}: filter{} extracted from {} instructions", ctx.method_name, number, after - first);

    Ok(PredicateUnit { number, method })
}

/// Moves the handler range of `region` into a new catch unit on the record type.
///
/// # Errors
/// Returns [`crate::Error::Shape`] if the handler does not end in `leave`, `rethrow` or `throw`,
/// and [`crate::Error::Consistency`] for branches out of the handler other than `leave`.
pub fn extract_catch(
    module: &mut Module,
    ctx: &mut RewriteContext,
    record: &ClosureRecord,
    body: &mut MethodBody,
    region: &ExceptionHandler,
    group: usize,
) -> Result<CatchUnit> {
    let (first, after, last) = last_before(body, region.handler_start, region.handler_end)?;
    let number = ctx.counters.next_catch();

    let mut unit = MethodBody::new();
    let result = unit.add_local(TypeSig::I4)?;
    let exception = record.passthrough.len() as u16 + 1;

    let mut mapping = VariableMapping::new().with_local(record.local, Slot::Argument(0));
    let mut params = vec![Parameter::new("closure", record.self_instance.clone())];
    for (slot, arg) in record.passthrough.iter().enumerate() {
        mapping = mapping.with_arg(*arg, Slot::Argument(slot as u16 + 1));
        let signature = ctx.generics.lift(&module.arg_signature(ctx.method, *arg)?);
        let name = module
            .method(ctx.method)?
            .param_for_arg(*arg)
            .map_or_else(|| "self".to_string(), |param| param.name.clone());
        params.push(Parameter::new(name, signature));
    }
    params.push(Parameter::new("exception", TypeSig::Object));

    let mut entry = vec![unit.alloc(Instruction::variable_access(
        VariableAccess::LoadArgument,
        exception,
    ))];
    if let Some(catch_type) = region.catch_type.filter(|ty| !module.is_system_object(*ty)) {
        let lifted = lift_token(module, &ctx.generics, catch_type)?;
        entry.push(unit.alloc(Instruction::new(Opcode::Castclass, Operand::Type(lifted))));
    }
    let exit = unit.alloc(Instruction::variable_access(
        VariableAccess::LoadLocal,
        result,
    ));
    let ret = unit.alloc(Instruction::simple(Opcode::Ret));

    let mut targets: Vec<InstrId> = Vec::new();
    let mut rethrows = false;
    let method_name = ctx.method_name.clone();
    let extraction = extract::extract(
        module,
        &ctx.generics,
        body,
        &mut unit,
        ExtractRange {
            first: region.handler_start,
            last,
            end_anchor: Some(exit),
        },
        &mut mapping,
        |site| {
            let opcode = site.instruction.opcode;
            if site.is_last && !matches!(opcode, Opcode::Leave | Opcode::LeaveS | Opcode::Rethrow | Opcode::Throw) {
                return Err(shape_error!(
                    "{}: handler at {} ends in {}",
                    method_name,
                    region.handler_start,
                    opcode.mnemonic()
                ));
            }
            let code = if site.instruction.is_leave() && site.targets_outside {
                let Some(target) = site.instruction.target() else {
                    return Ok(None);
                };
                match targets.iter().position(|known| *known == target) {
                    Some(index) => index + 1,
                    None => {
                        targets.push(target);
                        targets.len()
                    }
                }
            } else if opcode == Opcode::Rethrow && !site.in_nested_handler {
                rethrows = true;
                0
            } else {
                return Ok(None);
            };
            Ok(Some(vec![
                Instruction::ldc_i4(code as i32),
                Instruction::variable_access(VariableAccess::StoreLocal, result),
                Instruction::new(Opcode::Leave, Operand::Target(exit)),
            ]))
        },
    )?;

    for id in entry.iter().chain(&extraction.code).chain([&exit, &ret]) {
        unit.append(*id);
    }
    unit.max_stack = (body.max_stack + 1).max(2);

    let (access, modifiers) = unit_flags();
    let method = module.add_method(
        record.ty,
        MethodDef::new(format!("catch{number}"), access, modifiers, TypeSig::I4, params).with_body(unit),
    )?;
    let method = module.member_in(&record.owner_instance, method)?;

    consume(body, ctx, first, after)?;
    body.exception_handlers
        .retain(|region| !extraction.carried.contains(region));
    ctx.events
        .record(EventKind::CatchExtracted)
        .at(ctx.method, group)
        .message(format!(
            "handler at {} -> catch{number}, {} targets, {} regions{}",
            region.handler_start,
            targets.len(),
            extraction.carried.len(),
            if rethrows { ", rethrows" } else { "" }
        ));

    Ok(CatchUnit {
        method,
        targets,
        rethrows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::factories::{captured_record, FilterFixture};

    #[test]
    fn test_filter_becomes_predicate() {
        let mut fx = FilterFixture::new();
        let record = captured_record(&mut fx);
        let region = fx.body.exception_handlers[0].clone();

        let unit = extract_filter(&mut fx.module, &mut fx.ctx, &record, &mut fx.body, &region, 0).unwrap();
        assert_eq!(unit.number, 0);
        let def = fx.module.method(unit.method).unwrap();
        assert_eq!(def.name, "filter0");
        assert!(def.is_static());
        let opcodes = def.body.as_ref().unwrap().opcodes();
        assert_eq!(opcodes.first(), Some(&Opcode::Ldarg1));
        assert_eq!(opcodes.last(), Some(&Opcode::Ret));
        assert!(!opcodes.contains(&Opcode::Endfilter));

        let filter_start = region.filter_start.unwrap();
        assert!(fx.ctx.is_placeholder(filter_start));
        assert_eq!(fx.body.instr(filter_start).unwrap().opcode, Opcode::Nop);
        assert!(fx.ctx.events.has(EventKind::FilterExtracted));
    }

    #[test]
    fn test_units_reserve_a_slot_for_setters() {
        let mut fx = FilterFixture::new();
        fx.body.max_stack = 2;
        let record = captured_record(&mut fx);
        let region = fx.body.exception_handlers[0].clone();

        let filter = extract_filter(&mut fx.module, &mut fx.ctx, &record, &mut fx.body, &region, 0).unwrap();
        let catch = extract_catch(&mut fx.module, &mut fx.ctx, &record, &mut fx.body, &region, 0).unwrap();
        for unit in [filter.method, catch.method] {
            let def = fx.module.method(unit).unwrap();
            assert_eq!(def.body.as_ref().unwrap().max_stack, 3, "{}", def.name);
        }
    }

    #[test]
    fn test_catch_leave_becomes_code() {
        let mut fx = FilterFixture::new();
        let record = captured_record(&mut fx);
        let region = fx.body.exception_handlers[0].clone();
        let resume = fx.body.instr(fx.try_leave).unwrap().target().unwrap();

        let unit = extract_catch(&mut fx.module, &mut fx.ctx, &record, &mut fx.body, &region, 0).unwrap();
        assert_eq!(unit.targets, vec![resume]);
        assert!(!unit.rethrows);

        let def = fx.module.method(unit.method).unwrap();
        assert_eq!(def.name, "catch0");
        assert_eq!(def.params.len(), 2);
        let opcodes = def.body.as_ref().unwrap().opcodes();
        assert_eq!(opcodes[0], Opcode::Ldarg1);
        assert!(opcodes.ends_with(&[Opcode::LdcI41, Opcode::Stloc0, Opcode::Leave, Opcode::Ldloc0, Opcode::Ret]));
        assert!(fx.ctx.is_placeholder(region.handler_start));
    }

    #[test]
    fn test_filter_without_endfilter_is_shape_error() {
        let mut fx = FilterFixture::new();
        let record = captured_record(&mut fx);
        let mut region = fx.body.exception_handlers[0].clone();
        // Cut the filter short so its last instruction is not endfilter
        let start = fx.body.require_position(region.filter_start.unwrap()).unwrap();
        region.handler_start = fx.body.at(start + 1).unwrap();

        let err = extract_filter(&mut fx.module, &mut fx.ctx, &record, &mut fx.body, &region, 0).unwrap_err();
        assert!(matches!(err, crate::Error::Shape { .. }));
    }
}
