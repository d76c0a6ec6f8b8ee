//! Instruction-list editing that keeps cross-references consistent.
//!
//! Every operation that takes an instruction out of the code sequence, or puts new code in
//! front of one, moves the references to that instruction along with it: branch and leave
//! operands, switch tables, exception region boundaries and the handler group descriptors
//! held by the [`RewriteContext`].
//!
//! The editor does not check what it is asked to do. A reference that ends up pointing at an
//! instruction outside the sequence is reported later by
//! [`crate::metadata::validation::BodyValidator`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilfilter::assembly::{Instruction, Opcode, Operand};
//! use cilfilter::metadata::{method::MethodBody, signatures::GenericContext, token::Token};
//! use cilfilter::rewriter::{editor, NameCounters, RewriteContext};
//!
//! let mut body = MethodBody::new();
//! let ret = body.alloc(Instruction::simple(Opcode::Ret));
//! body.push(Instruction::new(Opcode::Br, Operand::Target(ret)));
//! body.append(ret);
//!
//! let mut ctx = RewriteContext::new(Token(0x0600_0001), "M", GenericContext::default(), NameCounters::default());
//! let nop = body.alloc(Instruction::nop());
//! editor::insert_before(&mut body, &mut ctx, ret, &[nop])?;
//! assert_eq!(body.instr(body.code()[0])?.target(), Some(nop));
//! # Ok::<(), cilfilter::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    assembly::InstrId,
    metadata::method::{ExceptionHandler, MethodBody},
    rewriter::context::RewriteContext,
    Result,
};

/// Places already allocated instructions at `position` without touching any reference.
pub fn insert(body: &mut MethodBody, position: usize, ids: &[InstrId]) {
    let code = body.code_mut();
    let position = position.min(code.len());
    code.splice(position..position, ids.iter().copied());
}

/// Redirects operand references from `old` to `new` on every placed instruction for which
/// `include(position, id)` holds. Returns the number of operands changed.
pub fn retarget_operands<F>(body: &mut MethodBody, old: InstrId, new: InstrId, include: F) -> usize
where
    F: Fn(usize, InstrId) -> bool,
{
    let code = body.code().to_vec();
    let mut changed = 0;
    for (position, id) in code.into_iter().enumerate() {
        if !include(position, id) {
            continue;
        }
        if let Some(instruction) = body.get_mut(id) {
            if instruction.operand.retarget(old, new) {
                changed += 1;
            }
        }
    }
    changed
}

/// Redirects region boundaries from `old` to `new` on every region for which `include` holds.
pub fn retarget_regions<F>(body: &mut MethodBody, old: InstrId, new: InstrId, include: F)
where
    F: Fn(&ExceptionHandler) -> bool,
{
    for region in &mut body.exception_handlers {
        if include(region) {
            region.retarget(old, new);
        }
    }
}

/// Moves every reference from `old` to `new`: operands, regions and group descriptors.
fn redirect(body: &mut MethodBody, ctx: &mut RewriteContext, old: InstrId, new: InstrId) {
    retarget_operands(body, old, new, |_, _| true);
    retarget_regions(body, old, new, |_| true);
    ctx.remap(old, new);
}

/// Places `ids` in front of `anchor` and redirects every reference to `anchor` to the first
/// inserted instruction, so the new code runs wherever `anchor` used to be entered.
///
/// References held by the inserted instructions themselves are left alone.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if `anchor` is not placed.
pub fn insert_before(
    body: &mut MethodBody,
    ctx: &mut RewriteContext,
    anchor: InstrId,
    ids: &[InstrId],
) -> Result<()> {
    let Some(first) = ids.first().copied() else {
        return Ok(());
    };
    let position = body.require_position(anchor)?;
    insert(body, position, ids);

    let inserted = position..position + ids.len();
    retarget_operands(body, anchor, first, |position, _| !inserted.contains(&position));
    retarget_regions(body, anchor, first, |_| true);
    ctx.remap(anchor, first);
    Ok(())
}

/// Replaces `old` by the already allocated `new`.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if `old` is not placed.
pub fn replace_one(
    body: &mut MethodBody,
    ctx: &mut RewriteContext,
    old: InstrId,
    new: InstrId,
) -> Result<()> {
    replace_with(body, ctx, old, &[new])
}

/// Replaces `old` by a sequence. References to `old` move to the first instruction of the
/// sequence; an empty sequence removes `old` like [`remove`].
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if `old` is not placed.
pub fn replace_with(
    body: &mut MethodBody,
    ctx: &mut RewriteContext,
    old: InstrId,
    ids: &[InstrId],
) -> Result<()> {
    let Some(first) = ids.first().copied() else {
        return remove(body, ctx, old);
    };
    let position = body.require_position(old)?;
    body.code_mut()
        .splice(position..=position, ids.iter().copied());
    redirect(body, ctx, old, first);
    Ok(())
}

/// Applies [`replace_one`] for every entry of `map`.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if a replaced instruction is not placed.
pub fn replace_many(
    body: &mut MethodBody,
    ctx: &mut RewriteContext,
    map: &HashMap<InstrId, InstrId>,
) -> Result<()> {
    let mut entries: Vec<_> = map.iter().map(|(old, new)| (*old, *new)).collect();
    entries.sort_unstable();
    for (old, new) in entries {
        replace_one(body, ctx, old, new)?;
    }
    Ok(())
}

/// Takes `id` out of the sequence and redirects its references to its successor.
///
/// When `id` was the last instruction, region ends pointing at it become "end of body"; any
/// other reference is left dangling for the validator to report.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if `id` is not placed.
pub fn remove(body: &mut MethodBody, ctx: &mut RewriteContext, id: InstrId) -> Result<()> {
    let position = body.require_position(id)?;
    body.code_mut().remove(position);
    ctx.placeholders.remove(&id);

    match body.at(position) {
        Some(successor) => redirect(body, ctx, id, successor),
        None => {
            for region in &mut body.exception_handlers {
                if region.handler_end == Some(id) {
                    region.handler_end = None;
                }
            }
        }
    }
    Ok(())
}

/// Removes every placed placeholder, last first, so references always move to the next
/// instruction that survives. Returns how many were removed.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if the bookkeeping is out of sync with the body.
pub fn strip_placeholders(body: &mut MethodBody, ctx: &mut RewriteContext) -> Result<usize> {
    let positions = body.positions();
    let mut placed: Vec<(usize, InstrId)> = ctx
        .placeholders
        .iter()
        .filter_map(|id| positions.get(id).map(|position| (*position, *id)))
        .collect();
    placed.sort_unstable_by(|a, b| b.cmp(a));

    for (_, id) in &placed {
        remove(body, ctx, *id)?;
    }
    ctx.placeholders.clear();
    Ok(placed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{Instruction, Opcode, Operand},
        metadata::{signatures::GenericContext, token::Token},
        rewriter::context::{GroupHandler, HandlerGroup, NameCounters},
    };

    fn context() -> RewriteContext {
        RewriteContext::new(
            Token(0x0600_0001),
            "Demo.Program::Run",
            GenericContext::default(),
            NameCounters::default(),
        )
    }

    /// `0: ldc.i4.0  1: brtrue 3  2: nop  3: ret`, with a catch region around 1..3
    fn sample() -> (MethodBody, Vec<InstrId>) {
        let mut body = MethodBody::new();
        let load = body.push(Instruction::ldc_i4(0));
        let ret = body.alloc(Instruction::simple(Opcode::Ret));
        let branch = body.push(Instruction::new(Opcode::Brtrue, Operand::Target(ret)));
        let nop = body.push(Instruction::nop());
        body.append(ret);
        body.exception_handlers.push(ExceptionHandler::catch(
            branch,
            nop,
            nop,
            Some(ret),
            Token(0x0100_0001),
        ));
        (body, vec![load, branch, nop, ret])
    }

    #[test]
    fn test_insert_keeps_references() {
        let (mut body, ids) = sample();
        let extra = body.alloc(Instruction::nop());
        insert(&mut body, 1, &[extra]);
        assert_eq!(body.code()[1], extra);
        assert_eq!(body.exception_handlers[0].try_start, ids[1]);
        assert_eq!(body.instr(ids[1]).unwrap().target(), Some(ids[3]));
    }

    #[test]
    fn test_insert_before_redirects_everything_but_itself() {
        let (mut body, ids) = sample();
        let mut ctx = context();
        let back = body.alloc(Instruction::new(Opcode::Br, Operand::Target(ids[3])));
        let pop = body.alloc(Instruction::simple(Opcode::Pop));
        insert_before(&mut body, &mut ctx, ids[3], &[pop, back]).unwrap();

        assert_eq!(body.instr(ids[1]).unwrap().target(), Some(pop));
        assert_eq!(body.instr(back).unwrap().target(), Some(ids[3]));
        assert_eq!(body.exception_handlers[0].handler_end, Some(pop));
        assert_eq!(body.len(), 6);
    }

    #[test]
    fn test_replace_moves_regions_and_groups() {
        let (mut body, ids) = sample();
        let mut ctx = context();
        ctx.groups.push(HandlerGroup {
            try_start: ids[1],
            try_end: ids[2],
            handlers: vec![GroupHandler {
                region: body.exception_handlers[0].clone(),
                filter: None,
                catch: None,
            }],
            exit: None,
        });

        let first = body.alloc(Instruction::ldc_i4(1));
        let second = body.alloc(Instruction::new(Opcode::Brtrue, Operand::Target(ids[3])));
        replace_with(&mut body, &mut ctx, ids[1], &[first, second]).unwrap();

        assert_eq!(body.code(), &[ids[0], first, second, ids[2], ids[3]]);
        assert_eq!(body.exception_handlers[0].try_start, first);
        assert_eq!(ctx.groups[0].try_start, first);
        assert_eq!(ctx.groups[0].handlers[0].region.try_start, first);
    }

    #[test]
    fn test_replace_many() {
        let (mut body, ids) = sample();
        let mut ctx = context();
        let new_ret = body.alloc(Instruction::simple(Opcode::Ret));
        let new_nop = body.alloc(Instruction::nop());
        let map = HashMap::from([(ids[3], new_ret), (ids[2], new_nop)]);
        replace_many(&mut body, &mut ctx, &map).unwrap();

        assert_eq!(body.code(), &[ids[0], ids[1], new_nop, new_ret]);
        assert_eq!(body.instr(ids[1]).unwrap().target(), Some(new_ret));
        assert_eq!(body.exception_handlers[0].handler_start, new_nop);
    }

    #[test]
    fn test_remove_redirects_to_successor() {
        let (mut body, ids) = sample();
        let mut ctx = context();
        remove(&mut body, &mut ctx, ids[2]).unwrap();
        assert_eq!(body.exception_handlers[0].try_end, ids[3]);
        assert_eq!(body.exception_handlers[0].handler_start, ids[3]);
        assert!(remove(&mut body, &mut ctx, ids[2]).is_err());
    }

    #[test]
    fn test_strip_trailing_placeholders() {
        let (mut body, ids) = sample();
        let mut ctx = context();
        *body.instr_mut(ids[3]).unwrap() = Instruction::nop();
        let tail = body.push(Instruction::nop());
        body.exception_handlers[0].handler_end = Some(ids[3]);
        ctx.placeholders.insert(ids[3]);
        ctx.placeholders.insert(tail);

        assert_eq!(strip_placeholders(&mut body, &mut ctx).unwrap(), 2);
        assert_eq!(body.code(), &[ids[0], ids[1], ids[2]]);
        assert_eq!(body.exception_handlers[0].handler_end, None);
        assert!(ctx.placeholders.is_empty());
    }
}
