//! Handler groups and their replacement catch-all handler.
//!
//! Handlers protecting the identical try range form a group. Once every handler of a group
//! has been extracted, the group's regions are replaced by a single `catch [System.Object]`
//! region that asks the runtime which active filter claims the exception and then dispatches
//! to the extracted catch units in declared order:
//!
//! ```text
//!     stloc exc
//!     ldloc exc
//!     call ExceptionFilter::PerformEvaluate(object)
//!     ldloc rec; call deactivate_filterN          (reverse order)
//!     ldloc rec; ldfld filterN; ldloc exc
//!     callvirt ExceptionFilter::ShouldRunHandler(object)
//!     brfalse NEXT
//!     ldloc rec; ldarg byref...; ldloc exc
//!     call catchN
//!     switch (R, L1, L2)
//! R:  rethrow
//! L1: leave T1
//! L2: leave T2
//! NEXT:
//!     ...
//!     rethrow | leave EXIT
//! ```

use crate::{
    assembly::{InstrId, Instruction, InstructionAssembler, Opcode},
    metadata::{
        method::{ExceptionHandler, MethodBody},
        module::Module,
        signatures::TypeSig,
    },
    rewriter::{
        closure::ClosureRecord,
        context::{GroupHandler, HandlerGroup, RewriteContext},
        editor,
        events::EventKind,
        runtime::FilterRuntime,
    },
    Result,
};

/// Where the protected range resumes after a normal exit, found at the instruction right
/// before `try_end`: the target of a `leave`, or `None` after `throw` or `rethrow`.
///
/// # Errors
/// Returns [`crate::Error::Shape`] for any other instruction and [`crate::Error::Consistency`]
/// if the range is empty or not placed.
pub fn exit_point(
    body: &MethodBody,
    try_start: InstrId,
    try_end: InstrId,
    method_name: &str,
) -> Result<Option<InstrId>> {
    let (first, after) = body.span(try_start, Some(try_end))?;
    if after <= first {
        return Err(consistency_error!("Empty try range at {}", try_start));
    }
    let last = body
        .at(after - 1)
        .ok_or_else(|| consistency_error!("Try range at {} has no last instruction", try_start))?;
    let instruction = body.instr(last)?;
    match instruction.opcode {
        Opcode::Leave | Opcode::LeaveS => Ok(instruction.target()),
        Opcode::Throw | Opcode::Rethrow => Ok(None),
        other => Err(shape_error!(
            "{}: try range at {} ends in {} instead of leave, throw or rethrow",
            method_name,
            try_start,
            other.mnemonic()
        )),
    }
}

/// Instructions covered by the try range and every handler of `group`. A group nested in
/// another group's try range or handler always covers fewer.
fn extent(body: &MethodBody, group: &HandlerGroup) -> Result<usize> {
    let (mut first, mut after) = body.span(group.try_start, Some(group.try_end))?;
    for handler in &group.handlers {
        let start = handler.region.filter_start.unwrap_or(handler.region.handler_start);
        let (start, end) = body.span(start, handler.region.handler_end)?;
        first = first.min(start);
        after = after.max(end);
    }
    Ok(after - first)
}

/// Groups the regions of `body` by identical try range, keeping only groups with at least one
/// filter. Handlers keep their declared order, groups are sorted innermost first.
///
/// # Errors
/// Returns [`crate::Error::Shape`] if a filtered group also has a `finally` or `fault` clause
/// or an exit point that cannot be determined.
pub fn collect(body: &MethodBody, method_name: &str) -> Result<Vec<HandlerGroup>> {
    let mut groups: Vec<HandlerGroup> = Vec::new();
    for region in body.exception_handlers.iter().filter(|region| region.is_filter()) {
        if groups
            .iter()
            .any(|group| group.try_start == region.try_start && group.try_end == region.try_end)
        {
            continue;
        }

        let members: Vec<&ExceptionHandler> = body
            .exception_handlers
            .iter()
            .filter(|other| other.same_try(region))
            .collect();
        if members.iter().any(|member| member.is_finally_or_fault()) {
            return Err(shape_error!(
                "{}: try range at {} mixes filters with finally or fault",
                method_name,
                region.try_start
            ));
        }

        groups.push(HandlerGroup {
            try_start: region.try_start,
            try_end: region.try_end,
            handlers: members
                .into_iter()
                .map(|member| GroupHandler {
                    region: member.clone(),
                    filter: None,
                    catch: None,
                })
                .collect(),
            exit: exit_point(body, region.try_start, region.try_end, method_name)?,
        });
    }

    let mut sized = Vec::with_capacity(groups.len());
    for group in groups {
        sized.push((extent(body, &group)?, group));
    }
    sized.sort_by_key(|(extent, _)| *extent);
    Ok(sized.into_iter().map(|(_, group)| group).collect())
}

/// Returns `true` if every handler body of the group is nothing but `nop`.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if a handler range is not placed.
pub fn is_empty(body: &MethodBody, group: &HandlerGroup) -> Result<bool> {
    for handler in &group.handlers {
        let (first, after) = body.span(handler.region.handler_start, handler.region.handler_end)?;
        for id in &body.code()[first..after] {
            if body.instr(*id)?.opcode != Opcode::Nop {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn remove_regions(body: &mut MethodBody, group: &HandlerGroup) -> Result<usize> {
    let positions: Vec<usize> = body
        .exception_handlers
        .iter()
        .enumerate()
        .filter(|(_, region)| group.handlers.iter().any(|handler| handler.region == **region))
        .map(|(position, _)| position)
        .collect();
    if positions.len() != group.handlers.len() {
        return Err(consistency_error!(
            "Group at {} has {} handlers but {} regions were found",
            group.try_start,
            group.handlers.len(),
            positions.len()
        ));
    }
    for position in positions.iter().rev() {
        body.exception_handlers.remove(*position);
    }
    positions
        .first()
        .copied()
        .ok_or_else(|| consistency_error!("Group at {} has no handlers", group.try_start))
}

/// Removes group `index` without synthesizing anything: its filters and handlers become
/// placeholders and its regions disappear.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if the group's regions are out of sync with the body.
pub fn drop_group(body: &mut MethodBody, ctx: &mut RewriteContext, index: usize) -> Result<()> {
    let group = ctx.groups[index].clone();
    for handler in &group.handlers {
        let start = handler.region.filter_start.unwrap_or(handler.region.handler_start);
        let (first, after) = body.span(start, handler.region.handler_end)?;
        let consumed = body.code()[first..after].to_vec();
        for id in consumed {
            *body.instr_mut(id)? = Instruction::nop();
            ctx.placeholders.insert(id);
        }
    }
    remove_regions(body, &group)?;

    log::warn!(
        "{}: dropping filter group at {} with empty handlers",
        ctx.method_name,
        group.try_start
    );
    ctx.events
        .record(EventKind::GroupDropped)
        .at(ctx.method, index)
        .message(format!("{} handlers", group.handlers.len()));
    Ok(())
}

/// Emits the replacement handler of group `index` and swaps its regions for the single
/// catch-all region. Every handler must carry its catch unit, and filtered ones their filter
/// units.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if a unit is missing or the group's regions are out of
/// sync with the body.
pub fn synthesize(
    module: &Module,
    runtime: &FilterRuntime,
    ctx: &mut RewriteContext,
    record: &ClosureRecord,
    body: &mut MethodBody,
    index: usize,
) -> Result<()> {
    let group = ctx.groups[index].clone();
    let exception = body.add_local(TypeSig::Object)?;

    let mut asm = InstructionAssembler::new(body);
    asm.stloc(exception)?
        .ldloc(exception)?
        .method(Opcode::Call, runtime.perform_evaluate)?;
    for units in group.filters().rev() {
        asm.ldloc(record.local)?.method(Opcode::Call, units.deactivate)?;
    }

    let mut unguarded = false;
    for handler in &group.handlers {
        let next = asm.new_label();
        unguarded = false;
        match (&handler.filter, handler.region.catch_type) {
            (Some(units), _) => {
                asm.ldloc(record.local)?
                    .field(Opcode::Ldfld, units.field)?
                    .ldloc(exception)?
                    .method(Opcode::Callvirt, runtime.should_run_handler)?
                    .branch(Opcode::Brfalse, next)?;
            }
            (None, Some(catch_type)) if !module.is_system_object(catch_type) => {
                asm.ldloc(exception)?
                    .ty(Opcode::Isinst, catch_type)?
                    .branch(Opcode::Brfalse, next)?;
            }
            _ => unguarded = true,
        }

        let unit = handler
            .catch
            .as_ref()
            .ok_or_else(|| consistency_error!("Handler at {} was not extracted", handler.region.handler_start))?;
        asm.ldloc(record.local)?;
        for arg in &record.passthrough {
            asm.ldarg(*arg)?;
        }
        asm.ldloc(exception)?.method(Opcode::Call, unit.method)?;

        match (unit.targets.as_slice(), unit.rethrows) {
            ([], _) => {
                asm.op(Opcode::Pop)?.op(Opcode::Rethrow)?;
            }
            ([target], false) => {
                asm.op(Opcode::Pop)?.branch_to(Opcode::Leave, *target)?;
            }
            (targets, _) => {
                let rethrow = asm.new_label();
                let mut table = vec![rethrow];
                table.extend(targets.iter().map(|_| asm.new_label()));
                asm.switch(&table)?;
                asm.bind(rethrow)?;
                asm.op(Opcode::Rethrow)?;
                for (label, target) in table[1..].iter().zip(targets) {
                    asm.bind(*label)?;
                    asm.branch_to(Opcode::Leave, *target)?;
                }
            }
        }
        asm.bind(next)?;
    }

    match group.exit {
        Some(exit) if unguarded => asm.branch_to(Opcode::Leave, exit)?,
        _ => asm.op(Opcode::Rethrow)?,
    };
    let handler = asm.finish()?;
    let handler_start = handler[0];

    let anchor = group.try_end;
    editor::insert_before(body, ctx, anchor, &handler)?;
    let group = ctx.groups[index].clone();
    let position = remove_regions(body, &group)?;
    body.exception_handlers.insert(
        position,
        ExceptionHandler::catch(
            group.try_start,
            handler_start,
            handler_start,
            Some(anchor),
            runtime.object,
        ),
    );

    ctx.events
        .record(EventKind::GroupSynthesized)
        .at(ctx.method, index)
        .message(format!(
            "{} handlers, {} filters, exit {}",
            group.handlers.len(),
            group.filters().count(),
            group.exit.map_or_else(|| "none".to_string(), |exit| exit.to_string())
        ));
    Ok(())
}
