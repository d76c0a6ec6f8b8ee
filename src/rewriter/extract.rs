//! Copying an instruction range of one body into another.
//!
//! Extraction works in two passes. The first pass walks the range in order and either clones
//! each instruction into the target arena, with its variable references remapped and generic
//! tokens lifted, or lets a caller supplied callback substitute a sequence of its own. The
//! second pass patches the branch targets of cloned instructions from source handles to target
//! handles. Exception regions lying entirely within the range are copied along; the caller
//! removes them from the source together with the range.
//!
//! Control leaving the range is the caller's business: a cloned branch may only leave the
//! range towards the instruction right after it, which maps to the end anchor. Every other
//! outbound branch must be substituted by the callback.

use std::collections::{HashMap, HashSet};

use crate::{
    assembly::{InstrId, Instruction, Operand},
    metadata::{
        method::{ExceptionHandler, MethodBody},
        module::Module,
        signatures::GenericContext,
        token::{TableId, Token},
    },
    Result,
};

/// Where a variable of the source body lives in the target body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// A local variable slot of the target
    Local(u16),
    /// An argument of the target
    Argument(u16),
}

impl Slot {
    fn is_local(self) -> bool {
        matches!(self, Slot::Local(_))
    }

    fn index(self) -> u16 {
        match self {
            Slot::Local(index) | Slot::Argument(index) => index,
        }
    }
}

/// Source variable to target slot assignment.
///
/// Locals without an entry get a fresh local in the target on first use. Arguments without an
/// entry cannot be reached from extracted code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableMapping {
    /// Source local index to target slot
    pub locals: HashMap<u16, Slot>,
    /// Source argument index to target slot
    pub args: HashMap<u16, Slot>,
}

impl VariableMapping {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps source local `index` to `slot`.
    #[must_use]
    pub fn with_local(mut self, index: u16, slot: Slot) -> Self {
        self.locals.insert(index, slot);
        self
    }

    /// Maps source argument `index` to `slot`.
    #[must_use]
    pub fn with_arg(mut self, index: u16, slot: Slot) -> Self {
        self.args.insert(index, slot);
        self
    }
}

/// The range to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractRange {
    /// First source instruction
    pub first: InstrId,
    /// Last source instruction, inclusive
    pub last: InstrId,
    /// Target instruction standing in for "right after the range", `None` for end of body
    pub end_anchor: Option<InstrId>,
}

/// What the site callback gets to see of each source instruction.
#[derive(Debug, Clone)]
pub struct Site {
    /// Source handle
    pub id: InstrId,
    /// The instruction as found in the source
    pub instruction: Instruction,
    /// Whether a branch target lies outside the range
    pub targets_outside: bool,
    /// Whether the instruction belongs to a filter or handler nested in the range
    pub in_nested_handler: bool,
    /// Whether this is the last instruction of the range
    pub is_last: bool,
}

/// Result of an extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Target handles in order, not yet placed in the target code sequence
    pub code: Vec<InstrId>,
    /// Source handle to the first target handle standing in for it
    pub map: HashMap<InstrId, InstrId>,
    /// Source regions carried over, as they appear in the source
    pub carried: Vec<ExceptionHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Inside,
    Outside,
    Encloses,
    Straddles,
}

fn place(interval: (usize, usize), range: (usize, usize)) -> Placement {
    let (start, end) = interval;
    let (first, after) = range;
    if start <= first && end >= after {
        Placement::Encloses
    } else if start >= first && end <= after {
        Placement::Inside
    } else if end <= first || start >= after {
        Placement::Outside
    } else {
        Placement::Straddles
    }
}

/// Token that names the same entity as `token` from inside a synthesized type, whose generic
/// parameters continue the owner type's with the owner method's.
///
/// # Errors
/// Returns [`crate::Error::TokenNotFound`] if a TypeSpec or MemberRef does not resolve.
pub fn lift_token(module: &mut Module, generics: &GenericContext, token: Token) -> Result<Token> {
    if generics.method_count == 0 {
        return Ok(token);
    }
    match token.table_id() {
        Some(TableId::TypeSpec) => {
            let signature = module.type_spec_def(token)?.signature.clone();
            if signature.mentions_method_generics() {
                Ok(module.type_spec(generics.lift(&signature)))
            } else {
                Ok(token)
            }
        }
        Some(TableId::MemberRef) => {
            let member = module.member_ref_def(token)?.clone();
            let parent = lift_token(module, generics, member.parent)?;
            if parent == member.parent {
                Ok(token)
            } else {
                Ok(module.member_ref(parent, &member.name, member.signature))
            }
        }
        _ => Ok(token),
    }
}

fn remap_variable(
    instruction: &Instruction,
    source: &MethodBody,
    target: &mut MethodBody,
    generics: &GenericContext,
    mapping: &mut VariableMapping,
) -> Result<Option<Instruction>> {
    let Some((access, index)) = instruction.variable() else {
        return Ok(None);
    };
    let slot = if access.is_local() {
        match mapping.locals.get(&index) {
            Some(slot) => *slot,
            None => {
                let local = source
                    .locals
                    .get(usize::from(index))
                    .ok_or_else(|| consistency_error!("Local {} out of range", index))?;
                let slot = Slot::Local(target.add_local(generics.lift(&local.signature))?);
                mapping.locals.insert(index, slot);
                slot
            }
        }
    } else {
        *mapping.args.get(&index).ok_or_else(|| {
            consistency_error!("Argument {} is not reachable from extracted code", index)
        })?
    };
    Ok(Some(Instruction::variable_access(
        access.with_storage(slot.is_local()),
        slot.index(),
    )))
}

fn lift_operand(module: &mut Module, generics: &GenericContext, operand: &mut Operand) -> Result<()> {
    match operand {
        Operand::Type(token) | Operand::Field(token) | Operand::Method(token) => {
            *token = lift_token(module, generics, *token)?;
        }
        _ => {}
    }
    Ok(())
}

/// Copies `range` of `source` into the arena of `target`.
///
/// `rewrite` is asked about every source instruction first; returning `Some` substitutes the
/// given instructions, taken as they are, for it. Substitutes may branch to handles of
/// `target` but not into the copied range.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if the range is not placed or inverted, if a cloned
/// branch leaves the range anywhere but right after it, if a region straddles the range
/// boundary, or if an argument has no mapping. Errors of `rewrite` are passed through.
pub fn extract<F>(
    module: &mut Module,
    generics: &GenericContext,
    source: &MethodBody,
    target: &mut MethodBody,
    range: ExtractRange,
    mapping: &mut VariableMapping,
    mut rewrite: F,
) -> Result<Extraction>
where
    F: FnMut(&Site) -> Result<Option<Vec<Instruction>>>,
{
    let start = source.require_position(range.first)?;
    let end = source.require_position(range.last)?;
    if end < start {
        return Err(consistency_error!(
            "Extraction range {} .. {} is inverted",
            range.first,
            range.last
        ));
    }
    let bounds = (start, end + 1);
    let after = source.at(end + 1);
    let inside: HashSet<InstrId> = source.code()[start..=end].iter().copied().collect();

    let mut carried = Vec::new();
    let mut nested = HashSet::new();
    for region in &source.exception_handlers {
        let protected = source.span(region.try_start, Some(region.try_end))?;
        let handler = source.span(
            region.filter_start.unwrap_or(region.handler_start),
            region.handler_end,
        )?;
        match (place(protected, bounds), place(handler, bounds)) {
            (Placement::Inside, Placement::Inside) => {
                nested.extend(handler.0..handler.1);
                carried.push(region.clone());
            }
            (Placement::Outside | Placement::Encloses, Placement::Outside | Placement::Encloses) => {}
            _ => {
                return Err(consistency_error!(
                    "Region {} .. {} straddles the extraction range {} .. {}",
                    region.try_start,
                    region.try_end,
                    range.first,
                    range.last
                ))
            }
        }
    }

    let mut extraction = Extraction::default();
    let mut cloned = Vec::new();
    for (position, id) in source.code()[start..=end].iter().enumerate() {
        let instruction = source.instr(*id)?;
        let outbound: Vec<InstrId> = instruction
            .operand
            .targets()
            .into_iter()
            .filter(|t| !inside.contains(t))
            .collect();
        let site = Site {
            id: *id,
            instruction: instruction.clone(),
            targets_outside: !outbound.is_empty(),
            in_nested_handler: nested.contains(&(start + position)),
            is_last: *id == range.last,
        };

        let ids: Vec<InstrId> = match rewrite(&site)? {
            Some(replacement) => replacement
                .into_iter()
                .map(|instruction| target.alloc(instruction))
                .collect(),
            None => {
                if let Some(stray) = outbound
                    .iter()
                    .find(|t| Some(**t) != after || range.end_anchor.is_none())
                {
                    return Err(consistency_error!(
                        "{} at {} branches to {} outside the extracted range",
                        instruction.opcode.mnemonic(),
                        id,
                        stray
                    ));
                }
                let mut clone = remap_variable(instruction, source, target, generics, mapping)?
                    .unwrap_or_else(|| instruction.clone());
                lift_operand(module, generics, &mut clone.operand)?;
                let new = target.alloc(clone);
                cloned.push(new);
                vec![new]
            }
        };

        let Some(first) = ids.first().copied() else {
            return Err(consistency_error!("Empty substitute for {}", id));
        };
        extraction.map.insert(*id, first);
        extraction.code.extend(ids);
    }

    let resolve = |old: InstrId| -> Result<InstrId> {
        if Some(old) == after {
            if let Some(anchor) = range.end_anchor {
                return Ok(anchor);
            }
        }
        extraction
            .map
            .get(&old)
            .copied()
            .ok_or_else(|| consistency_error!("No copy of branch target {}", old))
    };

    for id in &cloned {
        let operand = target.instr(*id)?.operand.clone();
        let patched = match operand {
            Operand::Target(old) => Operand::Target(resolve(old)?),
            Operand::Switch(table) => Operand::Switch(
                table
                    .into_iter()
                    .map(&resolve)
                    .collect::<Result<Vec<_>>>()?,
            ),
            _ => continue,
        };
        target.instr_mut(*id)?.operand = patched;
    }

    for region in &carried {
        let end_of = |bound: Option<InstrId>| -> Result<Option<InstrId>> {
            match bound {
                Some(old) if Some(old) == after => Ok(range.end_anchor),
                Some(old) => resolve(old).map(Some),
                None => Ok(range.end_anchor),
            }
        };
        let copy = ExceptionHandler {
            flags: region.flags,
            try_start: resolve(region.try_start)?,
            try_end: resolve(region.try_end)?,
            filter_start: region.filter_start.map(&resolve).transpose()?,
            handler_start: resolve(region.handler_start)?,
            handler_end: end_of(region.handler_end)?,
            catch_type: region
                .catch_type
                .map(|token| lift_token(module, generics, token))
                .transpose()?,
        };
        target.exception_handlers.push(copy);
    }
    extraction.carried = carried;

    Ok(extraction)
}
