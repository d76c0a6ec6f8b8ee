//! Editable CIL method bodies.
//!
//! A [`MethodBody`] owns an arena of [`Instruction`]s and an ordered code sequence of handles
//! into that arena. Operands and exception regions refer to instructions by [`InstrId`], so
//! inserting or removing code never invalidates them. An instruction that drops out of the
//! sequence keeps its arena slot; any reference still pointing at it is a dangling reference
//! that [`crate::metadata::validation::BodyValidator`] reports.
//!
//! Byte offsets only exist after [`MethodBody::layout`], which is what a module writer uses to
//! serialize the body, including the choice between tiny and fat headers.
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilfilter::assembly::{Instruction, Opcode, Operand};
//! use cilfilter::metadata::method::MethodBody;
//!
//! let mut body = MethodBody::new();
//! let ret = body.alloc(Instruction::simple(Opcode::Ret));
//! body.push(Instruction::new(Opcode::Br, Operand::Target(ret)));
//! body.append(ret);
//!
//! body.shrink_branches();
//! let layout = body.layout()?;
//! assert_eq!(layout.code_size, 3);
//! assert!(!layout.is_fat);
//! # Ok::<(), cilfilter::Error>(())
//! ```
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 25.4 - Method Header Format

use std::collections::HashMap;
use std::fmt::Write;

use crate::{
    assembly::{InstrId, Instruction, Opcode, Operand, OperandType},
    metadata::{
        method::{ExceptionHandler, LocalVariable},
        signatures::TypeSig,
    },
    Result,
};

/// Largest code size a tiny method header can describe
const TINY_CODE_LIMIT: u32 = 64;
/// Largest evaluation stack a tiny method header implies
const TINY_MAX_STACK: u16 = 8;

/// Byte layout of a method body, computed by [`MethodBody::layout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyLayout {
    offsets: HashMap<InstrId, u32>,
    /// Size of the method (length of all instructions, not counting the header) in bytes
    pub code_size: u32,
    /// Flag, indicating the type of the method header
    pub is_fat: bool,
}

impl BodyLayout {
    /// Offset of an instruction in the code stream.
    #[must_use]
    pub fn offset(&self, id: InstrId) -> Option<u32> {
        self.offsets.get(&id).copied()
    }

    /// Size of the method header in bytes
    #[must_use]
    pub fn size_header(&self) -> u32 {
        if self.is_fat {
            12
        } else {
            1
        }
    }
}

/// Describes one editable method body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodBody {
    arena: Vec<Instruction>,
    code: Vec<InstrId>,
    /// Local variable slots, indexed by `ldloc`/`stloc` operands
    pub locals: Vec<LocalVariable>,
    /// A list of exception handlers this method has, innermost first
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Maximum number of items on the operand stack
    pub max_stack: u16,
    /// Flag, indicating to call default constructor on all local variables
    pub init_locals: bool,
}

impl MethodBody {
    /// Creates an empty body with `init_locals` set.
    #[must_use]
    pub fn new() -> Self {
        MethodBody {
            max_stack: TINY_MAX_STACK,
            init_locals: true,
            ..Default::default()
        }
    }

    /// Allocates an instruction in the arena without placing it in the code sequence.
    pub fn alloc(&mut self, instruction: Instruction) -> InstrId {
        let id = InstrId(self.arena.len() as u32);
        self.arena.push(instruction);
        id
    }

    /// Allocates an instruction and appends it to the code sequence.
    pub fn push(&mut self, instruction: Instruction) -> InstrId {
        let id = self.alloc(instruction);
        self.code.push(id);
        id
    }

    /// Appends an already allocated instruction to the code sequence.
    pub fn append(&mut self, id: InstrId) {
        self.code.push(id);
    }

    /// Looks up an instruction in the arena.
    #[must_use]
    pub fn get(&self, id: InstrId) -> Option<&Instruction> {
        self.arena.get(id.index())
    }

    /// Looks up an instruction in the arena for modification.
    pub fn get_mut(&mut self, id: InstrId) -> Option<&mut Instruction> {
        self.arena.get_mut(id.index())
    }

    /// Looks up an instruction, failing with a consistency error for unknown handles.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if `id` was not allocated in this body.
    pub fn instr(&self, id: InstrId) -> Result<&Instruction> {
        self.get(id)
            .ok_or_else(|| consistency_error!("Instruction {} is not allocated in this body", id))
    }

    /// Mutable variant of [`MethodBody::instr`].
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if `id` was not allocated in this body.
    pub fn instr_mut(&mut self, id: InstrId) -> Result<&mut Instruction> {
        self.arena
            .get_mut(id.index())
            .ok_or_else(|| consistency_error!("Instruction {} is not allocated in this body", id))
    }

    /// The ordered code sequence.
    #[must_use]
    pub fn code(&self) -> &[InstrId] {
        &self.code
    }

    pub(crate) fn code_mut(&mut self) -> &mut Vec<InstrId> {
        &mut self.code
    }

    /// Number of instructions in the code sequence.
    #[must_use]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Returns `true` if the code sequence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Number of allocated instructions, placed or not.
    #[must_use]
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    /// Iterates the code sequence in order.
    pub fn iter(&self) -> impl Iterator<Item = (InstrId, &Instruction)> + '_ {
        self.code.iter().map(|id| (*id, &self.arena[id.index()]))
    }

    /// Position of an instruction in the code sequence.
    #[must_use]
    pub fn position(&self, id: InstrId) -> Option<usize> {
        self.code.iter().position(|candidate| *candidate == id)
    }

    /// Position of an instruction, failing with a consistency error if it is not placed.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if `id` is not in the code sequence.
    pub fn require_position(&self, id: InstrId) -> Result<usize> {
        self.position(id)
            .ok_or_else(|| consistency_error!("Instruction {} is not part of the body", id))
    }

    /// Positions of every placed instruction.
    #[must_use]
    pub fn positions(&self) -> HashMap<InstrId, usize> {
        self.code
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position))
            .collect()
    }

    /// Instruction placed at `position`.
    #[must_use]
    pub fn at(&self, position: usize) -> Option<InstrId> {
        self.code.get(position).copied()
    }

    /// Half-open position range `[start, end)` covered by a region boundary pair, where a
    /// missing end means the end of the body.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if a boundary is not placed or the range is inverted.
    pub fn span(&self, start: InstrId, end: Option<InstrId>) -> Result<(usize, usize)> {
        let first = self.require_position(start)?;
        let last = match end {
            Some(end) => self.require_position(end)?,
            None => self.code.len(),
        };
        if last < first {
            return Err(consistency_error!(
                "Region {} .. {:?} is inverted",
                start,
                end
            ));
        }
        Ok((first, last))
    }

    /// Adds a local variable slot and returns its index.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if the body already has 65535 locals.
    pub fn add_local(&mut self, signature: TypeSig) -> Result<u16> {
        let index = u16::try_from(self.locals.len())
            .ok()
            .filter(|index| *index < u16::MAX)
            .ok_or_else(|| consistency_error!("Local table is full ({} slots)", self.locals.len()))?;
        self.locals.push(LocalVariable::new(signature));
        Ok(index)
    }

    /// Every instruction referenced by an operand or a region boundary.
    #[must_use]
    pub fn references(&self) -> Vec<InstrId> {
        let mut refs: Vec<InstrId> = self
            .iter()
            .flat_map(|(_, instruction)| instruction.operand.targets())
            .collect();
        for handler in &self.exception_handlers {
            refs.extend(handler.references());
        }
        refs
    }

    /// Rewrites every short branch into its long form.
    ///
    /// Done before any code is inserted so displacements cannot overflow.
    pub fn expand_short_branches(&mut self) {
        for id in &self.code {
            let instruction = &mut self.arena[id.index()];
            if let Some(long) = instruction.opcode.long_branch_form() {
                instruction.opcode = long;
            }
        }
    }

    /// Turns long branches back into short ones wherever the displacement fits.
    ///
    /// Shrinking an instruction only brings others closer together, so a branch that fits
    /// keeps fitting. Iterates until no more branches shrink and returns how many did.
    pub fn shrink_branches(&mut self) -> usize {
        let mut total = 0;
        loop {
            let offsets = self.offsets();
            let mut changed = 0;
            for (position, id) in self.code.iter().enumerate() {
                let instruction = &self.arena[id.index()];
                let (Some(short), Operand::Target(target)) =
                    (instruction.opcode.short_branch_form(), &instruction.operand)
                else {
                    continue;
                };
                let Some(target_offset) = offsets.get(target) else {
                    continue;
                };

                let next = offsets[position] + 2;
                let delta = i64::from(*target_offset) - i64::from(next);
                if i8::try_from(delta).is_ok() {
                    self.arena[id.index()].opcode = short;
                    changed += 1;
                }
            }
            if changed == 0 {
                break;
            }
            total += changed;
        }
        total
    }

    /// Per-position offsets, plus the code size as the final entry, keyed by handle.
    fn offsets(&self) -> OffsetTable {
        let mut by_position = Vec::with_capacity(self.code.len() + 1);
        let mut by_id = HashMap::with_capacity(self.code.len());
        let mut offset = 0u32;
        for id in &self.code {
            by_position.push(offset);
            by_id.insert(*id, offset);
            offset += self.arena[id.index()].size();
        }
        by_position.push(offset);
        OffsetTable { by_position, by_id }
    }

    /// Computes final byte offsets and the header format.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] if a branch target is not placed or a short
    /// branch displacement does not fit into a signed byte.
    pub fn layout(&self) -> Result<BodyLayout> {
        let offsets = self.offsets();
        for (position, id) in self.code.iter().enumerate() {
            let instruction = &self.arena[id.index()];
            if instruction.opcode.operand_type() != OperandType::ShortBranch {
                continue;
            }
            let Some(target) = instruction.target() else {
                continue;
            };
            let target_offset = offsets
                .get(&target)
                .ok_or_else(|| consistency_error!("Branch target {} is not placed", target))?;
            let delta = i64::from(*target_offset) - i64::from(offsets[position + 1]);
            if i8::try_from(delta).is_err() {
                return Err(consistency_error!(
                    "Short branch at IL_{:04x} cannot reach IL_{:04x}",
                    offsets[position],
                    target_offset
                ));
            }
        }

        let code_size = offsets[self.code.len()];
        let is_fat = code_size >= TINY_CODE_LIMIT
            || !self.locals.is_empty()
            || !self.exception_handlers.is_empty()
            || self.max_stack > TINY_MAX_STACK;

        Ok(BodyLayout {
            offsets: offsets.by_id,
            code_size,
            is_fat,
        })
    }

    /// Textual listing, one `IL_xxxx: mnemonic operand` line per instruction.
    ///
    /// Branch targets are printed as offsets; unplaced targets print as their handle.
    #[must_use]
    pub fn listing(&self) -> String {
        let offsets = self.offsets();
        let label = |id: &InstrId| match offsets.get(id) {
            Some(offset) => format!("IL_{offset:04x}"),
            None => id.to_string(),
        };

        let mut out = String::new();
        for (position, id) in self.code.iter().enumerate() {
            let instruction = &self.arena[id.index()];
            let _ = write!(out, "IL_{:04x}: ", offsets[position]);
            match &instruction.operand {
                Operand::Target(target) => {
                    let _ = write!(out, "{} {}", instruction.opcode, label(target));
                }
                Operand::Switch(targets) => {
                    let labels: Vec<String> = targets.iter().map(label).collect();
                    let _ = write!(out, "{} ({})", instruction.opcode, labels.join(", "));
                }
                _ => {
                    let _ = write!(out, "{instruction}");
                }
            }
            out.push('\n');
        }
        out
    }

    /// Returns the opcodes of the code sequence, mostly useful in tests and logs.
    #[must_use]
    pub fn opcodes(&self) -> Vec<Opcode> {
        self.iter().map(|(_, instruction)| instruction.opcode).collect()
    }
}

struct OffsetTable {
    by_position: Vec<u32>,
    by_id: HashMap<InstrId, u32>,
}

impl OffsetTable {
    fn get(&self, id: &InstrId) -> Option<&u32> {
        self.by_id.get(id)
    }
}

impl std::ops::Index<usize> for OffsetTable {
    type Output = u32;

    fn index(&self, position: usize) -> &u32 {
        &self.by_position[position]
    }
}
