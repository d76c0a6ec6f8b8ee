//! Instruction representation for editable CIL method bodies.
//!
//! Unlike decoded instructions, which refer to branch targets by byte offset, an editable
//! [`Instruction`] refers to other instructions by identity ([`InstrId`]), so code can be
//! inserted, cloned and moved around without patching offsets. Offsets only exist after
//! [`crate::metadata::method::MethodBody::layout`] has run.
//!
//! # Key Components
//!
//! - [`Instruction`] - An opcode paired with its operand
//! - [`Operand`] - Closed union of everything an operand can be
//! - [`Immediate`] - Constant values embedded in the instruction stream
//! - [`OperandType`] - Encoding of the operand an opcode expects
//! - [`FlowType`] - Control flow behavior of an opcode
//!
//! # Usage Examples
//!
//! ```rust,no_run
//! use cilfilter::assembly::{Immediate, Instruction, Opcode, Operand};
//!
//! let load = Instruction::new(Opcode::LdcI4, Operand::Immediate(Immediate::Int32(42)));
//! assert_eq!(load.immediate_i32(), Some(42));
//! assert!(load.fits());
//! ```

use std::fmt;

use crate::{
    assembly::opcodes::{Opcode, VariableAccess},
    metadata::token::Token,
};

/// Handle of an instruction inside a method body arena.
///
/// Handles stay valid for the lifetime of the body: removing an instruction from the
/// ordered sequence keeps its arena slot, so dangling references can be detected instead of
/// silently pointing at a different instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrId(pub u32);

impl InstrId {
    /// Index of the instruction inside the arena
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Types of operands for CIL instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand present
    None,
    /// Signed 8-bit integer (`ldc.i4.s`)
    Int8,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
    /// 8-bit relative branch displacement
    ShortBranch,
    /// 32-bit relative branch displacement
    Branch,
    /// Switch table
    Switch,
    /// 8-bit local or argument index
    ShortVariable,
    /// 16-bit local or argument index
    Variable,
    /// Type token (TypeDef, TypeRef or TypeSpec)
    Type,
    /// Field token (Field or MemberRef)
    Field,
    /// Method token (MethodDef or MemberRef)
    Method,
    /// User string
    String,
}

impl OperandType {
    /// Returns the encoded size in bytes of this operand type.
    ///
    /// Returns `None` for `Switch`, whose size depends on the number of targets.
    #[must_use]
    pub const fn size(&self) -> Option<u32> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8 | OperandType::ShortBranch | OperandType::ShortVariable => Some(1),
            OperandType::Variable => Some(2),
            OperandType::Int32
            | OperandType::Float32
            | OperandType::Branch
            | OperandType::Type
            | OperandType::Field
            | OperandType::Method
            | OperandType::String => Some(4),
            OperandType::Int64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }

    /// Short description used in operand mismatch errors.
    #[must_use]
    pub const fn describe(&self) -> &'static str {
        match self {
            OperandType::None => "empty",
            OperandType::Int8 => "int8",
            OperandType::Int32 => "int32",
            OperandType::Int64 => "int64",
            OperandType::Float32 => "float32",
            OperandType::Float64 => "float64",
            OperandType::ShortBranch | OperandType::Branch => "branch target",
            OperandType::Switch => "switch table",
            OperandType::ShortVariable | OperandType::Variable => "variable index",
            OperandType::Type => "type token",
            OperandType::Field => "field token",
            OperandType::Method => "method token",
            OperandType::String => "string",
        }
    }
}

/// An immediate value embedded in a CIL instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// `ldc.i4.s` and other short forms
    Int8(i8),
    /// `ldc.i4`
    Int32(i32),
    /// `ldc.i8`
    Int64(i64),
    /// `ldc.r4`
    Float32(f32),
    /// `ldc.r8`
    Float64(f64),
}

/// The operand of an instruction.
///
/// Instruction references ([`Operand::Target`], [`Operand::Switch`]) are handles into the
/// owning body's arena, metadata references are tokens into the owning module.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand present
    None,
    /// Immediate value (constant embedded in instruction)
    Immediate(Immediate),
    /// Branch or leave target
    Target(InstrId),
    /// Switch table targets
    Switch(Vec<InstrId>),
    /// Local variable index
    Local(u16),
    /// Method argument index (0 is `this` for instance methods)
    Argument(u16),
    /// Type reference
    Type(Token),
    /// Field reference
    Field(Token),
    /// Method reference
    Method(Token),
    /// User string literal
    String(String),
}

impl Operand {
    /// All instructions this operand references, in table order.
    #[must_use]
    pub fn targets(&self) -> Vec<InstrId> {
        match self {
            Operand::Target(target) => vec![*target],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Replaces every reference to `old` with `new`, returning `true` if anything changed.
    pub fn retarget(&mut self, old: InstrId, new: InstrId) -> bool {
        match self {
            Operand::Target(target) if *target == old => {
                *target = new;
                true
            }
            Operand::Switch(targets) => {
                let mut changed = false;
                for target in targets.iter_mut().filter(|target| **target == old) {
                    *target = new;
                    changed = true;
                }
                changed
            }
            _ => false,
        }
    }

    /// Metadata token carried by this operand, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self {
            Operand::Type(token) | Operand::Field(token) | Operand::Method(token) => Some(*token),
            _ => None,
        }
    }
}

/// Where control goes after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Falls through
    Sequential,
    /// Falls through or jumps to its target
    ConditionalBranch,
    /// `br` and `br.s`
    UnconditionalBranch,
    /// Falls through after the callee returns
    Call,
    /// `ret`
    Return,
    /// Falls through or jumps to one of its targets
    Switch,
    /// `throw` and `rethrow`
    Throw,
    /// `endfinally`
    EndFinally,
    /// `endfilter`
    EndFilter,
    /// `leave` and `leave.s`, exits protected regions
    Leave,
}

/// A single editable CIL instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// The opcode
    pub opcode: Opcode,
    /// The operand, which must fit [`Opcode::operand_type`]
    pub operand: Operand,
}

impl Instruction {
    /// Creates an instruction from an opcode and operand.
    #[must_use]
    pub fn new(opcode: Opcode, operand: Operand) -> Self {
        Instruction { opcode, operand }
    }

    /// Creates an instruction without operand.
    #[must_use]
    pub fn simple(opcode: Opcode) -> Self {
        Instruction {
            opcode,
            operand: Operand::None,
        }
    }

    /// The most compact instruction performing `access` on slot `index`.
    #[must_use]
    pub fn variable_access(access: VariableAccess, index: u16) -> Self {
        let (opcode, needs_operand) = access.compact_opcode(index);
        let operand = match (needs_operand, access.is_local()) {
            (false, _) => Operand::None,
            (true, true) => Operand::Local(index),
            (true, false) => Operand::Argument(index),
        };
        Instruction { opcode, operand }
    }

    /// Loads an `int32` constant using the smallest encoding.
    #[must_use]
    pub fn ldc_i4(value: i32) -> Self {
        let numbered = match value {
            -1 => Opcode::LdcI4M1,
            0 => Opcode::LdcI40,
            1 => Opcode::LdcI41,
            2 => Opcode::LdcI42,
            3 => Opcode::LdcI43,
            4 => Opcode::LdcI44,
            5 => Opcode::LdcI45,
            6 => Opcode::LdcI46,
            7 => Opcode::LdcI47,
            8 => Opcode::LdcI48,
            _ => {
                return match i8::try_from(value) {
                    Ok(small) => {
                        Instruction::new(Opcode::LdcI4S, Operand::Immediate(Immediate::Int8(small)))
                    }
                    Err(_) => {
                        Instruction::new(Opcode::LdcI4, Operand::Immediate(Immediate::Int32(value)))
                    }
                }
            }
        };
        Self::simple(numbered)
    }

    /// A `nop`, used as placeholder for consumed code.
    #[must_use]
    pub fn nop() -> Self {
        Self::simple(Opcode::Nop)
    }

    /// Returns `true` if the operand matches the operand type of the opcode.
    #[must_use]
    pub fn fits(&self) -> bool {
        let is_local = self
            .opcode
            .variable_access()
            .is_some_and(|(access, _)| access.is_local());

        matches!(
            (self.opcode.operand_type(), &self.operand),
            (OperandType::None, Operand::None)
                | (OperandType::Int8, Operand::Immediate(Immediate::Int8(_)))
                | (OperandType::Int32, Operand::Immediate(Immediate::Int32(_)))
                | (OperandType::Int64, Operand::Immediate(Immediate::Int64(_)))
                | (OperandType::Float32, Operand::Immediate(Immediate::Float32(_)))
                | (OperandType::Float64, Operand::Immediate(Immediate::Float64(_)))
                | (OperandType::ShortBranch | OperandType::Branch, Operand::Target(_))
                | (OperandType::Switch, Operand::Switch(_))
                | (OperandType::Type, Operand::Type(_))
                | (OperandType::Field, Operand::Field(_))
                | (OperandType::Method, Operand::Method(_))
                | (OperandType::String, Operand::String(_))
        ) || matches!(
            (self.opcode.operand_type(), &self.operand, is_local),
            (
                OperandType::ShortVariable | OperandType::Variable,
                Operand::Local(_),
                true
            ) | (
                OperandType::ShortVariable | OperandType::Variable,
                Operand::Argument(_),
                false
            )
        )
    }

    /// Encoded size of the instruction in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        let operand = match (self.opcode.operand_type().size(), &self.operand) {
            (Some(size), _) => size,
            (None, Operand::Switch(targets)) => 4 + 4 * targets.len() as u32,
            (None, _) => 4,
        };
        self.opcode.size() + operand
    }

    /// Control flow behavior of the opcode.
    #[must_use]
    pub fn flow_type(&self) -> FlowType {
        self.opcode.flow_type()
    }

    /// Returns `true` for branches, switches and leaves.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_type(),
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Switch
                | FlowType::Leave
        )
    }

    /// Returns `true` if control never falls through to the next instruction.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.flow_type(),
            FlowType::UnconditionalBranch
                | FlowType::Return
                | FlowType::Throw
                | FlowType::EndFinally
                | FlowType::EndFilter
                | FlowType::Leave
        )
    }

    /// Returns `true` for `leave` and `leave.s`.
    #[must_use]
    pub fn is_leave(&self) -> bool {
        self.opcode.is_leave()
    }

    /// Single branch target, if this is a branch or leave.
    #[must_use]
    pub fn target(&self) -> Option<InstrId> {
        match self.operand {
            Operand::Target(target) => Some(target),
            _ => None,
        }
    }

    /// The variable access of this instruction with its index resolved, including the
    /// implicit index of numbered short forms.
    #[must_use]
    pub fn variable(&self) -> Option<(VariableAccess, u16)> {
        let (access, implicit) = self.opcode.variable_access()?;
        if let Some(index) = implicit {
            return Some((access, index));
        }

        match self.operand {
            Operand::Local(index) | Operand::Argument(index) => Some((access, index)),
            _ => None,
        }
    }

    /// Value of an `int32` or `int8` immediate operand.
    #[must_use]
    pub fn immediate_i32(&self) -> Option<i32> {
        match self.operand {
            Operand::Immediate(Immediate::Int32(value)) => Some(value),
            Operand::Immediate(Immediate::Int8(value)) => Some(i32::from(value)),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Immediate(Immediate::Float32(value)) => write!(f, " {value}"),
            Operand::Immediate(Immediate::Float64(value)) => write!(f, " {value}"),
            Operand::Immediate(Immediate::Int8(value)) => write!(f, " {value}"),
            Operand::Immediate(Immediate::Int32(value)) => write!(f, " {value}"),
            Operand::Immediate(Immediate::Int64(value)) => write!(f, " {value}"),
            Operand::Target(target) => write!(f, " {target}"),
            Operand::Switch(targets) => {
                write!(f, " (")?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{target}")?;
                }
                write!(f, ")")
            }
            Operand::Local(index) => write!(f, " V_{index}"),
            Operand::Argument(index) => write!(f, " A_{index}"),
            Operand::Type(token) | Operand::Field(token) | Operand::Method(token) => {
                write!(f, " {token}")
            }
            Operand::String(value) => write!(f, " {value:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::token::TableId;

    #[test]
    fn test_operand_fits_opcode() {
        assert!(Instruction::simple(Opcode::Ret).fits());
        assert!(Instruction::new(Opcode::Ldloc, Operand::Local(4)).fits());
        assert!(!Instruction::new(Opcode::Ldloc, Operand::Argument(4)).fits());
        assert!(Instruction::new(Opcode::StargS, Operand::Argument(1)).fits());
        assert!(!Instruction::new(Opcode::LdcI4S, Operand::Immediate(Immediate::Int32(1))).fits());
        assert!(Instruction::new(Opcode::LeaveS, Operand::Target(InstrId(3))).fits());
        assert!(!Instruction::new(
            Opcode::Call,
            Operand::Field(Token::from_parts(TableId::Field, 1))
        )
        .fits());
    }

    #[test]
    fn test_sizes() {
        assert_eq!(Instruction::simple(Opcode::Nop).size(), 1);
        assert_eq!(Instruction::simple(Opcode::Rethrow).size(), 2);
        assert_eq!(Instruction::new(Opcode::Leave, Operand::Target(InstrId(0))).size(), 5);
        assert_eq!(Instruction::new(Opcode::LeaveS, Operand::Target(InstrId(0))).size(), 2);
        assert_eq!(Instruction::new(Opcode::Ldloc, Operand::Local(1)).size(), 4);
        assert_eq!(
            Instruction::new(Opcode::Switch, Operand::Switch(vec![InstrId(1), InstrId(2)])).size(),
            13
        );
    }

    #[test]
    fn test_retarget() {
        let mut operand = Operand::Switch(vec![InstrId(1), InstrId(2), InstrId(1)]);
        assert!(operand.retarget(InstrId(1), InstrId(9)));
        assert_eq!(operand.targets(), vec![InstrId(9), InstrId(2), InstrId(9)]);
        assert!(!operand.retarget(InstrId(5), InstrId(6)));

        let mut target = Operand::Target(InstrId(2));
        assert!(target.retarget(InstrId(2), InstrId(3)));
        assert_eq!(target, Operand::Target(InstrId(3)));
    }

    #[test]
    fn test_variable_resolution() {
        assert_eq!(
            Instruction::simple(Opcode::Stloc3).variable(),
            Some((VariableAccess::StoreLocal, 3))
        );
        assert_eq!(
            Instruction::new(Opcode::LdargaS, Operand::Argument(7)).variable(),
            Some((VariableAccess::LoadArgumentAddress, 7))
        );
        assert_eq!(Instruction::simple(Opcode::Dup).variable(), None);
    }

    #[test]
    fn test_compact_constructors() {
        let load = Instruction::variable_access(VariableAccess::LoadArgument, 0);
        assert_eq!(load, Instruction::simple(Opcode::Ldarg0));
        let store = Instruction::variable_access(VariableAccess::StoreLocal, 9);
        assert_eq!(store, Instruction::new(Opcode::StlocS, Operand::Local(9)));
        assert!(store.fits());

        assert_eq!(Instruction::ldc_i4(0).opcode, Opcode::LdcI40);
        assert_eq!(Instruction::ldc_i4(-7).immediate_i32(), Some(-7));
        assert_eq!(Instruction::ldc_i4(4096).opcode, Opcode::LdcI4);
    }

    #[test]
    fn test_terminal_and_display() {
        let leave = Instruction::new(Opcode::Leave, Operand::Target(InstrId(12)));
        assert!(leave.is_terminal());
        assert!(leave.is_branch());
        assert_eq!(leave.to_string(), "leave #12");
        assert!(!Instruction::simple(Opcode::Add).is_terminal());
        assert!(Instruction::simple(Opcode::Rethrow).is_terminal());
    }
}
