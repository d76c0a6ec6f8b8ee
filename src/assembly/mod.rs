//! CIL instruction model and assembler.
//!
//! # Key Components
//!
//! - [`Opcode`] - The opcodes the rewriter reads and emits, with encoding metadata
//! - [`Instruction`], [`Operand`], [`InstrId`] - Editable instructions referring to each
//!   other by identity
//! - [`InstructionAssembler`] - Emits instruction sequences with forward labels

mod builder;
mod instruction;
mod opcodes;

pub use builder::{InstructionAssembler, Label};
pub use instruction::{FlowType, Immediate, InstrId, Instruction, Operand, OperandType};
pub use opcodes::{Opcode, VariableAccess};
