//! # cilfilter Prelude
//!
//! The types needed to build a module, run the rewriter over it and inspect the outcome.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all cilfilter operations
pub use crate::Error;

/// The result type used throughout cilfilter
pub use crate::Result;

// ================================================================================================
// Module Model
// ================================================================================================

pub use crate::metadata::{
    method::{ExceptionHandler, MethodAccessFlags, MethodBody, MethodDef, MethodModifiers, Parameter},
    module::{MemberSig, Module},
    signatures::{GenericContext, TypeSig},
    token::{TableId, Token},
    typedef::{FieldAttributes, TypeAttributes, TypeDef},
    validation::BodyValidator,
};

// ================================================================================================
// Instructions
// ================================================================================================

pub use crate::assembly::{InstrId, Instruction, InstructionAssembler, Label, Opcode, Operand};

// ================================================================================================
// Rewriting
// ================================================================================================

pub use crate::rewriter::{
    EventKind, EventLog, FilterRewriter, FilterRuntime, MethodFailure, RewriteConfig,
    RewriteReport,
};
