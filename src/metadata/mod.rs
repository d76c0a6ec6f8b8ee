//! In-memory CIL module model.
//!
//! This is the bytecode model the rewriter operates on: a module with type, field and method
//! definitions, interned references, and editable method bodies whose instructions refer to
//! each other by identity. Reading and writing the binary module format is left to an
//! external reader/writer that populates and serializes this model.
//!
//! # Key Components
//!
//! - [`module`] - The module and its tables, with checkpoint/rollback support
//! - [`typedef`] - Type and field definitions
//! - [`method`] - Method definitions, bodies and exception handler regions
//! - [`signatures`] - Type signatures and generic parameter lifting
//! - [`token`] - Metadata table row references
//! - [`validation`] - Structural validation of method bodies

pub mod method;
pub mod module;
pub mod signatures;
pub mod token;
pub mod typedef;
pub mod validation;
