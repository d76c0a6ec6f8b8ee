// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! # cilfilter
//!
//! An offline rewriter that removes filtered exception handlers from CIL method bodies.
//!
//! A filtered handler runs a predicate region to decide whether its catch body applies.
//! Not every target runtime supports them, so `cilfilter` replaces each try range guarded by
//! filters with a single catch-all region that asks a small runtime support type which
//! handler, if any, claimed the exception:
//!
//! - variables the filters and handlers use move into a heap-allocated capture record
//! - every filter becomes a static predicate unit plus a filter object pushed onto the
//!   runtime filter stack while the try range is active
//! - every handler body becomes a static catch unit returning which `leave` target to resume
//!   at, or `0` to rethrow
//!
//! The rewrite preserves observable behavior and the structural validity of the body. Every
//! method is validated before it is committed and rolled back as a whole if anything fails.
//!
//! ## Features
//!
//! - **In-memory CIL model** - Modules, types, fields, methods, interned references and
//!   arena-backed method bodies whose instructions refer to each other by identity
//! - **Instruction assembler** - Label-based emission of new code
//! - **Structural validation** - Dangling references, bad indices and malformed regions
//! - **Transactional rewriting** - Checkpoint, commit and rollback per method
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cilfilter::prelude::*;
//!
//! # fn example(module: &mut Module) -> cilfilter::Result<()> {
//! let mut rewriter = FilterRewriter::new(RewriteConfig::default());
//! let report = rewriter.rewrite_module(module)?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```
//!
//! Reading and writing the binary module format is left to an external reader and writer
//! that populate [`metadata::module::Module`] and serialize it back, using
//! [`metadata::method::MethodBody::layout`] for final offsets.
//!
//! ## Logging
//!
//! The library logs through the [`log`] facade and never installs a backend. Binaries pick
//! one, for example `env_logger`.

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust,no_run
/// use cilfilter::prelude::*;
///
/// let mut module = Module::new("Demo.dll");
/// let mut rewriter = FilterRewriter::new(RewriteConfig::default());
/// let report = rewriter.rewrite_module(&mut module)?;
/// assert!(report.is_success());
/// # Ok::<(), cilfilter::Error>(())
/// ```
pub mod prelude;

/// CIL opcodes, instructions and the label-based instruction assembler.
///
/// # Key Types
///
/// - [`assembly::Opcode`] - Every opcode with its operand type and flow behavior
/// - [`assembly::Instruction`] - An opcode with its operand
/// - [`assembly::InstrId`] - Identity of an instruction inside a body's arena
/// - [`assembly::InstructionAssembler`] - Emits instruction sequences with labels
pub mod assembly;

/// The in-memory module model the rewriter operates on.
///
/// See [`metadata::module::Module`] for the tables and [`metadata::method::MethodBody`] for
/// editable bodies.
pub mod metadata;

/// Exception filter rewriting.
///
/// See [`rewriter::FilterRewriter`] for the entry point.
pub mod rewriter;

/// `cilfilter` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `cilfilter` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use cilfilter::{prelude::*, Error};
///
/// # fn example(module: &mut Module) {
/// let mut rewriter = FilterRewriter::new(RewriteConfig::default().with_abort_on_error(true));
/// match rewriter.rewrite_module(module) {
///     Ok(report) => println!("{} methods rewritten", report.rewritten()),
///     Err(Error::MethodFailed { method, source }) => println!("{method}: {source}"),
///     Err(e) => println!("Error: {e}"),
/// }
/// # }
/// ```
pub use error::Error;
