use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! consistency_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Consistency {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Consistency {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! shape_error {
    ($msg:expr) => {
        crate::Error::Shape {
            message: $msg.to_string(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Shape {
            message: format!($fmt, $($arg)*),
        }
    };
}

/// The generic Error type, which provides coverage for all errors the rewriter can return.
///
/// The variants follow the failure taxonomy of the filter rewriting pipeline. Errors raised
/// while a single method is being rewritten are caught at the method boundary by
/// [`crate::rewriter::FilterRewriter`], which either tallies them or wraps them into
/// [`Error::MethodFailed`] and aborts the run.
///
/// # Error Categories
///
/// ## Input shape errors
/// - [`Error::Shape`] - A region does not end with the expected instruction, or a try
///   region predecessor is unrecognized
///
/// ## Eligibility errors
/// - [`Error::Eligibility`] - The method uses a construct the current configuration
///   refuses to rewrite (generic parameters, byref locals in a handler, ...)
///
/// ## Consistency errors
/// - [`Error::Consistency`] - Post-mutation state is broken: dangling references,
///   bad variable or argument indices, straddling regions
/// - [`Error::TokenNotFound`] - A metadata token does not resolve in the module
///
/// ## Assembler errors
/// - [`Error::InvalidOperand`] - Operand kind does not match the opcode
/// - [`Error::UndefinedLabel`] - A label was referenced but never bound
///
/// # Examples
///
/// ```rust,no_run
/// use cilfilter::{Error, prelude::*};
///
/// # fn run(module: &mut Module) {
/// let mut rewriter = FilterRewriter::new(RewriteConfig::default().with_abort_on_error(true));
/// match rewriter.rewrite_module(module) {
///     Ok(report) => println!("{} methods rewritten", report.rewritten()),
///     Err(Error::MethodFailed { method, source }) => eprintln!("{method}: {source}"),
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// # }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input does not have the shape the rewriter expects.
    ///
    /// Raised for a handler region that does not end with `leave`, `rethrow` or `throw`,
    /// a filter region that does not end with `endfilter`, a try region whose last
    /// instruction is neither a structured exit nor a re-raise, and similar malformed
    /// but parseable bodies.
    #[error("Unexpected method shape - {message}")]
    Shape {
        /// Description of the unexpected shape
        message: String,
    },

    /// The method needs rewriting but uses a construct that is not eligible.
    #[error("Method {method} is not eligible for rewriting - {reason}")]
    Eligibility {
        /// Full name of the method
        method: String,
        /// Why the method was refused
        reason: String,
    },

    /// Internal bookkeeping or post-mutation validation found inconsistent state.
    ///
    /// Consistency errors are never recovered from: a method that raises one would fail
    /// bytecode verification if it were written out.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of the inconsistency
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Consistency - {file}:{line}: {message}")]
    Consistency {
        /// The message to be printed for the Consistency error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// A metadata token did not resolve to a row of the module.
    #[error("Failed to resolve token - {0}")]
    TokenNotFound(Token),

    /// An instruction was emitted with an operand that does not fit its opcode.
    #[error("Opcode '{opcode}' expects a {expected} operand")]
    InvalidOperand {
        /// Mnemonic of the offending instruction
        opcode: &'static str,
        /// Name of the operand kind the opcode expects
        expected: &'static str,
    },

    /// A label was referenced by the assembler but never bound to an instruction.
    #[error("Label was referenced but never bound")]
    UndefinedLabel,

    /// Rewriting a method failed and the run was configured to abort.
    #[error("Failed to rewrite {method}: {source}")]
    MethodFailed {
        /// Full name of the method that failed
        method: String,
        /// The error raised while rewriting it
        source: Box<Error>,
    },
}

impl Error {
    /// Returns `true` for errors that indicate corrupted internal state rather than
    /// unsupported input.
    #[must_use]
    pub fn is_consistency(&self) -> bool {
        match self {
            Error::Consistency { .. } | Error::TokenNotFound(_) => true,
            Error::MethodFailed { source, .. } => source.is_consistency(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistency_macro_records_location() {
        let err = consistency_error!("dangling reference to {}", 7);
        match &err {
            Error::Consistency {
                message,
                file,
                line,
            } => {
                assert_eq!(message, "dangling reference to 7");
                assert!(file.ends_with("error.rs"));
                assert!(*line > 0);
            }
            _ => panic!("expected consistency error"),
        }
        assert!(err.is_consistency());
    }

    #[test]
    fn test_method_failed_wraps_source() {
        let err = Error::MethodFailed {
            method: "Ns.Type::M".to_string(),
            source: Box::new(shape_error!("filter does not end with endfilter")),
        };
        assert!(!err.is_consistency());
        assert_eq!(
            err.to_string(),
            "Failed to rewrite Ns.Type::M: Unexpected method shape - filter does not end with endfilter"
        );
    }
}
