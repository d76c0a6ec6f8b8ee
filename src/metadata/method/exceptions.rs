//! Exception handler regions of editable CIL method bodies.
//!
//! Regions are delimited by instruction handles rather than byte offsets. All ends are
//! exclusive: the instruction named by `try_end` is the first one *after* the protected
//! range, which for well-formed bodies is the first instruction of the filter or handler.

use bitflags::bitflags;

use crate::{assembly::InstrId, metadata::token::Token};

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    ///
    /// `EXCEPTION` is zero, so compare with `==` rather than `contains`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause.
        const EXCEPTION = 0x0000;
        /// An exception filter and handler clause.
        const FILTER = 0x0001;
        /// A finally clause.
        const FINALLY = 0x0002;
        /// A fault clause (finally that executes only on exception).
        const FAULT = 0x0004;
    }
}

/// Exception handler defining a try region and the code protecting it.
///
/// # Layout
///
/// ```text
/// try_start ..................  protected code
/// try_end = filter_start .....  filter code, ends with endfilter   (filters only)
///           handler_start ....  handler code
/// handler_end ................  first instruction after the handler (None: end of body)
/// ```
///
/// # References
/// - ECMA-335 6th Edition, Partition II, Section 25.4.6 - Exception Handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Flags describing the type of exception handler (catch, filter, finally, fault).
    pub flags: ExceptionHandlerFlags,
    /// First protected instruction.
    pub try_start: InstrId,
    /// First instruction after the protected range.
    pub try_end: InstrId,
    /// First instruction of the filter, for `FILTER` handlers.
    pub filter_start: Option<InstrId>,
    /// First instruction of the handler.
    pub handler_start: InstrId,
    /// First instruction after the handler, `None` when the handler runs to the end of the body.
    pub handler_end: Option<InstrId>,
    /// If flags == EXCEPTION, then this type will handle the exception.
    pub catch_type: Option<Token>,
}

impl ExceptionHandler {
    /// A typed catch clause.
    #[must_use]
    pub fn catch(
        try_start: InstrId,
        try_end: InstrId,
        handler_start: InstrId,
        handler_end: Option<InstrId>,
        catch_type: Token,
    ) -> Self {
        ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_start,
            try_end,
            filter_start: None,
            handler_start,
            handler_end,
            catch_type: Some(catch_type),
        }
    }

    /// A filtered clause whose filter starts at `filter_start`.
    #[must_use]
    pub fn filter(
        try_start: InstrId,
        try_end: InstrId,
        filter_start: InstrId,
        handler_start: InstrId,
        handler_end: Option<InstrId>,
    ) -> Self {
        ExceptionHandler {
            flags: ExceptionHandlerFlags::FILTER,
            try_start,
            try_end,
            filter_start: Some(filter_start),
            handler_start,
            handler_end,
            catch_type: None,
        }
    }

    /// A finally clause.
    #[must_use]
    pub fn finally(
        try_start: InstrId,
        try_end: InstrId,
        handler_start: InstrId,
        handler_end: Option<InstrId>,
    ) -> Self {
        ExceptionHandler {
            flags: ExceptionHandlerFlags::FINALLY,
            try_start,
            try_end,
            filter_start: None,
            handler_start,
            handler_end,
            catch_type: None,
        }
    }

    /// Returns `true` for filtered clauses.
    #[must_use]
    pub fn is_filter(&self) -> bool {
        self.flags == ExceptionHandlerFlags::FILTER
    }

    /// Returns `true` for typed catch clauses.
    #[must_use]
    pub fn is_catch(&self) -> bool {
        self.flags == ExceptionHandlerFlags::EXCEPTION
    }

    /// Returns `true` for finally and fault clauses.
    #[must_use]
    pub fn is_finally_or_fault(&self) -> bool {
        self.flags == ExceptionHandlerFlags::FINALLY || self.flags == ExceptionHandlerFlags::FAULT
    }

    /// Returns `true` if both handlers protect exactly the same try range.
    #[must_use]
    pub fn same_try(&self, other: &ExceptionHandler) -> bool {
        self.try_start == other.try_start && self.try_end == other.try_end
    }

    /// Every instruction handle this region refers to.
    #[must_use]
    pub fn references(&self) -> Vec<InstrId> {
        let mut refs = vec![self.try_start, self.try_end, self.handler_start];
        refs.extend(self.filter_start);
        refs.extend(self.handler_end);
        refs
    }

    /// Replaces every boundary equal to `old` with `new`.
    pub fn retarget(&mut self, old: InstrId, new: InstrId) {
        for slot in [&mut self.try_start, &mut self.try_end, &mut self.handler_start] {
            if *slot == old {
                *slot = new;
            }
        }
        for slot in [&mut self.filter_start, &mut self.handler_end]
            .into_iter()
            .flatten()
        {
            if *slot == old {
                *slot = new;
            }
        }
    }
}
