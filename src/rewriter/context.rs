//! Per-method rewrite state.
//!
//! A [`RewriteContext`] is created when the rewriter starts on one method and dropped when it
//! is done. Everything in it that names an instruction of the owner body is bookkeeping the
//! [`crate::rewriter::editor`] keeps up to date whenever an instruction is replaced.

use std::collections::HashSet;

use crate::{
    assembly::InstrId,
    metadata::{method::ExceptionHandler, signatures::GenericContext, token::Token},
    rewriter::events::EventLog,
};

/// Monotonic counters used to name synthesized types and units.
///
/// The rewriter owns one set for the whole run; a context works on a copy that is written
/// back only when the method commits, so rolled back methods do not leave gaps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NameCounters {
    /// Capture record types
    pub closures: u32,
    /// Filter predicates, filter types and their activation units
    pub filters: u32,
    /// Extracted catch units
    pub catches: u32,
}

impl NameCounters {
    /// Returns the next closure number.
    pub fn next_closure(&mut self) -> u32 {
        let value = self.closures;
        self.closures += 1;
        value
    }

    /// Returns the next filter number.
    pub fn next_filter(&mut self) -> u32 {
        let value = self.filters;
        self.filters += 1;
        value
    }

    /// Returns the next catch unit number.
    pub fn next_catch(&mut self) -> u32 {
        let value = self.catches;
        self.catches += 1;
        value
    }
}

/// Units synthesized for one filtered handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterUnits {
    /// Record field holding the filter object, as referenced from the owner
    pub field: Token,
    /// `activate_filterN(record)`, as referenced from the owner
    pub activate: Token,
    /// `deactivate_filterN(record)`, as referenced from the owner
    pub deactivate: Token,
}

/// An extracted catch body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUnit {
    /// The unit, as referenced from the owner
    pub method: Token,
    /// Leave-target table: code `k` resumes at `targets[k - 1]`
    pub targets: Vec<InstrId>,
    /// Whether the body can return code `0`
    pub rethrows: bool,
}

/// One handler of a group, in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupHandler {
    /// The original region
    pub region: ExceptionHandler,
    /// Filter units, for filtered handlers once extracted
    pub filter: Option<FilterUnits>,
    /// The extracted catch body
    pub catch: Option<CatchUnit>,
}

/// Handlers protecting one identical try range, at least one of them filtered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerGroup {
    /// First protected instruction
    pub try_start: InstrId,
    /// First instruction after the protected range
    pub try_end: InstrId,
    /// Handlers in declared order
    pub handlers: Vec<GroupHandler>,
    /// Where the try range resumes on normal exit, `None` if it always throws
    pub exit: Option<InstrId>,
}

impl HandlerGroup {
    /// Returns `true` if any handler of the group is filtered.
    #[must_use]
    pub fn has_filters(&self) -> bool {
        self.handlers.iter().any(|handler| handler.region.is_filter())
    }

    /// Filter units of the group, in declared order.
    pub fn filters(&self) -> impl DoubleEndedIterator<Item = &FilterUnits> {
        self.handlers.iter().filter_map(|handler| handler.filter.as_ref())
    }

    fn remap(&mut self, old: InstrId, new: InstrId) {
        for slot in [&mut self.try_start, &mut self.try_end] {
            if *slot == old {
                *slot = new;
            }
        }
        for handler in &mut self.handlers {
            handler.region.retarget(old, new);
        }
        self.remap_resume(old, new);
    }

    /// Moves the places the group resumes at after a handler ran: its exit point and the
    /// leave-target tables of its catch units.
    fn remap_resume(&mut self, old: InstrId, new: InstrId) {
        if self.exit == Some(old) {
            self.exit = Some(new);
        }
        for unit in self.handlers.iter_mut().filter_map(|handler| handler.catch.as_mut()) {
            for target in unit.targets.iter_mut().filter(|target| **target == old) {
                *target = new;
            }
        }
    }
}

/// State of one method rewrite.
#[derive(Debug)]
pub struct RewriteContext {
    /// The method being rewritten
    pub method: Token,
    /// Its full name, for diagnostics
    pub method_name: String,
    /// Generic parameter layout of the method
    pub generics: GenericContext,
    /// Naming counters, copied from the run
    pub counters: NameCounters,
    /// Handler groups pending synthesis, innermost first
    pub groups: Vec<HandlerGroup>,
    /// Consumed instructions overwritten by `nop`, removed before validation
    pub placeholders: HashSet<InstrId>,
    /// Events of this method, merged into the run log on commit
    pub events: EventLog,
}

impl RewriteContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new(
        method: Token,
        method_name: impl Into<String>,
        generics: GenericContext,
        counters: NameCounters,
    ) -> Self {
        RewriteContext {
            method,
            method_name: method_name.into(),
            generics,
            counters,
            groups: Vec::new(),
            placeholders: HashSet::new(),
            events: EventLog::new(),
        }
    }

    /// Substitutes `new` for `old` in every pending group descriptor.
    pub fn remap(&mut self, old: InstrId, new: InstrId) {
        self.remap_except(old, new, None);
    }

    /// Like [`RewriteContext::remap`], but keeps the try range and regions of the group at index
    /// `skip` where they are. Its exit point and catch unit targets still move, since handlers
    /// resume from outside the try range.
    pub fn remap_except(&mut self, old: InstrId, new: InstrId, skip: Option<usize>) {
        for (index, group) in self.groups.iter_mut().enumerate() {
            if Some(index) == skip {
                group.remap_resume(old, new);
            } else {
                group.remap(old, new);
            }
        }
    }

    /// Returns `true` if `id` is a placeholder.
    #[must_use]
    pub fn is_placeholder(&self, id: InstrId) -> bool {
        self.placeholders.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> HandlerGroup {
        HandlerGroup {
            try_start: InstrId(0),
            try_end: InstrId(2),
            handlers: vec![GroupHandler {
                region: ExceptionHandler::filter(
                    InstrId(0),
                    InstrId(2),
                    InstrId(2),
                    InstrId(4),
                    Some(InstrId(6)),
                ),
                filter: None,
                catch: Some(CatchUnit {
                    method: Token(0x0600_0002),
                    targets: vec![InstrId(6), InstrId(0)],
                    rethrows: false,
                }),
            }],
            exit: Some(InstrId(6)),
        }
    }

    #[test]
    fn test_counters_are_monotonic() {
        let mut counters = NameCounters::default();
        assert_eq!(counters.next_filter(), 0);
        assert_eq!(counters.next_filter(), 1);
        assert_eq!(counters.next_catch(), 0);
        assert_eq!(counters.next_closure(), 0);
        assert_eq!(counters.filters, 2);
    }

    #[test]
    fn test_remap_skips_excluded_group() {
        let mut ctx = RewriteContext::new(
            Token(0x0600_0001),
            "Demo.Program::Run",
            GenericContext::default(),
            NameCounters::default(),
        );
        ctx.groups.push(group());
        ctx.groups.push(group());

        ctx.remap_except(InstrId(6), InstrId(9), Some(1));
        let first = &ctx.groups[0];
        assert_eq!(first.exit, Some(InstrId(9)));
        assert_eq!(first.handlers[0].region.handler_end, Some(InstrId(9)));
        assert_eq!(
            first.handlers[0].catch.as_ref().unwrap().targets,
            vec![InstrId(9), InstrId(0)]
        );
        let second = &ctx.groups[1];
        assert_eq!(second.exit, Some(InstrId(9)));
        assert_eq!(second.handlers[0].region.handler_end, Some(InstrId(6)));

        ctx.remap(InstrId(0), InstrId(7));
        assert_eq!(ctx.groups[1].try_start, InstrId(7));
        assert!(ctx.groups[1].has_filters());
    }

    #[test]
    fn test_excluded_group_resumes_at_new_handle() {
        let mut ctx = RewriteContext::new(
            Token(0x0600_0001),
            "Demo.Program::Run",
            GenericContext::default(),
            NameCounters::default(),
        );
        ctx.groups.push(group());

        // A catch body jumping back to the start of its own try range
        ctx.remap_except(InstrId(0), InstrId(8), Some(0));
        let group = &ctx.groups[0];
        assert_eq!(group.try_start, InstrId(0));
        assert_eq!(group.handlers[0].region.try_start, InstrId(0));
        assert_eq!(
            group.handlers[0].catch.as_ref().unwrap().targets,
            vec![InstrId(6), InstrId(8)]
        );
    }
}
