//! What the rewriter did, as a flat list of events.
//!
//! Each method collects its events in the [`EventLog`] of its [`super::RewriteContext`]. The
//! log is merged into the rewriter's run log when the method commits and thrown away when it
//! rolls back, so the run log only ever describes code that is actually in the module.
//! [`crate::rewriter::RewriteReport`] counts events instead of keeping its own tallies.
//!
//! # Example
//!
//! ```rust,no_run
//! use cilfilter::rewriter::{EventKind, EventLog};
//! use cilfilter::metadata::token::Token;
//!
//! let log = EventLog::new();
//! log.record(EventKind::FilterExtracted)
//!     .at(Token(0x0600_0001), 0)
//!     .message("filter0 on __closure0");
//! assert_eq!(log.count_kind(EventKind::FilterExtracted), 1);
//! ```

use std::{collections::BTreeMap, fmt};

use crate::metadata::token::Token;

/// What an [`Event`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    /// A capture record type was added for a method
    ClosureCreated,
    /// A local or argument moved into the capture record
    VariableCaptured,
    /// A filter range became a predicate unit
    FilterExtracted,
    /// A handler range became a catch unit
    CatchExtracted,
    /// A handler group was replaced by one catch-all region
    GroupSynthesized,
    /// A handler group with only empty handlers was removed
    GroupDropped,
    /// Placeholders left behind by extraction were removed
    PlaceholdersStripped,
    /// Long branches were turned back into short ones
    BranchesShrunk,
    /// A method was committed
    MethodRewritten,
    /// A method failed and was rolled back
    Error,
}

impl EventKind {
    /// Short label used in summaries.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ClosureCreated => "closures",
            Self::VariableCaptured => "captures",
            Self::FilterExtracted => "filters",
            Self::CatchExtracted => "catches",
            Self::GroupSynthesized => "groups",
            Self::GroupDropped => "dropped groups",
            Self::PlaceholdersStripped => "strips",
            Self::BranchesShrunk => "shrinks",
            Self::MethodRewritten => "methods",
            Self::Error => "errors",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One entry of an [`EventLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// What happened
    pub kind: EventKind,
    /// Method it happened in
    pub method: Option<Token>,
    /// Handler group index within the method
    pub group: Option<usize>,
    /// Details, the kind's label when nothing more specific was given
    pub message: String,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.method, self.group) {
            (Some(method), Some(group)) => {
                write!(f, "{} group {}: {}", method, group, self.message)
            }
            (Some(method), None) => write!(f, "{}: {}", method, self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Fills in an event; it lands in the log when the builder is dropped.
pub struct EventBuilder<'a> {
    log: &'a EventLog,
    event: Option<Event>,
}

impl EventBuilder<'_> {
    /// Attributes the event to `group` of `method`.
    pub fn at(mut self, method: Token, group: usize) -> Self {
        if let Some(event) = &mut self.event {
            event.method = Some(method);
            event.group = Some(group);
        }
        self
    }

    /// Attributes the event to `method` as a whole.
    pub fn method(mut self, method: Token) -> Self {
        if let Some(event) = &mut self.event {
            event.method = Some(method);
        }
        self
    }

    /// Replaces the default message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        if let Some(event) = &mut self.event {
            event.message = message.into();
        }
        self
    }
}

impl Drop for EventBuilder<'_> {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            self.log.events.push(event);
        }
    }
}

/// Append-only event list.
///
/// Appending only needs `&self`, so stages can log while the module and body are mutably
/// borrowed elsewhere.
#[derive(Debug)]
pub struct EventLog {
    events: boxcar::Vec<Event>,
}

impl Default for EventLog {
    fn default() -> Self {
        EventLog {
            events: boxcar::Vec::new(),
        }
    }
}

impl Clone for EventLog {
    fn clone(&self) -> Self {
        let copy = Self::new();
        copy.merge(self);
        copy
    }
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.count()
    }

    /// Returns `true` if nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts an event of `kind`.
    pub fn record(&self, kind: EventKind) -> EventBuilder<'_> {
        EventBuilder {
            log: self,
            event: Some(Event {
                kind,
                method: None,
                group: None,
                message: kind.label().to_string(),
            }),
        }
    }

    /// Appends a copy of every event of `other`, in order.
    pub fn merge(&self, other: &EventLog) {
        for event in other.iter() {
            self.events.push(event.clone());
        }
    }

    /// Events in the order they were logged.
    pub fn iter(&self) -> impl Iterator<Item = &Event> + '_ {
        self.events.iter().map(|(_, event)| event)
    }

    /// Events attributed to `method`.
    pub fn for_method(&self, method: Token) -> impl Iterator<Item = &Event> + '_ {
        self.iter().filter(move |event| event.method == Some(method))
    }

    /// Number of events of `kind`.
    #[must_use]
    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.iter().filter(|event| event.kind == kind).count()
    }

    /// Returns `true` if at least one event of `kind` was logged.
    #[must_use]
    pub fn has(&self, kind: EventKind) -> bool {
        self.iter().any(|event| event.kind == kind)
    }

    /// Counts per kind, e.g. `1 filters, 1 methods, 2 catches`.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut counts: BTreeMap<EventKind, usize> = BTreeMap::new();
        for event in self.iter() {
            *counts.entry(event.kind).or_default() += 1;
        }
        if counts.is_empty() {
            return "nothing to do".to_string();
        }

        let mut parts: Vec<String> = counts
            .into_iter()
            .map(|(kind, count)| format!("{count} {kind}"))
            .collect();
        parts.sort();
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_logs_on_drop() {
        let log = EventLog::new();
        log.record(EventKind::CatchExtracted).at(Token(0x0600_0002), 1);
        assert_eq!(log.len(), 1);

        let event = log.iter().next().unwrap();
        assert_eq!(event.message, "catches");
        assert_eq!(event.method, Some(Token(0x0600_0002)));
        assert_eq!(event.group, Some(1));
    }

    #[test]
    fn test_merge_keeps_attribution() {
        let method = EventLog::new();
        method
            .record(EventKind::FilterExtracted)
            .method(Token(0x0600_0001))
            .message("filter0");
        method.record(EventKind::GroupDropped);

        let run = EventLog::new();
        run.merge(&method);
        run.merge(&method);
        assert_eq!(run.count_kind(EventKind::FilterExtracted), 2);
        assert_eq!(run.for_method(Token(0x0600_0001)).count(), 2);
        assert!(run.has(EventKind::GroupDropped));
        assert!(!run.has(EventKind::Error));
        assert_eq!(run.clone().len(), 4);
    }

    #[test]
    fn test_summary() {
        let log = EventLog::new();
        assert_eq!(log.summary(), "nothing to do");

        log.record(EventKind::MethodRewritten);
        log.record(EventKind::FilterExtracted);
        log.record(EventKind::FilterExtracted);
        assert_eq!(log.summary(), "1 methods, 2 filters");
    }
}
