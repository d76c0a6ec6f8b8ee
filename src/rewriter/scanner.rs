//! Variable usage scanning over instruction ranges.

use std::collections::BTreeSet;

use crate::{
    assembly::InstrId,
    metadata::method::MethodBody,
    Result,
};

/// Local variable slots and arguments touched by a range of code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    /// Local variable slots loaded, stored or taken the address of
    pub locals: BTreeSet<u16>,
    /// Arguments loaded, stored or taken the address of, `this` included
    pub args: BTreeSet<u16>,
}

impl Usage {
    /// Adds everything `other` uses.
    pub fn merge(&mut self, other: Usage) {
        self.locals.extend(other.locals);
        self.args.extend(other.args);
    }

    /// Returns `true` if nothing is used.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locals.is_empty() && self.args.is_empty()
    }
}

/// Collects the variables used by the inclusive range `[first, last]` of `body`.
///
/// Numbered short forms (`ldloc.2`, `ldarg.0`, ...) are resolved to their slot. The capture
/// record slot, if given, is never reported, which keeps rescanning a rewritten range stable.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if either end of the range is not placed or the range
/// is inverted.
pub fn scan(
    body: &MethodBody,
    first: InstrId,
    last: InstrId,
    record: Option<u16>,
) -> Result<Usage> {
    let start = body.require_position(first)?;
    let end = body.require_position(last)?;
    if end < start {
        return Err(consistency_error!(
            "Scan range {} .. {} is inverted",
            first,
            last
        ));
    }

    let mut usage = Usage::default();
    for id in &body.code()[start..=end] {
        let Some((access, index)) = body.instr(*id)?.variable() else {
            continue;
        };
        if access.is_local() {
            if Some(index) != record {
                usage.locals.insert(index);
            }
        } else {
            usage.args.insert(index);
        }
    }
    Ok(usage)
}

/// Like [`scan`], over the half-open region range `[start, end)`, where a missing end means
/// the end of the body. An empty range uses nothing.
///
/// # Errors
/// Returns [`crate::Error::Consistency`] if a boundary is not placed or the range is inverted.
pub fn scan_span(
    body: &MethodBody,
    start: InstrId,
    end: Option<InstrId>,
    record: Option<u16>,
) -> Result<Usage> {
    let (first, after) = body.span(start, end)?;
    match (body.at(first), after.checked_sub(1).and_then(|last| body.at(last))) {
        (Some(first_id), Some(last_id)) if after > first => scan(body, first_id, last_id, record),
        _ => Ok(Usage::default()),
    }
}
