//! Exception filter rewriting.
//!
//! This module removes filtered exception handlers from method bodies and replaces them with
//! plain catch-all regions that consult a runtime filter stack. A method is rewritten as a
//! whole or not at all:
//!
//! ```text
//! eligibility → expand branches → scan → capture
//!             → per group, innermost first: extract filters and catches,
//!               activate, deactivate, synthesize the replacement handler
//!             → strip placeholders → re-sort regions → shrink branches → validate
//! ```
//!
//! Any error inside that sequence rolls the module back to the state it had before the method
//! was touched. [`FilterRewriter::rewrite_module`] then either aborts or tallies the failure,
//! depending on [`RewriteConfig::abort_on_error`].
//!
//! # Key Components
//!
//! - [`FilterRewriter`] - Drives the pipeline over one method or a whole module
//! - [`RewriteConfig`] - Options mirrored from the command line front end
//! - [`RewriteReport`] - Outcome of a module run, derived from the [`EventLog`]
//! - [`closure`], [`extract`], [`activation`], [`groups`] - The individual stages
//!
//! # Example
//!
//! ```rust,no_run
//! use cilfilter::prelude::*;
//!
//! # fn example(module: &mut Module) -> cilfilter::Result<()> {
//! let mut rewriter = FilterRewriter::new(RewriteConfig::default().with_verbose(true));
//! let report = rewriter.rewrite_module(module)?;
//! println!("{}", report.summary());
//! std::process::exit(report.exit_code() as i32);
//! # }
//! ```

pub mod activation;
pub mod closure;
pub mod config;
pub mod context;
pub mod editor;
pub mod events;
pub mod extract;
pub mod groups;
pub mod runtime;
pub mod scanner;
pub mod units;

use std::collections::HashMap;

pub use closure::ClosureRecord;
pub use config::RewriteConfig;
pub use context::{NameCounters, RewriteContext};
pub use events::{Event, EventKind, EventLog};
pub use runtime::FilterRuntime;

use crate::{
    metadata::{
        method::MethodBody, module::Module, signatures::GenericContext, token::Token,
        validation::BodyValidator,
    },
    Error, Result,
};

/// A method that failed and was rolled back.
#[derive(Debug)]
pub struct MethodFailure {
    /// The method token
    pub method: Token,
    /// Its full name
    pub name: String,
    /// What went wrong
    pub error: Error,
}

/// Outcome of [`FilterRewriter::rewrite_module`].
#[derive(Debug, Default)]
pub struct RewriteReport {
    /// Methods that were rewritten and committed
    pub rewritten: Vec<Token>,
    /// Methods without filtered handlers
    pub skipped: usize,
    /// Methods that failed and were rolled back
    pub failures: Vec<MethodFailure>,
    /// Events of every committed method, plus one error event per failure
    pub events: EventLog,
}

impl RewriteReport {
    /// Number of rewritten methods.
    #[must_use]
    pub fn rewritten(&self) -> usize {
        self.rewritten.len()
    }

    /// Number of filter regions turned into predicate units.
    #[must_use]
    pub fn filters_extracted(&self) -> usize {
        self.events.count_kind(EventKind::FilterExtracted)
    }

    /// Number of handler bodies turned into catch units.
    #[must_use]
    pub fn catches_extracted(&self) -> usize {
        self.events.count_kind(EventKind::CatchExtracted)
    }

    /// Number of handler groups removed because all their handlers were empty.
    #[must_use]
    pub fn groups_dropped(&self) -> usize {
        self.events.count_kind(EventKind::GroupDropped)
    }

    /// Process exit code for a front end: the number of failed methods.
    #[must_use]
    pub fn exit_code(&self) -> usize {
        self.failures.len()
    }

    /// Returns `true` if no method failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// One line describing the run.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} rewritten, {} skipped, {} failed ({})",
            self.rewritten(),
            self.skipped,
            self.failures.len(),
            self.events.summary()
        )
    }
}

/// Rewrites filtered exception handlers, one method at a time.
///
/// The rewriter keeps the naming counters and the capture record of every method it
/// committed for as long as it lives, so names stay unique across calls on the same module.
#[derive(Debug, Default)]
pub struct FilterRewriter {
    config: RewriteConfig,
    counters: NameCounters,
    closures: HashMap<Token, ClosureRecord>,
    events: EventLog,
}

impl FilterRewriter {
    /// Creates a rewriter with the given configuration.
    #[must_use]
    pub fn new(config: RewriteConfig) -> Self {
        FilterRewriter {
            config,
            counters: NameCounters::default(),
            closures: HashMap::new(),
            events: EventLog::new(),
        }
    }

    /// The configuration of this rewriter.
    #[must_use]
    pub fn config(&self) -> &RewriteConfig {
        &self.config
    }

    /// The capture record synthesized for `method`, if it was rewritten.
    #[must_use]
    pub fn closure(&self, method: Token) -> Option<&ClosureRecord> {
        self.closures.get(&method)
    }

    /// Events of every method committed so far.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Rewrites every method of `module` that has filtered handlers.
    ///
    /// # Errors
    /// Returns [`Error::MethodFailed`] for the first failing method if
    /// [`RewriteConfig::abort_on_error`] is set. Otherwise failures are rolled back and listed
    /// in the report.
    pub fn rewrite_module(&mut self, module: &mut Module) -> Result<RewriteReport> {
        let mut report = RewriteReport::default();

        for token in module.method_tokens() {
            match self.rewrite_method(module, token) {
                Ok(true) => report.rewritten.push(token),
                Ok(false) => report.skipped += 1,
                Err(error) => {
                    let name = module
                        .method_name(token)
                        .unwrap_or_else(|_| token.to_string());
                    log::error!("{}: {}", name, error);
                    report
                        .events
                        .record(EventKind::Error)
                        .method(token)
                        .message(format!("{name}: {error}"));

                    if self.config.abort_on_error {
                        return Err(Error::MethodFailed {
                            method: name,
                            source: Box::new(error),
                        });
                    }
                    report.failures.push(MethodFailure {
                        method: token,
                        name,
                        error,
                    });
                }
            }
        }

        report.events.merge(&self.events);
        log::info!("{}", report.summary());
        Ok(report)
    }

    /// Rewrites the filtered handlers of one method. Returns `false` if it has none.
    ///
    /// On error the module is left exactly as it was before the call.
    ///
    /// # Errors
    /// Returns [`Error::Eligibility`] for methods the configuration refuses,
    /// [`Error::Shape`] for handler layouts the rewriter does not understand and
    /// [`Error::Consistency`] if the rewritten body fails validation.
    pub fn rewrite_method(&mut self, module: &mut Module, token: Token) -> Result<bool> {
        if !module.method(token)?.has_filters() {
            return Ok(false);
        }

        let snapshot = module.checkpoint();
        let first_new = module.method_tokens().len();
        match self.rewrite_checked(module, token, first_new) {
            Ok((ctx, record)) => {
                module.commit();
                self.counters = ctx.counters;
                if let Some(record) = record {
                    self.closures.insert(token, record);
                }

                ctx.events
                    .record(EventKind::MethodRewritten)
                    .method(token)
                    .message(ctx.method_name.clone());
                if self.config.verbose {
                    log::info!("{}: {}", ctx.method_name, ctx.events.summary());
                } else {
                    log::debug!("{}: {}", ctx.method_name, ctx.events.summary());
                }
                self.events.merge(&ctx.events);
                Ok(true)
            }
            Err(error) => {
                module.rollback(snapshot);
                Err(error)
            }
        }
    }

    fn rewrite_checked(
        &self,
        module: &mut Module,
        token: Token,
        first_new: usize,
    ) -> Result<(RewriteContext, Option<ClosureRecord>)> {
        let method_name = module.method_name(token)?;
        let method = module.method(token)?;
        let generics = GenericContext::new(
            module.type_def(method.declaring_type)?.generic_count(),
            method.generic_params.len() as u16,
        );
        if !generics.is_empty() && !self.config.allow_generics {
            return Err(Error::Eligibility {
                method: method_name,
                reason: "generic method or declaring type".to_string(),
            });
        }

        let runtime = FilterRuntime::import(module, &self.config);
        let mut ctx = RewriteContext::new(token, method_name, generics, self.counters);
        let mut body = module
            .method_mut(token)?
            .body
            .take()
            .ok_or_else(|| consistency_error!("Method {} has filters but no body", token))?;

        let transformed = self.transform(module, &runtime, &mut ctx, &mut body);
        module.method_mut(token)?.body = Some(body);
        let record = transformed?;

        let validator = BodyValidator::new(module);
        validator.validate_method(token)?;
        for added in module.method_tokens().iter().skip(first_new) {
            validator.validate_method(*added)?;
        }
        Ok((ctx, record))
    }

    fn transform(
        &self,
        module: &mut Module,
        runtime: &FilterRuntime,
        ctx: &mut RewriteContext,
        body: &mut MethodBody,
    ) -> Result<Option<ClosureRecord>> {
        let stack = body.max_stack;
        body.expand_short_branches();
        ctx.groups = groups::collect(body, &ctx.method_name)?;

        let mut index = 0;
        while index < ctx.groups.len() {
            if groups::is_empty(body, &ctx.groups[index])? {
                groups::drop_group(body, ctx, index)?;
                ctx.groups.remove(index);
            } else {
                index += 1;
            }
        }

        let cached = self.closures.get(&ctx.method).cloned();
        let record = if ctx.groups.is_empty() {
            cached
        } else {
            Some(self.rewrite_groups(module, runtime, ctx, body, cached)?)
        };

        let stripped = editor::strip_placeholders(body, ctx)?;
        if stripped > 0 {
            ctx.events
                .record(EventKind::PlaceholdersStripped)
                .method(ctx.method)
                .message(format!("{stripped} placeholders"));
        }
        sort_regions(body)?;

        if self.config.shrink_branches {
            let shrunk = body.shrink_branches();
            if shrunk > 0 {
                ctx.events
                    .record(EventKind::BranchesShrunk)
                    .method(ctx.method)
                    .message(format!("{shrunk} branches"));
            }
        }

        if let Some(record) = &record {
            body.max_stack = stack
                .saturating_add(1)
                .max(2 + record.passthrough.len() as u16)
                .max(record.ctor_params.len() as u16)
                .max(2);
        }
        log::trace!("{}:\n{}", ctx.method_name, body.listing());
        Ok(record)
    }

    fn rewrite_groups(
        &self,
        module: &mut Module,
        runtime: &FilterRuntime,
        ctx: &mut RewriteContext,
        body: &mut MethodBody,
        cached: Option<ClosureRecord>,
    ) -> Result<ClosureRecord> {
        let record_slot = cached.as_ref().map(|record| record.local);
        let mut usage = scanner::Usage::default();
        for group in &ctx.groups {
            for handler in &group.handlers {
                let region = &handler.region;
                if let Some(filter_start) = region.filter_start {
                    usage.merge(scanner::scan_span(
                        body,
                        filter_start,
                        Some(region.handler_start),
                        record_slot,
                    )?);
                }
                usage.merge(scanner::scan_span(
                    body,
                    region.handler_start,
                    region.handler_end,
                    record_slot,
                )?);
            }
        }
        log::debug!(
            "{}: {} groups use {} locals and {} arguments",
            ctx.method_name,
            ctx.groups.len(),
            usage.locals.len(),
            usage.args.len()
        );

        let record = closure::capture(module, runtime, ctx, body, cached, &usage)?;

        for index in 0..ctx.groups.len() {
            for slot in 0..ctx.groups[index].handlers.len() {
                let region = ctx.groups[index].handlers[slot].region.clone();
                if region.is_filter() {
                    let predicate =
                        units::extract_filter(module, ctx, &record, body, &region, index)?;
                    let filter = activation::synthesize(module, runtime, &record, predicate)?;
                    ctx.groups[index].handlers[slot].filter = Some(filter);
                }

                let region = ctx.groups[index].handlers[slot].region.clone();
                let catch = units::extract_catch(module, ctx, &record, body, &region, index)?;
                ctx.groups[index].handlers[slot].catch = Some(catch);
            }

            activation::insert_activation(body, ctx, &record, index)?;
            let exits = activation::insert_deactivations(body, ctx, &record, index)?;
            log::debug!(
                "{}: group {} activated, {} exits deactivate",
                ctx.method_name,
                index,
                exits
            );
            groups::synthesize(module, runtime, ctx, &record, body, index)?;
        }
        Ok(record)
    }
}

/// Orders regions innermost first. Regions sharing a try range keep their relative order.
fn sort_regions(body: &mut MethodBody) -> Result<()> {
    let mut extents = Vec::with_capacity(body.exception_handlers.len());
    for region in &body.exception_handlers {
        let (start, _) = body.span(region.try_start, Some(region.try_end))?;
        let (_, end) = body.span(region.handler_start, region.handler_end)?;
        extents.push((start, end, region.try_start, region.try_end));
    }

    let depths: Vec<usize> = extents
        .iter()
        .map(|inner| {
            extents
                .iter()
                .filter(|outer| {
                    (outer.2, outer.3) != (inner.2, inner.3)
                        && outer.0 <= inner.0
                        && inner.1 <= outer.1
                })
                .count()
        })
        .collect();

    let mut ordered: Vec<_> = body.exception_handlers.drain(..).zip(depths).collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1));
    body.exception_handlers = ordered.into_iter().map(|(region, _)| region).collect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{Instruction, Opcode, Operand},
        metadata::{method::ExceptionHandler, signatures::TypeSig},
        test::factories::{filter_body, instance_method, program_module, static_method},
    };

    #[test]
    fn test_rewrite_single_filter() {
        let (mut module, program) = program_module();
        let (body, _) = filter_body();
        let method = instance_method(&mut module, program, "Run", vec![TypeSig::I4], body);

        let mut rewriter = FilterRewriter::default();
        assert!(rewriter.rewrite_method(&mut module, method).unwrap());

        let rewritten = module.method(method).unwrap();
        let body = rewritten.body.as_ref().unwrap();
        assert!(!rewritten.has_filters());
        assert_eq!(body.exception_handlers.len(), 1);
        assert!(body.exception_handlers[0].is_catch());
        assert!(!body.opcodes().contains(&Opcode::Endfilter));

        let record = rewriter.closure(method).unwrap();
        assert_eq!(module.type_def(record.ty).unwrap().name, "__closure0");
        assert!(rewriter.events().has(EventKind::MethodRewritten));
        assert_eq!(rewriter.events().count_kind(EventKind::FilterExtracted), 1);
    }

    #[test]
    fn test_method_without_filters_is_skipped() {
        let (mut module, program) = program_module();
        let mut body = MethodBody::new();
        body.push(Instruction::simple(Opcode::LdcI40));
        body.push(Instruction::simple(Opcode::Ret));
        let method = static_method(&mut module, program, "Plain", vec![], body);

        let mut rewriter = FilterRewriter::default();
        assert!(!rewriter.rewrite_method(&mut module, method).unwrap());
        assert!(rewriter.events().is_empty());
    }

    #[test]
    fn test_generic_owner_needs_opt_in() {
        let (mut module, program) = program_module();
        let (body, _) = filter_body();
        let method = instance_method(&mut module, program, "Run", vec![TypeSig::I4], body);
        module.method_mut(method).unwrap().generic_params = vec!["T".to_string()];
        let types_before = module.types().count();

        let mut rewriter = FilterRewriter::default();
        let err = rewriter.rewrite_method(&mut module, method).unwrap_err();
        assert!(matches!(err, Error::Eligibility { .. }));
        assert_eq!(module.types().count(), types_before);
        assert!(module.method(method).unwrap().has_filters());

        let mut rewriter = FilterRewriter::new(RewriteConfig::default().with_generics(true));
        assert!(rewriter.rewrite_method(&mut module, method).unwrap());
    }

    #[test]
    fn test_sort_regions_innermost_first() {
        let mut body = MethodBody::new();
        let outer_try = body.push(Instruction::simple(Opcode::Nop));
        let inner_try = body.push(Instruction::simple(Opcode::Nop));
        let inner_handler = body.push(Instruction::simple(Opcode::Pop));
        let after_inner = body.push(Instruction::new(Opcode::Leave, Operand::Target(outer_try)));
        let outer_handler = body.push(Instruction::simple(Opcode::Pop));
        let end = body.push(Instruction::simple(Opcode::Ret));

        let object = Token(0x0100_0001);
        body.exception_handlers.push(ExceptionHandler::catch(
            outer_try,
            outer_handler,
            outer_handler,
            Some(end),
            object,
        ));
        body.exception_handlers.push(ExceptionHandler::catch(
            inner_try,
            inner_handler,
            inner_handler,
            Some(after_inner),
            object,
        ));

        sort_regions(&mut body).unwrap();
        assert_eq!(body.exception_handlers[0].try_start, inner_try);
        assert_eq!(body.exception_handlers[1].try_start, outer_try);
    }

    #[test]
    fn test_report_counts() {
        let report = RewriteReport {
            rewritten: vec![Token(0x0600_0001)],
            skipped: 2,
            failures: vec![MethodFailure {
                method: Token(0x0600_0002),
                name: "Demo.Program::Broken".to_string(),
                error: shape_error!("try range ends in ret"),
            }],
            events: EventLog::new(),
        };
        report.events.record(EventKind::FilterExtracted);
        report.events.record(EventKind::CatchExtracted);
        report.events.record(EventKind::CatchExtracted);

        assert_eq!(report.rewritten(), 1);
        assert_eq!(report.filters_extracted(), 1);
        assert_eq!(report.catches_extracted(), 2);
        assert_eq!(report.exit_code(), 1);
        assert!(!report.is_success());
        assert!(report.summary().starts_with("1 rewritten, 2 skipped, 1 failed"));
    }
}
