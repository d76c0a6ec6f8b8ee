//! Benchmarks for filter rewriting.
//!
//! Measures a full module run over synthetic methods:
//! - one filtered handler per method
//! - a filter sharing its try range with a typed catch
//! - many methods per module, to include counter and record bookkeeping

extern crate cilfilter;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use cilfilter::prelude::*;
use std::hint::black_box;

fn leave(target: InstrId) -> Instruction {
    Instruction::new(Opcode::Leave, Operand::Target(target))
}

/// `int Run(int value)` guarding `value` with a filter and, optionally, a typed catch.
fn filtered_body(typed: Option<Token>) -> MethodBody {
    let mut body = MethodBody::new();
    body.add_local(TypeSig::I4).unwrap();
    let resume = body.alloc(Instruction::simple(Opcode::Ldloc0));

    body.push(Instruction::simple(Opcode::LdcI40));
    body.push(Instruction::simple(Opcode::Stloc0));
    let try_start = body.push(Instruction::simple(Opcode::Ldarg1));
    body.push(Instruction::simple(Opcode::Stloc0));
    body.push(leave(resume));
    let filter_start = body.push(Instruction::simple(Opcode::Pop));
    body.push(Instruction::simple(Opcode::Ldarg1));
    body.push(Instruction::simple(Opcode::LdcI40));
    body.push(Instruction::simple(Opcode::Cgt));
    body.push(Instruction::simple(Opcode::Endfilter));
    let handler = body.push(Instruction::simple(Opcode::Pop));
    body.push(Instruction::simple(Opcode::LdcI4M1));
    body.push(Instruction::simple(Opcode::Stloc0));
    body.push(leave(resume));

    let second = typed.map(|catch_type| {
        let start = body.push(Instruction::simple(Opcode::Pop));
        body.push(Instruction::simple(Opcode::LdcI42));
        body.push(Instruction::simple(Opcode::Stloc0));
        body.push(leave(resume));
        (start, catch_type)
    });
    body.append(resume);
    body.push(Instruction::simple(Opcode::Ret));

    body.exception_handlers.push(ExceptionHandler::filter(
        try_start,
        filter_start,
        filter_start,
        handler,
        Some(second.map_or(resume, |(start, _)| start)),
    ));
    if let Some((start, catch_type)) = second {
        body.exception_handlers.push(ExceptionHandler::catch(
            try_start,
            filter_start,
            start,
            Some(resume),
            catch_type,
        ));
    }
    body
}

/// A module with `count` filtered methods on `Demo.Program`.
fn module_with(count: usize, typed: bool) -> Module {
    let mut module = Module::new("Bench.dll");
    let object = module.import_type("System.Runtime", "System", "Object");
    let catch_type = typed.then(|| module.import_type("System.Runtime", "System", "ArgumentException"));
    let program = module.add_type(
        TypeDef::new("Demo", "Program", TypeAttributes::PUBLIC).with_extends(object),
    );

    for index in 0..count {
        module
            .add_method(
                program,
                MethodDef::new(
                    format!("Run{index}"),
                    MethodAccessFlags::PUBLIC,
                    MethodModifiers::HIDE_BY_SIG,
                    TypeSig::I4,
                    vec![Parameter::new("value", TypeSig::I4)],
                )
                .with_body(filtered_body(catch_type)),
            )
            .unwrap();
    }
    module
}

/// Benchmark rewriting a single method with one filter.
fn bench_rewrite_single_filter(c: &mut Criterion) {
    c.bench_function("rewrite_single_filter", |b| {
        b.iter_batched(
            || module_with(1, false),
            |mut module| {
                let mut rewriter = FilterRewriter::new(RewriteConfig::default());
                let report = rewriter.rewrite_module(&mut module).unwrap();
                black_box(report)
            },
            BatchSize::SmallInput,
        );
    });
}

/// Benchmark rewriting a group of a filter and a typed catch.
fn bench_rewrite_mixed_group(c: &mut Criterion) {
    c.bench_function("rewrite_mixed_group", |b| {
        b.iter_batched(
            || module_with(1, true),
            |mut module| {
                let mut rewriter = FilterRewriter::new(RewriteConfig::default());
                let report = rewriter.rewrite_module(&mut module).unwrap();
                black_box(report)
            },
            BatchSize::SmallInput,
        );
    });
}

/// Benchmark a module of 100 filtered methods.
fn bench_rewrite_module_100(c: &mut Criterion) {
    c.bench_function("rewrite_module_100", |b| {
        b.iter_batched(
            || module_with(100, true),
            |mut module| {
                let mut rewriter = FilterRewriter::new(RewriteConfig::default());
                let report = rewriter.rewrite_module(&mut module).unwrap();
                black_box(report)
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    bench_rewrite_single_filter,
    bench_rewrite_mixed_group,
    bench_rewrite_module_100
);
criterion_main!(benches);
