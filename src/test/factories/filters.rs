//! A single filtered try range, set up the way the rewriter sees it mid-method.

use crate::{
    assembly::{InstrId, Instruction, Opcode, Operand},
    metadata::{
        method::{ExceptionHandler, MethodBody},
        module::Module,
        signatures::{GenericContext, TypeSig},
        token::Token,
    },
    rewriter::{
        closure::{self, ClosureRecord},
        context::{FilterUnits, GroupHandler, HandlerGroup, NameCounters, RewriteContext},
        runtime::FilterRuntime,
        scanner, RewriteConfig,
    },
};

use super::{instance_method, program_module};

/// ```text
///       ldc.i4.0
///       stloc.0
/// try:  ldarg.1
///       stloc.0
///       leave RESUME
/// flt:  pop
///       ldarg.1
///       ldc.i4.0
///       cgt
///       endfilter
/// hnd:  pop
///       ldc.i4.m1
///       stloc.0
///       leave RESUME
/// RESUME:
///       ldloc.0
///       ret
/// ```
pub fn filter_body() -> (MethodBody, InstrId) {
    let mut body = MethodBody::new();
    body.add_local(TypeSig::I4).unwrap();
    let resume = body.alloc(Instruction::simple(Opcode::Ldloc0));

    body.push(Instruction::simple(Opcode::LdcI40));
    body.push(Instruction::simple(Opcode::Stloc0));
    let try_start = body.push(Instruction::simple(Opcode::Ldarg1));
    body.push(Instruction::simple(Opcode::Stloc0));
    let try_leave = body.push(Instruction::new(Opcode::Leave, Operand::Target(resume)));
    let filter_start = body.push(Instruction::simple(Opcode::Pop));
    body.push(Instruction::simple(Opcode::Ldarg1));
    body.push(Instruction::simple(Opcode::LdcI40));
    body.push(Instruction::simple(Opcode::Cgt));
    body.push(Instruction::simple(Opcode::Endfilter));
    let handler_start = body.push(Instruction::simple(Opcode::Pop));
    body.push(Instruction::simple(Opcode::LdcI4M1));
    body.push(Instruction::simple(Opcode::Stloc0));
    body.push(Instruction::new(Opcode::Leave, Operand::Target(resume)));
    body.append(resume);
    body.push(Instruction::simple(Opcode::Ret));

    body.exception_handlers.push(ExceptionHandler::filter(
        try_start,
        filter_start,
        filter_start,
        handler_start,
        Some(resume),
    ));
    (body, try_leave)
}

/// `Demo.Program::Run(int32 value)` with [`filter_body`], its body taken out of the module.
pub struct FilterFixture {
    pub module: Module,
    pub program: Token,
    pub method: Token,
    pub runtime: FilterRuntime,
    pub ctx: RewriteContext,
    pub body: MethodBody,
    pub try_leave: InstrId,
}

impl FilterFixture {
    pub fn new() -> Self {
        let (mut module, program) = program_module();
        let (body, try_leave) = filter_body();
        let method = instance_method(&mut module, program, "Run", vec![TypeSig::I4], body);
        let runtime = FilterRuntime::import(&mut module, &RewriteConfig::default());
        let body = module.method_mut(method).unwrap().body.take().unwrap();
        let ctx = RewriteContext::new(
            method,
            "Demo.Program::Run",
            GenericContext::default(),
            NameCounters::default(),
        );
        FilterFixture {
            module,
            program,
            method,
            runtime,
            ctx,
            body,
            try_leave,
        }
    }

    /// The group of the first region, as it currently stands in the body.
    pub fn group(&self, filter: Option<FilterUnits>) -> HandlerGroup {
        let region = self.body.exception_handlers[0].clone();
        HandlerGroup {
            try_start: region.try_start,
            try_end: region.try_end,
            exit: self.body.instr(self.try_leave).unwrap().target(),
            handlers: vec![GroupHandler {
                region,
                filter,
                catch: None,
            }],
        }
    }
}

/// Captures everything the first region's filter and handler use.
pub fn captured_record(fx: &mut FilterFixture) -> ClosureRecord {
    let region = fx.body.exception_handlers[0].clone();
    let positions = fx.body.positions();
    let last_of = |end: InstrId| fx.body.at(positions[&end] - 1).unwrap();

    let mut usage = scanner::scan(
        &fx.body,
        region.filter_start.unwrap(),
        last_of(region.handler_start),
        None,
    )
    .unwrap();
    usage.merge(
        scanner::scan(
            &fx.body,
            region.handler_start,
            last_of(region.handler_end.unwrap()),
            None,
        )
        .unwrap(),
    );
    closure::capture(
        &mut fx.module,
        &fx.runtime,
        &mut fx.ctx,
        &mut fx.body,
        None,
        &usage,
    )
    .unwrap()
}
