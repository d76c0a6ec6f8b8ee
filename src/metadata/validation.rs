//! Structural validation of method bodies.
//!
//! The rewriter runs [`BodyValidator`] on every body it touched before the method is
//! committed. The checks mirror what bytecode verification would reject at load time:
//!
//! - every instruction in the sequence is allocated and appears once
//! - operands fit their opcode, tokens resolve to the right table
//! - branch targets and region boundaries are placed in the sequence
//! - local and argument indices are in range
//! - regions are ordered, well nested and filters end with `endfilter`
//! - control does not fall off the end of the body
//!
//! All violations are reported as [`crate::Error::Consistency`].

use std::collections::HashMap;

use crate::{
    assembly::{FlowType, InstrId, Opcode, Operand},
    metadata::{
        method::{ExceptionHandler, MethodBody, MethodDef},
        module::{MemberSig, Module},
        token::{TableId, Token},
    },
    Result,
};

/// Validates bodies against the module they live in.
pub struct BodyValidator<'a> {
    module: &'a Module,
}

impl<'a> BodyValidator<'a> {
    /// Creates a validator for bodies of `module`.
    #[must_use]
    pub fn new(module: &'a Module) -> Self {
        BodyValidator { module }
    }

    /// Validates the body of a method of the module. Methods without body always pass.
    ///
    /// # Errors
    /// Returns [`crate::Error::TokenNotFound`] for unknown methods and
    /// [`crate::Error::Consistency`] describing the first violation found.
    pub fn validate_method(&self, token: Token) -> Result<()> {
        let method = self.module.method(token)?;
        match &method.body {
            Some(body) => self.validate_body(method, body),
            None => Ok(()),
        }
    }

    /// Validates `body` as the body of `method`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Consistency`] describing the first violation found.
    pub fn validate_body(&self, method: &MethodDef, body: &MethodBody) -> Result<()> {
        let positions = self.check_sequence(body)?;
        self.check_instructions(method, body, &positions)?;
        self.check_regions(body, &positions)?;
        Ok(())
    }

    fn check_sequence(&self, body: &MethodBody) -> Result<HashMap<InstrId, usize>> {
        let mut positions = HashMap::with_capacity(body.len());
        for (position, id) in body.code().iter().enumerate() {
            if body.get(*id).is_none() {
                return Err(consistency_error!("Instruction {} is not allocated", id));
            }
            if positions.insert(*id, position).is_some() {
                return Err(consistency_error!(
                    "Instruction {} appears twice in the body",
                    id
                ));
            }
        }

        match body.code().last().and_then(|id| body.get(*id)) {
            Some(last) if last.is_terminal() => Ok(positions),
            Some(last) => Err(consistency_error!(
                "Control falls off the end of the body after '{}'",
                last
            )),
            None => Err(consistency_error!("Body is empty")),
        }
    }

    fn check_instructions(
        &self,
        method: &MethodDef,
        body: &MethodBody,
        positions: &HashMap<InstrId, usize>,
    ) -> Result<()> {
        for (id, instruction) in body.iter() {
            if !instruction.fits() {
                return Err(consistency_error!(
                    "Operand of {} '{}' does not fit its opcode",
                    id,
                    instruction
                ));
            }

            for target in instruction.operand.targets() {
                if !positions.contains_key(&target) {
                    return Err(consistency_error!(
                        "Instruction {} '{}' references {} which is not in the body",
                        id,
                        instruction,
                        target
                    ));
                }
            }

            match instruction.variable() {
                Some((access, index)) if access.is_local() => {
                    if usize::from(index) >= body.locals.len() {
                        return Err(consistency_error!(
                            "Local {} out of range at {} ({} locals)",
                            index,
                            id,
                            body.locals.len()
                        ));
                    }
                }
                Some((_, index)) => {
                    if index >= method.arg_count() {
                        return Err(consistency_error!(
                            "Argument {} out of range at {} ({} arguments)",
                            index,
                            id,
                            method.arg_count()
                        ));
                    }
                }
                None => {}
            }

            self.check_token(instruction.opcode, &instruction.operand)?;
        }
        Ok(())
    }

    fn check_token(&self, opcode: Opcode, operand: &Operand) -> Result<()> {
        let (token, allowed): (Token, &[TableId]) = match operand {
            Operand::Type(token) => (
                *token,
                &[TableId::TypeDef, TableId::TypeRef, TableId::TypeSpec],
            ),
            Operand::Field(token) => (*token, &[TableId::Field, TableId::MemberRef]),
            Operand::Method(token) => (*token, &[TableId::MethodDef, TableId::MemberRef]),
            _ => return Ok(()),
        };

        if !allowed.iter().any(|table| token.is(*table)) || !self.module.resolves(token) {
            return Err(consistency_error!(
                "Token {} of '{}' does not resolve to a valid row",
                token,
                opcode
            ));
        }

        if token.is(TableId::MemberRef) {
            let member = self.module.member_ref_def(token)?;
            let is_field = matches!(member.signature, MemberSig::Field(_));
            if is_field != matches!(operand, Operand::Field(_)) {
                return Err(consistency_error!(
                    "Member reference {} has the wrong kind for '{}'",
                    member.name,
                    opcode
                ));
            }
        }
        Ok(())
    }

    fn check_regions(&self, body: &MethodBody, positions: &HashMap<InstrId, usize>) -> Result<()> {
        let place = |id: InstrId| {
            positions
                .get(&id)
                .copied()
                .ok_or_else(|| consistency_error!("Region boundary {} is not in the body", id))
        };

        let mut extents = Vec::with_capacity(body.exception_handlers.len());
        for (index, handler) in body.exception_handlers.iter().enumerate() {
            let try_start = place(handler.try_start)?;
            let try_end = place(handler.try_end)?;
            let handler_start = place(handler.handler_start)?;
            let handler_end = match handler.handler_end {
                Some(end) => place(end)?,
                None => body.len(),
            };

            if try_start >= try_end || handler_start >= handler_end {
                return Err(consistency_error!("Region {} has an empty range", index));
            }
            if handler_start < try_end {
                return Err(consistency_error!(
                    "Region {} handler starts inside its try range",
                    index
                ));
            }

            self.check_region_kind(body, index, handler, try_end, handler_start, positions)?;

            extents.push((try_start, try_end, handler_end));
        }

        // Regions sharing a try range are siblings; any other pair is disjoint or nested,
        // and a nested region is listed before the one enclosing it.
        for (i, outer) in extents.iter().enumerate() {
            for (j, inner) in extents.iter().enumerate().skip(i + 1) {
                if (outer.0, outer.1) == (inner.0, inner.1) {
                    continue;
                }
                let (outer_start, outer_end) = (outer.0, outer.2);
                let (inner_start, inner_end) = (inner.0, inner.2);
                if inner_end <= outer_start || outer_end <= inner_start {
                    continue;
                }
                if outer_start <= inner_start && inner_end <= outer_end {
                    return Err(consistency_error!(
                        "Region {} encloses region {} but is listed before it",
                        i,
                        j
                    ));
                }
                if !(inner_start <= outer_start && outer_end <= inner_end) {
                    return Err(consistency_error!(
                        "Regions {} and {} overlap without nesting",
                        i,
                        j
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_region_kind(
        &self,
        body: &MethodBody,
        index: usize,
        handler: &ExceptionHandler,
        try_end: usize,
        handler_start: usize,
        positions: &HashMap<InstrId, usize>,
    ) -> Result<()> {
        if handler.is_filter() {
            let filter_start = handler
                .filter_start
                .ok_or_else(|| consistency_error!("Filter region {} has no filter start", index))?;
            let filter_start = positions.get(&filter_start).copied().ok_or_else(|| {
                consistency_error!("Filter start of region {} is not in the body", index)
            })?;
            if filter_start < try_end || filter_start >= handler_start {
                return Err(consistency_error!(
                    "Filter of region {} is not between try and handler",
                    index
                ));
            }
            let last = body
                .at(handler_start - 1)
                .and_then(|id| body.get(id))
                .map(|instruction| instruction.flow_type());
            if last != Some(FlowType::EndFilter) {
                return Err(consistency_error!(
                    "Filter of region {} does not end with endfilter",
                    index
                ));
            }
            return Ok(());
        }

        if handler.filter_start.is_some() {
            return Err(consistency_error!(
                "Non-filter region {} has a filter start",
                index
            ));
        }
        if handler.is_catch() {
            match handler.catch_type {
                Some(token) if self.module.resolves(token) => {}
                _ => {
                    return Err(consistency_error!(
                        "Catch region {} has no resolvable catch type",
                        index
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Instruction,
        metadata::{
            method::{MethodAccessFlags, MethodModifiers},
            signatures::TypeSig,
            typedef::{TypeAttributes, TypeDef},
        },
    };

    fn setup(body: MethodBody) -> (Module, Token) {
        let mut module = Module::new("Demo.dll");
        let object = module.import_type("System.Runtime", "System", "Object");
        let program =
            module.add_type(TypeDef::new("Demo", "Program", TypeAttributes::PUBLIC).with_extends(object));
        let method = module
            .add_method(
                program,
                MethodDef::new(
                    "Run",
                    MethodAccessFlags::PUBLIC,
                    MethodModifiers::STATIC,
                    TypeSig::Void,
                    vec![],
                )
                .with_body(body),
            )
            .unwrap();
        (module, method)
    }

    #[test]
    fn test_valid_filter_body() {
        let mut body = MethodBody::new();
        let exit = body.alloc(Instruction::simple(Opcode::Ret));
        let try_start = body.push(Instruction::nop());
        body.push(Instruction::new(Opcode::Leave, Operand::Target(exit)));
        let filter_start = body.push(Instruction::simple(Opcode::Pop));
        body.push(Instruction::simple(Opcode::LdcI41));
        body.push(Instruction::simple(Opcode::Endfilter));
        let handler_start = body.push(Instruction::simple(Opcode::Pop));
        body.push(Instruction::new(Opcode::Leave, Operand::Target(exit)));
        body.append(exit);
        body.exception_handlers.push(ExceptionHandler::filter(
            try_start,
            filter_start,
            filter_start,
            handler_start,
            Some(exit),
        ));

        let (module, method) = setup(body);
        BodyValidator::new(&module).validate_method(method).unwrap();
    }

    #[test]
    fn test_dangling_target() {
        let mut body = MethodBody::new();
        let orphan = body.alloc(Instruction::simple(Opcode::Ret));
        body.push(Instruction::new(Opcode::Br, Operand::Target(orphan)));
        let (module, method) = setup(body);
        let err = BodyValidator::new(&module).validate_method(method).unwrap_err();
        assert!(err.is_consistency());
        assert!(err.to_string().contains("not in the body"));
    }

    #[test]
    fn test_bad_indices() {
        let mut body = MethodBody::new();
        body.push(Instruction::simple(Opcode::Ldloc0));
        body.push(Instruction::simple(Opcode::Ret));
        let (module, method) = setup(body);
        assert!(BodyValidator::new(&module).validate_method(method).is_err());

        let mut body = MethodBody::new();
        body.push(Instruction::new(Opcode::LdargS, Operand::Argument(0)));
        body.push(Instruction::simple(Opcode::Ret));
        let (module, method) = setup(body);
        let err = BodyValidator::new(&module).validate_method(method).unwrap_err();
        assert!(err.to_string().contains("Argument 0 out of range"));
    }

    #[test]
    fn test_unresolved_token_and_falloff() {
        let mut body = MethodBody::new();
        body.push(Instruction::new(Opcode::Call, Operand::Method(Token(0x0600_0042))));
        body.push(Instruction::simple(Opcode::Ret));
        let (module, method) = setup(body);
        assert!(BodyValidator::new(&module).validate_method(method).is_err());

        let mut body = MethodBody::new();
        body.push(Instruction::nop());
        let (module, method) = setup(body);
        let err = BodyValidator::new(&module).validate_method(method).unwrap_err();
        assert!(err.to_string().contains("falls off"));
    }

    #[test]
    fn test_filter_without_endfilter() {
        let mut body = MethodBody::new();
        let exit = body.alloc(Instruction::simple(Opcode::Ret));
        let try_start = body.push(Instruction::new(Opcode::Leave, Operand::Target(exit)));
        let filter_start = body.push(Instruction::simple(Opcode::Pop));
        let handler_start = body.push(Instruction::simple(Opcode::Pop));
        body.push(Instruction::new(Opcode::Leave, Operand::Target(exit)));
        body.append(exit);
        body.exception_handlers.push(ExceptionHandler::filter(
            try_start,
            filter_start,
            filter_start,
            handler_start,
            Some(exit),
        ));
        let (module, method) = setup(body);
        let err = BodyValidator::new(&module).validate_method(method).unwrap_err();
        assert!(err.to_string().contains("endfilter"));
    }
}
