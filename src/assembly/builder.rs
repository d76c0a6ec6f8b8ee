//! Fluent instruction assembler with forward labels.
//!
//! [`InstructionAssembler`] allocates instructions into a body's arena and resolves labels to
//! instruction handles. It does not place anything in the code sequence: the finished list of
//! handles is either spliced into existing code by [`crate::rewriter::editor`] or appended to a
//! fresh body with [`InstructionAssembler::append_to_body`].
//!
//! Every emission checks the operand against the opcode, so malformed synthesized code is
//! reported where it is produced rather than by the validator.
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilfilter::assembly::{InstructionAssembler, Opcode};
//! use cilfilter::metadata::method::MethodBody;
//!
//! let mut body = MethodBody::new();
//! let mut asm = InstructionAssembler::new(&mut body);
//! let done = asm.new_label();
//! asm.ldarg(0)?
//!     .branch(Opcode::Brfalse, done)?
//!     .ldc_i4(1)?
//!     .op(Opcode::Pop)?;
//! asm.bind(done)?;
//! asm.op(Opcode::Ret)?;
//! asm.append_to_body()?;
//! assert_eq!(body.len(), 5);
//! # Ok::<(), cilfilter::Error>(())
//! ```

use crate::{
    assembly::{
        instruction::{InstrId, Instruction, Operand},
        opcodes::{Opcode, VariableAccess},
    },
    metadata::{method::MethodBody, token::Token},
    Error, Result,
};

/// A forward reference to an instruction that has not been emitted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

enum Fixup {
    Branch(InstrId, Label),
    Switch(InstrId, usize, Label),
}

/// Builds instruction sequences inside a body's arena.
pub struct InstructionAssembler<'a> {
    body: &'a mut MethodBody,
    emitted: Vec<InstrId>,
    labels: Vec<Option<InstrId>>,
    unbound: Vec<Label>,
    fixups: Vec<Fixup>,
}

const PENDING: InstrId = InstrId(u32::MAX);

impl<'a> InstructionAssembler<'a> {
    /// Creates an assembler allocating into `body`.
    pub fn new(body: &'a mut MethodBody) -> Self {
        InstructionAssembler {
            body,
            emitted: Vec::new(),
            labels: Vec::new(),
            unbound: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Creates a new, unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next emitted instruction.
    ///
    /// # Errors
    /// Returns [`Error::Consistency`] if the label is already bound.
    pub fn bind(&mut self, label: Label) -> Result<&mut Self> {
        if self.labels[label.0].is_some() || self.unbound.contains(&label) {
            return Err(consistency_error!("Label {} bound twice", label.0));
        }
        self.unbound.push(label);
        Ok(self)
    }

    /// Binds `label` to an existing instruction, typically one outside the emitted sequence.
    ///
    /// # Errors
    /// Returns [`Error::Consistency`] if the label is already bound.
    pub fn bind_to(&mut self, label: Label, target: InstrId) -> Result<&mut Self> {
        if self.labels[label.0].is_some() || self.unbound.contains(&label) {
            return Err(consistency_error!("Label {} bound twice", label.0));
        }
        self.labels[label.0] = Some(target);
        Ok(self)
    }

    /// Emits an instruction.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if the operand does not fit the opcode.
    pub fn emit(&mut self, instruction: Instruction) -> Result<&mut Self> {
        if !instruction.fits() {
            return Err(Error::InvalidOperand {
                opcode: instruction.opcode.mnemonic(),
                expected: instruction.opcode.operand_type().describe(),
            });
        }

        let id = self.body.alloc(instruction);
        self.emitted.push(id);
        for label in self.unbound.drain(..) {
            self.labels[label.0] = Some(id);
        }
        Ok(self)
    }

    /// Emits an instruction without operand.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if the opcode requires an operand.
    pub fn op(&mut self, opcode: Opcode) -> Result<&mut Self> {
        self.emit(Instruction::simple(opcode))
    }

    /// Emits a branch or leave to `label`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if `opcode` is not a branch.
    pub fn branch(&mut self, opcode: Opcode, label: Label) -> Result<&mut Self> {
        self.emit(Instruction::new(opcode, Operand::Target(PENDING)))?;
        let id = self.last_emitted()?;
        self.fixups.push(Fixup::Branch(id, label));
        Ok(self)
    }

    /// Emits a branch or leave to an existing instruction.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if `opcode` is not a branch.
    pub fn branch_to(&mut self, opcode: Opcode, target: InstrId) -> Result<&mut Self> {
        self.emit(Instruction::new(opcode, Operand::Target(target)))
    }

    /// Emits a `switch` over `labels`.
    ///
    /// # Errors
    /// Returns [`Error::Consistency`] for an empty table.
    pub fn switch(&mut self, labels: &[Label]) -> Result<&mut Self> {
        if labels.is_empty() {
            return Err(consistency_error!("Switch without targets"));
        }
        self.emit(Instruction::new(
            Opcode::Switch,
            Operand::Switch(vec![PENDING; labels.len()]),
        ))?;
        let id = self.last_emitted()?;
        for (slot, label) in labels.iter().enumerate() {
            self.fixups.push(Fixup::Switch(id, slot, *label));
        }
        Ok(self)
    }

    fn variable(&mut self, access: VariableAccess, index: u16) -> Result<&mut Self> {
        self.emit(Instruction::variable_access(access, index))
    }

    /// Loads argument `index`.
    ///
    /// # Errors
    /// Never fails in practice; the operand always fits the chosen form.
    pub fn ldarg(&mut self, index: u16) -> Result<&mut Self> {
        self.variable(VariableAccess::LoadArgument, index)
    }

    /// Loads the address of argument `index`.
    ///
    /// # Errors
    /// Never fails in practice; the operand always fits the chosen form.
    pub fn ldarga(&mut self, index: u16) -> Result<&mut Self> {
        self.variable(VariableAccess::LoadArgumentAddress, index)
    }

    /// Stores into argument `index`.
    ///
    /// # Errors
    /// Never fails in practice; the operand always fits the chosen form.
    pub fn starg(&mut self, index: u16) -> Result<&mut Self> {
        self.variable(VariableAccess::StoreArgument, index)
    }

    /// Loads local `index`.
    ///
    /// # Errors
    /// Never fails in practice; the operand always fits the chosen form.
    pub fn ldloc(&mut self, index: u16) -> Result<&mut Self> {
        self.variable(VariableAccess::LoadLocal, index)
    }

    /// Loads the address of local `index`.
    ///
    /// # Errors
    /// Never fails in practice; the operand always fits the chosen form.
    pub fn ldloca(&mut self, index: u16) -> Result<&mut Self> {
        self.variable(VariableAccess::LoadLocalAddress, index)
    }

    /// Stores into local `index`.
    ///
    /// # Errors
    /// Never fails in practice; the operand always fits the chosen form.
    pub fn stloc(&mut self, index: u16) -> Result<&mut Self> {
        self.variable(VariableAccess::StoreLocal, index)
    }

    /// Loads an `int32` constant using the smallest encoding.
    ///
    /// # Errors
    /// Never fails in practice; the operand always fits the chosen form.
    pub fn ldc_i4(&mut self, value: i32) -> Result<&mut Self> {
        self.emit(Instruction::ldc_i4(value))
    }

    /// Emits an instruction with a field operand (`ldfld`, `ldflda`, `stfld`, ...).
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if `opcode` does not take a field.
    pub fn field(&mut self, opcode: Opcode, field: Token) -> Result<&mut Self> {
        self.emit(Instruction::new(opcode, Operand::Field(field)))
    }

    /// Emits an instruction with a method operand (`call`, `callvirt`, `newobj`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if `opcode` does not take a method.
    pub fn method(&mut self, opcode: Opcode, method: Token) -> Result<&mut Self> {
        self.emit(Instruction::new(opcode, Operand::Method(method)))
    }

    /// Emits an instruction with a type operand (`isinst`, `castclass`, ...).
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if `opcode` does not take a type.
    pub fn ty(&mut self, opcode: Opcode, ty: Token) -> Result<&mut Self> {
        self.emit(Instruction::new(opcode, Operand::Type(ty)))
    }

    /// Handle of the most recently emitted instruction.
    ///
    /// # Errors
    /// Returns [`Error::Consistency`] if nothing was emitted yet.
    pub fn last_emitted(&self) -> Result<InstrId> {
        self.emitted
            .last()
            .copied()
            .ok_or_else(|| consistency_error!("No instruction emitted yet"))
    }

    /// Instruction a label was bound to, if any.
    #[must_use]
    pub fn label_target(&self, label: Label) -> Option<InstrId> {
        self.labels.get(label.0).copied().flatten()
    }

    fn resolve(&mut self) -> Result<()> {
        if !self.unbound.is_empty() {
            return Err(Error::UndefinedLabel);
        }

        for fixup in &self.fixups {
            let (id, label) = match fixup {
                Fixup::Branch(id, label) | Fixup::Switch(id, _, label) => (*id, *label),
            };
            let target = self.labels[label.0].ok_or(Error::UndefinedLabel)?;
            match (fixup, &mut self.body.instr_mut(id)?.operand) {
                (Fixup::Branch(..), Operand::Target(slot)) => *slot = target,
                (Fixup::Switch(_, index, _), Operand::Switch(slots)) => slots[*index] = target,
                _ => return Err(consistency_error!("Fixup does not match operand of {}", id)),
            }
        }
        Ok(())
    }

    /// Resolves every label reference and returns the emitted handles in order.
    ///
    /// # Errors
    /// Returns [`Error::UndefinedLabel`] if a referenced label was never bound or was bound
    /// after the last emitted instruction.
    pub fn finish(mut self) -> Result<Vec<InstrId>> {
        self.resolve()?;
        Ok(self.emitted)
    }

    /// Finishes and appends the emitted instructions to the end of the body's code.
    ///
    /// # Errors
    /// See [`InstructionAssembler::finish`].
    pub fn append_to_body(mut self) -> Result<Vec<InstrId>> {
        self.resolve()?;
        self.body.code_mut().extend(self.emitted.iter().copied());
        Ok(self.emitted)
    }
}
