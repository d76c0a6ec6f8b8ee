//! CIL opcodes (ECMA-335 Partition III) known to the rewriter.
//!
//! Each [`Opcode`] carries its encoded value, its operand encoding ([`OperandType`]) and its
//! control-flow behavior ([`FlowType`]). Two-byte opcodes that use the `0xFE` prefix store the
//! full 16-bit value (e.g. `ceq` = `0xFE01`).
//!
//! Mnemonics come from the strum derives, so `Opcode::LdlocS.to_string() == "ldloc.s"` and
//! `"leave".parse::<Opcode>()` yields [`Opcode::Leave`].
#![allow(missing_docs)]

use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::assembly::instruction::{FlowType, OperandType};

macro_rules! define_opcodes {
    ($( $name:ident = ($mnemonic:literal, $value:literal, $operand:ident, $flow:ident) ),* $(,)?) => {
        /// A CIL opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, EnumIter)]
        pub enum Opcode {
            $(
                #[strum(serialize = $mnemonic)]
                $name,
            )*
        }

        impl Opcode {
            /// Encoded opcode value, `0xFEnn` for two-byte opcodes.
            #[must_use]
            pub const fn value(self) -> u16 {
                match self {
                    $( Opcode::$name => $value, )*
                }
            }

            /// How the operand of this opcode is encoded.
            #[must_use]
            pub const fn operand_type(self) -> OperandType {
                match self {
                    $( Opcode::$name => OperandType::$operand, )*
                }
            }

            /// How this opcode affects control flow.
            #[must_use]
            pub const fn flow_type(self) -> FlowType {
                match self {
                    $( Opcode::$name => FlowType::$flow, )*
                }
            }
        }
    };
}

define_opcodes! {
    Nop = ("nop", 0x00, None, Sequential),
    Ldarg0 = ("ldarg.0", 0x02, None, Sequential),
    Ldarg1 = ("ldarg.1", 0x03, None, Sequential),
    Ldarg2 = ("ldarg.2", 0x04, None, Sequential),
    Ldarg3 = ("ldarg.3", 0x05, None, Sequential),
    Ldloc0 = ("ldloc.0", 0x06, None, Sequential),
    Ldloc1 = ("ldloc.1", 0x07, None, Sequential),
    Ldloc2 = ("ldloc.2", 0x08, None, Sequential),
    Ldloc3 = ("ldloc.3", 0x09, None, Sequential),
    Stloc0 = ("stloc.0", 0x0A, None, Sequential),
    Stloc1 = ("stloc.1", 0x0B, None, Sequential),
    Stloc2 = ("stloc.2", 0x0C, None, Sequential),
    Stloc3 = ("stloc.3", 0x0D, None, Sequential),
    LdargS = ("ldarg.s", 0x0E, ShortVariable, Sequential),
    LdargaS = ("ldarga.s", 0x0F, ShortVariable, Sequential),
    StargS = ("starg.s", 0x10, ShortVariable, Sequential),
    LdlocS = ("ldloc.s", 0x11, ShortVariable, Sequential),
    LdlocaS = ("ldloca.s", 0x12, ShortVariable, Sequential),
    StlocS = ("stloc.s", 0x13, ShortVariable, Sequential),
    Ldnull = ("ldnull", 0x14, None, Sequential),
    LdcI4M1 = ("ldc.i4.m1", 0x15, None, Sequential),
    LdcI40 = ("ldc.i4.0", 0x16, None, Sequential),
    LdcI41 = ("ldc.i4.1", 0x17, None, Sequential),
    LdcI42 = ("ldc.i4.2", 0x18, None, Sequential),
    LdcI43 = ("ldc.i4.3", 0x19, None, Sequential),
    LdcI44 = ("ldc.i4.4", 0x1A, None, Sequential),
    LdcI45 = ("ldc.i4.5", 0x1B, None, Sequential),
    LdcI46 = ("ldc.i4.6", 0x1C, None, Sequential),
    LdcI47 = ("ldc.i4.7", 0x1D, None, Sequential),
    LdcI48 = ("ldc.i4.8", 0x1E, None, Sequential),
    LdcI4S = ("ldc.i4.s", 0x1F, Int8, Sequential),
    LdcI4 = ("ldc.i4", 0x20, Int32, Sequential),
    LdcI8 = ("ldc.i8", 0x21, Int64, Sequential),
    LdcR4 = ("ldc.r4", 0x22, Float32, Sequential),
    LdcR8 = ("ldc.r8", 0x23, Float64, Sequential),
    Dup = ("dup", 0x25, None, Sequential),
    Pop = ("pop", 0x26, None, Sequential),
    Call = ("call", 0x28, Method, Call),
    Ret = ("ret", 0x2A, None, Return),
    BrS = ("br.s", 0x2B, ShortBranch, UnconditionalBranch),
    BrfalseS = ("brfalse.s", 0x2C, ShortBranch, ConditionalBranch),
    BrtrueS = ("brtrue.s", 0x2D, ShortBranch, ConditionalBranch),
    BeqS = ("beq.s", 0x2E, ShortBranch, ConditionalBranch),
    BgeS = ("bge.s", 0x2F, ShortBranch, ConditionalBranch),
    BgtS = ("bgt.s", 0x30, ShortBranch, ConditionalBranch),
    BleS = ("ble.s", 0x31, ShortBranch, ConditionalBranch),
    BltS = ("blt.s", 0x32, ShortBranch, ConditionalBranch),
    BneUnS = ("bne.un.s", 0x33, ShortBranch, ConditionalBranch),
    Br = ("br", 0x38, Branch, UnconditionalBranch),
    Brfalse = ("brfalse", 0x39, Branch, ConditionalBranch),
    Brtrue = ("brtrue", 0x3A, Branch, ConditionalBranch),
    Beq = ("beq", 0x3B, Branch, ConditionalBranch),
    Bge = ("bge", 0x3C, Branch, ConditionalBranch),
    Bgt = ("bgt", 0x3D, Branch, ConditionalBranch),
    Ble = ("ble", 0x3E, Branch, ConditionalBranch),
    Blt = ("blt", 0x3F, Branch, ConditionalBranch),
    BneUn = ("bne.un", 0x40, Branch, ConditionalBranch),
    Switch = ("switch", 0x45, Switch, Switch),
    Add = ("add", 0x58, None, Sequential),
    Sub = ("sub", 0x59, None, Sequential),
    Mul = ("mul", 0x5A, None, Sequential),
    Div = ("div", 0x5B, None, Sequential),
    Rem = ("rem", 0x5D, None, Sequential),
    And = ("and", 0x5F, None, Sequential),
    Or = ("or", 0x60, None, Sequential),
    Xor = ("xor", 0x61, None, Sequential),
    Shl = ("shl", 0x62, None, Sequential),
    Shr = ("shr", 0x63, None, Sequential),
    Neg = ("neg", 0x65, None, Sequential),
    Not = ("not", 0x66, None, Sequential),
    ConvI4 = ("conv.i4", 0x69, None, Sequential),
    ConvI8 = ("conv.i8", 0x6A, None, Sequential),
    ConvR8 = ("conv.r8", 0x6C, None, Sequential),
    Callvirt = ("callvirt", 0x6F, Method, Call),
    Ldstr = ("ldstr", 0x72, String, Sequential),
    Newobj = ("newobj", 0x73, Method, Call),
    Castclass = ("castclass", 0x74, Type, Sequential),
    Isinst = ("isinst", 0x75, Type, Sequential),
    Throw = ("throw", 0x7A, None, Throw),
    Ldfld = ("ldfld", 0x7B, Field, Sequential),
    Ldflda = ("ldflda", 0x7C, Field, Sequential),
    Stfld = ("stfld", 0x7D, Field, Sequential),
    Ldsfld = ("ldsfld", 0x7E, Field, Sequential),
    Stsfld = ("stsfld", 0x80, Field, Sequential),
    Box = ("box", 0x8C, Type, Sequential),
    Newarr = ("newarr", 0x8D, Type, Sequential),
    Ldlen = ("ldlen", 0x8E, None, Sequential),
    LdelemRef = ("ldelem.ref", 0x9A, None, Sequential),
    StelemRef = ("stelem.ref", 0xA2, None, Sequential),
    UnboxAny = ("unbox.any", 0xA5, Type, Sequential),
    Endfinally = ("endfinally", 0xDC, None, EndFinally),
    Leave = ("leave", 0xDD, Branch, Leave),
    LeaveS = ("leave.s", 0xDE, ShortBranch, Leave),
    Ceq = ("ceq", 0xFE01, None, Sequential),
    Cgt = ("cgt", 0xFE02, None, Sequential),
    Clt = ("clt", 0xFE04, None, Sequential),
    Ldarg = ("ldarg", 0xFE09, Variable, Sequential),
    Ldarga = ("ldarga", 0xFE0A, Variable, Sequential),
    Starg = ("starg", 0xFE0B, Variable, Sequential),
    Ldloc = ("ldloc", 0xFE0C, Variable, Sequential),
    Ldloca = ("ldloca", 0xFE0D, Variable, Sequential),
    Stloc = ("stloc", 0xFE0E, Variable, Sequential),
    Endfilter = ("endfilter", 0xFE11, None, EndFilter),
    Rethrow = ("rethrow", 0xFE1A, None, Throw),
}

/// How an opcode touches a local variable or an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableAccess {
    /// `ldloc*`
    LoadLocal,
    /// `stloc*`
    StoreLocal,
    /// `ldloca*`
    LoadLocalAddress,
    /// `ldarg*`
    LoadArgument,
    /// `starg*`
    StoreArgument,
    /// `ldarga*`
    LoadArgumentAddress,
}

impl VariableAccess {
    /// Returns `true` if the access targets the local variable table.
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(
            self,
            VariableAccess::LoadLocal | VariableAccess::StoreLocal | VariableAccess::LoadLocalAddress
        )
    }

    /// Returns `true` for stores.
    #[must_use]
    pub fn is_store(self) -> bool {
        matches!(self, VariableAccess::StoreLocal | VariableAccess::StoreArgument)
    }

    /// Returns `true` for address loads.
    #[must_use]
    pub fn is_address(self) -> bool {
        matches!(
            self,
            VariableAccess::LoadLocalAddress | VariableAccess::LoadArgumentAddress
        )
    }

    /// The same access against the other storage kind: a local load becomes an argument load
    /// and so on. Used when a local of one method becomes a parameter of another.
    #[must_use]
    pub fn with_storage(self, local: bool) -> Self {
        match (self, local) {
            (VariableAccess::LoadLocal | VariableAccess::LoadArgument, true) => {
                VariableAccess::LoadLocal
            }
            (VariableAccess::StoreLocal | VariableAccess::StoreArgument, true) => {
                VariableAccess::StoreLocal
            }
            (VariableAccess::LoadLocalAddress | VariableAccess::LoadArgumentAddress, true) => {
                VariableAccess::LoadLocalAddress
            }
            (VariableAccess::LoadLocal | VariableAccess::LoadArgument, false) => {
                VariableAccess::LoadArgument
            }
            (VariableAccess::StoreLocal | VariableAccess::StoreArgument, false) => {
                VariableAccess::StoreArgument
            }
            (VariableAccess::LoadLocalAddress | VariableAccess::LoadArgumentAddress, false) => {
                VariableAccess::LoadArgumentAddress
            }
        }
    }

    /// The long form opcode that performs this access with an explicit index operand.
    #[must_use]
    pub fn long_opcode(self) -> Opcode {
        match self {
            VariableAccess::LoadLocal => Opcode::Ldloc,
            VariableAccess::StoreLocal => Opcode::Stloc,
            VariableAccess::LoadLocalAddress => Opcode::Ldloca,
            VariableAccess::LoadArgument => Opcode::Ldarg,
            VariableAccess::StoreArgument => Opcode::Starg,
            VariableAccess::LoadArgumentAddress => Opcode::Ldarga,
        }
    }

    /// The smallest opcode that performs this access for `index`, and whether that opcode
    /// still needs the index as an operand.
    #[must_use]
    pub fn compact_opcode(self, index: u16) -> (Opcode, bool) {
        let numbered = match (self, index) {
            (VariableAccess::LoadLocal, 0) => Some(Opcode::Ldloc0),
            (VariableAccess::LoadLocal, 1) => Some(Opcode::Ldloc1),
            (VariableAccess::LoadLocal, 2) => Some(Opcode::Ldloc2),
            (VariableAccess::LoadLocal, 3) => Some(Opcode::Ldloc3),
            (VariableAccess::StoreLocal, 0) => Some(Opcode::Stloc0),
            (VariableAccess::StoreLocal, 1) => Some(Opcode::Stloc1),
            (VariableAccess::StoreLocal, 2) => Some(Opcode::Stloc2),
            (VariableAccess::StoreLocal, 3) => Some(Opcode::Stloc3),
            (VariableAccess::LoadArgument, 0) => Some(Opcode::Ldarg0),
            (VariableAccess::LoadArgument, 1) => Some(Opcode::Ldarg1),
            (VariableAccess::LoadArgument, 2) => Some(Opcode::Ldarg2),
            (VariableAccess::LoadArgument, 3) => Some(Opcode::Ldarg3),
            _ => None,
        };
        if let Some(opcode) = numbered {
            return (opcode, false);
        }

        if index <= u16::from(u8::MAX) {
            let short = match self {
                VariableAccess::LoadLocal => Opcode::LdlocS,
                VariableAccess::StoreLocal => Opcode::StlocS,
                VariableAccess::LoadLocalAddress => Opcode::LdlocaS,
                VariableAccess::LoadArgument => Opcode::LdargS,
                VariableAccess::StoreArgument => Opcode::StargS,
                VariableAccess::LoadArgumentAddress => Opcode::LdargaS,
            };
            return (short, true);
        }

        (self.long_opcode(), true)
    }
}

impl Opcode {
    /// Human-readable mnemonic, e.g. `"ldloc.s"`.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    /// Encoded size of the opcode itself (without operand).
    #[must_use]
    pub const fn size(self) -> u32 {
        if self.value() > 0xFF {
            2
        } else {
            1
        }
    }

    /// Returns the variable access this opcode performs and, for the numbered short forms
    /// (`ldloc.1`, `ldarg.0`, ...), the implicit index.
    #[must_use]
    pub fn variable_access(self) -> Option<(VariableAccess, Option<u16>)> {
        let access = match self {
            Opcode::Ldarg0 => (VariableAccess::LoadArgument, Some(0)),
            Opcode::Ldarg1 => (VariableAccess::LoadArgument, Some(1)),
            Opcode::Ldarg2 => (VariableAccess::LoadArgument, Some(2)),
            Opcode::Ldarg3 => (VariableAccess::LoadArgument, Some(3)),
            Opcode::LdargS | Opcode::Ldarg => (VariableAccess::LoadArgument, None),
            Opcode::LdargaS | Opcode::Ldarga => (VariableAccess::LoadArgumentAddress, None),
            Opcode::StargS | Opcode::Starg => (VariableAccess::StoreArgument, None),
            Opcode::Ldloc0 => (VariableAccess::LoadLocal, Some(0)),
            Opcode::Ldloc1 => (VariableAccess::LoadLocal, Some(1)),
            Opcode::Ldloc2 => (VariableAccess::LoadLocal, Some(2)),
            Opcode::Ldloc3 => (VariableAccess::LoadLocal, Some(3)),
            Opcode::LdlocS | Opcode::Ldloc => (VariableAccess::LoadLocal, None),
            Opcode::LdlocaS | Opcode::Ldloca => (VariableAccess::LoadLocalAddress, None),
            Opcode::Stloc0 => (VariableAccess::StoreLocal, Some(0)),
            Opcode::Stloc1 => (VariableAccess::StoreLocal, Some(1)),
            Opcode::Stloc2 => (VariableAccess::StoreLocal, Some(2)),
            Opcode::Stloc3 => (VariableAccess::StoreLocal, Some(3)),
            Opcode::StlocS | Opcode::Stloc => (VariableAccess::StoreLocal, None),
            _ => return None,
        };
        Some(access)
    }

    /// Maps a long-form branch to its short-form equivalent.
    #[must_use]
    pub fn short_branch_form(self) -> Option<Opcode> {
        let short = match self {
            Opcode::Br => Opcode::BrS,
            Opcode::Brfalse => Opcode::BrfalseS,
            Opcode::Brtrue => Opcode::BrtrueS,
            Opcode::Beq => Opcode::BeqS,
            Opcode::Bge => Opcode::BgeS,
            Opcode::Bgt => Opcode::BgtS,
            Opcode::Ble => Opcode::BleS,
            Opcode::Blt => Opcode::BltS,
            Opcode::BneUn => Opcode::BneUnS,
            Opcode::Leave => Opcode::LeaveS,
            _ => return None,
        };
        Some(short)
    }

    /// Maps a short-form branch to its long-form equivalent.
    #[must_use]
    pub fn long_branch_form(self) -> Option<Opcode> {
        let long = match self {
            Opcode::BrS => Opcode::Br,
            Opcode::BrfalseS => Opcode::Brfalse,
            Opcode::BrtrueS => Opcode::Brtrue,
            Opcode::BeqS => Opcode::Beq,
            Opcode::BgeS => Opcode::Bge,
            Opcode::BgtS => Opcode::Bgt,
            Opcode::BleS => Opcode::Ble,
            Opcode::BltS => Opcode::Blt,
            Opcode::BneUnS => Opcode::BneUn,
            Opcode::LeaveS => Opcode::Leave,
            _ => return None,
        };
        Some(long)
    }

    /// Returns `true` for `leave` and `leave.s`.
    #[must_use]
    pub fn is_leave(self) -> bool {
        matches!(self, Opcode::Leave | Opcode::LeaveS)
    }
}
