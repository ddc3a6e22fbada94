//! Typed register-machine IR.
//!
//! Every instruction is encoded as `[opcode u8][size u8][operands...]`, where `size` is the full
//! encoded length. See [`decode::Cursor`] for the reader and [`asm::IrAssembler`] for the writer.

pub mod asm;
pub mod decode;

use tbjit_types::{Address, Cond, MemOp, MemSize, Reg};

pub use asm::{IrAssembler, Label};
pub use decode::{decode_at, Cursor, DecodeError, Decoded};

/// Tag byte that introduces a 32-bit immediate in an `ri` operand slot.
pub const CONST_TAG: u8 = 0xff;

/// Size of the `[opcode][size]` header.
pub const HEADER_LEN: u32 = 2;

/// A register-or-immediate source operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Const(u32),
}

impl From<Reg> for Operand {
    fn from(reg: Reg) -> Self {
        Operand::Reg(reg)
    }
}

impl From<u32> for Operand {
    fn from(value: u32) -> Self {
        Operand::Const(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Rotl,
    Rotr,
    Div,
    Divu,
    Rem,
    Remu,
}

impl BinOp {
    /// Division family ops have no compiled lowering and always run in the interpreter.
    pub fn is_division(self) -> bool {
        matches!(self, BinOp::Div | BinOp::Divu | BinOp::Rem | BinOp::Remu)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnOp {
    Not,
    Neg,
    Ext8s,
    Ext16s,
    Ext8u,
    Ext16u,
}

/// Width and extension of a context-relative (`ld*`) load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostLoad {
    U8,
    S8,
    U16,
    S16,
    U32,
}

impl HostLoad {
    pub fn size(self) -> MemSize {
        match self {
            HostLoad::U8 | HostLoad::S8 => MemSize::U8,
            HostLoad::U16 | HostLoad::S16 => MemSize::U16,
            HostLoad::U32 => MemSize::U32,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, HostLoad::S8 | HostLoad::S16)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PairOp {
    Add,
    Sub,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrInst {
    Mov {
        dst: Reg,
        src: Operand,
    },
    Movi {
        dst: Reg,
        imm: u32,
    },
    Setcond {
        dst: Reg,
        cond: Cond,
        a: Operand,
        b: Operand,
    },
    /// 64-bit comparison of `(ah:al)` against `(bh:bl)`.
    Setcond2 {
        dst: Reg,
        cond: Cond,
        al: Operand,
        ah: Operand,
        bl: Operand,
        bh: Operand,
    },
    /// Context-relative load from `base + offset`.
    Ld {
        kind: HostLoad,
        dst: Reg,
        base: Operand,
        offset: i32,
    },
    /// Context-relative store to `base + offset`.
    St {
        size: MemSize,
        src: Operand,
        base: Operand,
        offset: i32,
    },
    Binary {
        op: BinOp,
        dst: Reg,
        a: Operand,
        b: Operand,
    },
    Unary {
        op: UnOp,
        dst: Reg,
        src: Operand,
    },
    /// 64-bit pair add/sub: `(hi:lo) = (ah:al) op (bh:bl)`.
    Pair {
        op: PairOp,
        lo: Reg,
        hi: Reg,
        al: Operand,
        ah: Operand,
        bl: Operand,
        bh: Operand,
    },
    /// Unsigned 32x32 multiply into `(hi:lo)`.
    Mulu2 {
        lo: Reg,
        hi: Reg,
        a: Operand,
        b: Operand,
    },
    Br {
        target: Address,
    },
    Brcond {
        cond: Cond,
        a: Operand,
        b: Operand,
        target: Address,
    },
    Brcond2 {
        cond: Cond,
        al: Operand,
        ah: Operand,
        bl: Operand,
        bh: Operand,
        target: Address,
    },
    /// Jump to `next_address + offset`.
    GotoTb {
        offset: i32,
    },
    ExitTb {
        code: u32,
    },
    /// Helper call-through; arguments come from the call-convention registers.
    Call {
        func: Operand,
    },
    GuestLd {
        dst: Reg,
        addr: Operand,
        op: MemOp,
    },
    GuestLd64 {
        lo: Reg,
        hi: Reg,
        addr: Operand,
        op: MemOp,
    },
    GuestSt {
        src: Operand,
        addr: Operand,
        op: MemOp,
    },
    GuestSt64 {
        lo: Operand,
        hi: Operand,
        addr: Operand,
        op: MemOp,
    },
    Mb,
}

impl IrInst {
    /// Whether control never falls through to the next instruction.
    pub fn is_unconditional_transfer(&self) -> bool {
        matches!(
            self,
            IrInst::Br { .. } | IrInst::GotoTb { .. } | IrInst::ExitTb { .. }
        )
    }

    /// Whether this instruction ends a basic block.
    pub fn ends_block(&self) -> bool {
        self.is_unconditional_transfer()
            || matches!(self, IrInst::Brcond { .. } | IrInst::Brcond2 { .. })
    }

    /// Explicit jump target of a branch, given the address of the following instruction.
    pub fn branch_target(&self, next_address: Address) -> Option<Address> {
        match *self {
            IrInst::Br { target }
            | IrInst::Brcond { target, .. }
            | IrInst::Brcond2 { target, .. } => Some(target),
            IrInst::GotoTb { offset } => Some(next_address.wrapping_add(offset as u32)),
            _ => None,
        }
    }
}

/// Opcode byte values.
pub mod opcode {
    pub const MOV: u8 = 0x01;
    pub const MOVI: u8 = 0x02;
    pub const SETCOND: u8 = 0x03;
    pub const SETCOND2: u8 = 0x04;

    pub const LD8U: u8 = 0x10;
    pub const LD8S: u8 = 0x11;
    pub const LD16U: u8 = 0x12;
    pub const LD16S: u8 = 0x13;
    pub const LD32: u8 = 0x14;
    pub const ST8: u8 = 0x18;
    pub const ST16: u8 = 0x19;
    pub const ST32: u8 = 0x1a;

    pub const ADD: u8 = 0x20;
    pub const SUB: u8 = 0x21;
    pub const MUL: u8 = 0x22;
    pub const AND: u8 = 0x23;
    pub const OR: u8 = 0x24;
    pub const XOR: u8 = 0x25;
    pub const SHL: u8 = 0x26;
    pub const SHR: u8 = 0x27;
    pub const SAR: u8 = 0x28;
    pub const ROTL: u8 = 0x29;
    pub const ROTR: u8 = 0x2a;
    pub const DIV: u8 = 0x30;
    pub const DIVU: u8 = 0x31;
    pub const REM: u8 = 0x32;
    pub const REMU: u8 = 0x33;

    pub const NOT: u8 = 0x38;
    pub const NEG: u8 = 0x39;
    pub const EXT8S: u8 = 0x3a;
    pub const EXT16S: u8 = 0x3b;
    pub const EXT8U: u8 = 0x3c;
    pub const EXT16U: u8 = 0x3d;

    pub const ADD2: u8 = 0x40;
    pub const SUB2: u8 = 0x41;
    pub const MULU2: u8 = 0x42;

    pub const BR: u8 = 0x50;
    pub const BRCOND: u8 = 0x51;
    pub const BRCOND2: u8 = 0x52;
    pub const GOTO_TB: u8 = 0x53;
    pub const EXIT_TB: u8 = 0x54;
    pub const CALL: u8 = 0x58;

    pub const GUEST_LD: u8 = 0x60;
    pub const GUEST_LD64: u8 = 0x61;
    pub const GUEST_ST: u8 = 0x62;
    pub const GUEST_ST64: u8 = 0x63;

    pub const MB: u8 = 0x70;
}

pub(crate) fn binop_opcode(op: BinOp) -> u8 {
    use opcode::*;
    match op {
        BinOp::Add => ADD,
        BinOp::Sub => SUB,
        BinOp::Mul => MUL,
        BinOp::And => AND,
        BinOp::Or => OR,
        BinOp::Xor => XOR,
        BinOp::Shl => SHL,
        BinOp::Shr => SHR,
        BinOp::Sar => SAR,
        BinOp::Rotl => ROTL,
        BinOp::Rotr => ROTR,
        BinOp::Div => DIV,
        BinOp::Divu => DIVU,
        BinOp::Rem => REM,
        BinOp::Remu => REMU,
    }
}

pub(crate) fn unop_opcode(op: UnOp) -> u8 {
    use opcode::*;
    match op {
        UnOp::Not => NOT,
        UnOp::Neg => NEG,
        UnOp::Ext8s => EXT8S,
        UnOp::Ext16s => EXT16S,
        UnOp::Ext8u => EXT8U,
        UnOp::Ext16u => EXT16U,
    }
}

impl IrInst {
    /// The opcode byte this instruction encodes to.
    pub fn opcode(&self) -> u8 {
        use opcode::*;
        match *self {
            IrInst::Mov { .. } => MOV,
            IrInst::Movi { .. } => MOVI,
            IrInst::Setcond { .. } => SETCOND,
            IrInst::Setcond2 { .. } => SETCOND2,
            IrInst::Ld { kind, .. } => match kind {
                HostLoad::U8 => LD8U,
                HostLoad::S8 => LD8S,
                HostLoad::U16 => LD16U,
                HostLoad::S16 => LD16S,
                HostLoad::U32 => LD32,
            },
            IrInst::St { size, .. } => match size {
                MemSize::U8 => ST8,
                MemSize::U16 => ST16,
                MemSize::U32 | MemSize::U64 => ST32,
            },
            IrInst::Binary { op, .. } => binop_opcode(op),
            IrInst::Unary { op, .. } => unop_opcode(op),
            IrInst::Pair { op: PairOp::Add, .. } => ADD2,
            IrInst::Pair { op: PairOp::Sub, .. } => SUB2,
            IrInst::Mulu2 { .. } => MULU2,
            IrInst::Br { .. } => BR,
            IrInst::Brcond { .. } => BRCOND,
            IrInst::Brcond2 { .. } => BRCOND2,
            IrInst::GotoTb { .. } => GOTO_TB,
            IrInst::ExitTb { .. } => EXIT_TB,
            IrInst::Call { .. } => CALL,
            IrInst::GuestLd { .. } => GUEST_LD,
            IrInst::GuestLd64 { .. } => GUEST_LD64,
            IrInst::GuestSt { .. } => GUEST_ST,
            IrInst::GuestSt64 { .. } => GUEST_ST64,
            IrInst::Mb => MB,
        }
    }
}
