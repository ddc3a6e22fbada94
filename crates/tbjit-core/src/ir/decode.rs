//! Cursor-based decoder over an immutable IR byte buffer.

use tbjit_types::{Address, Cond, MemOp, MemSize, Reg};
use thiserror::Error;

use super::opcode::*;
use super::{BinOp, HostLoad, IrInst, Operand, PairOp, UnOp, CONST_TAG, HEADER_LEN};
use crate::machine::CodeBus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode {opcode:#04x} at {address:#x}")]
    UnknownOpcode { address: Address, opcode: u8 },
    #[error("instruction at {address:#x} is truncated")]
    Truncated { address: Address },
    #[error("instruction at {address:#x} declares size {declared} but its operands need {needed}")]
    SizeMismatch {
        address: Address,
        declared: u8,
        needed: u32,
    },
    #[error("invalid register index {index} at {address:#x}")]
    BadRegister { address: Address, index: u8 },
    #[error("invalid condition code {code} at {address:#x}")]
    BadCondition { address: Address, code: u8 },
    #[error("invalid memop {raw:#x} at {address:#x}")]
    BadMemOp { address: Address, raw: u32 },
}

/// One decoded instruction and where it came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub address: Address,
    pub len: u32,
    pub inst: IrInst,
}

impl Decoded {
    #[inline]
    pub fn next_address(&self) -> Address {
        self.address.wrapping_add(self.len)
    }

    pub fn branch_target(&self) -> Option<Address> {
        self.inst.branch_target(self.next_address())
    }
}

/// Sequential reader over `bytes`, whose first byte lives at guest address `base`.
#[derive(Clone, Debug)]
pub struct Cursor<'a> {
    base: Address,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(base: Address, bytes: &'a [u8]) -> Self {
        Self {
            base,
            bytes,
            pos: 0,
        }
    }

    /// Guest address of the next instruction.
    pub fn address(&self) -> Address {
        self.base.wrapping_add(self.pos as u32)
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn decode_next(&mut self) -> Result<Decoded, DecodeError> {
        let address = self.address();
        let rest = &self.bytes[self.pos.min(self.bytes.len())..];
        if rest.len() < HEADER_LEN as usize {
            return Err(DecodeError::Truncated { address });
        }
        let (opcode, size) = (rest[0], rest[1]);
        if (size as u32) < HEADER_LEN || size as usize > rest.len() {
            return Err(DecodeError::Truncated { address });
        }

        let mut ops = Operands {
            address,
            bytes: &rest[HEADER_LEN as usize..size as usize],
            pos: 0,
            declared: size,
        };
        let inst = decode_operands(opcode, &mut ops)?;
        ops.finish()?;

        self.pos += size as usize;
        Ok(Decoded {
            address,
            len: size as u32,
            inst,
        })
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<Decoded, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_at_end() {
            return None;
        }
        let item = self.decode_next();
        if item.is_err() {
            // Stop after the first error; the stream position is unknown past it.
            self.pos = self.bytes.len();
        }
        Some(item)
    }
}

/// Decode the single instruction at `address` from `bus`.
pub fn decode_at<B: CodeBus + ?Sized>(bus: &B, address: Address) -> Result<Decoded, DecodeError> {
    let truncated = DecodeError::Truncated { address };
    let size = bus
        .read_u8(address.wrapping_add(1))
        .ok_or_else(|| truncated.clone())?;
    if (size as u32) < HEADER_LEN {
        return Err(truncated);
    }
    let bytes = bus.fetch(address, size as u32).ok_or(truncated)?;
    Cursor::new(address, &bytes).decode_next()
}

struct Operands<'a> {
    address: Address,
    bytes: &'a [u8],
    pos: usize,
    declared: u8,
}

impl Operands<'_> {
    fn overrun(&self, extra: usize) -> DecodeError {
        DecodeError::SizeMismatch {
            address: self.address,
            declared: self.declared,
            needed: HEADER_LEN + (self.pos + extra) as u32,
        }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or_else(|| self.overrun(1))?;
        self.pos += 1;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let chunk = self
            .bytes
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| self.overrun(4))?;
        self.pos += 4;
        Ok(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        self.u32().map(|v| v as i32)
    }

    fn reg(&mut self) -> Result<Reg, DecodeError> {
        let index = self.u8()?;
        Reg::new(index).ok_or(DecodeError::BadRegister {
            address: self.address,
            index,
        })
    }

    fn ri(&mut self) -> Result<Operand, DecodeError> {
        let tag = self.u8()?;
        if tag == CONST_TAG {
            return self.u32().map(Operand::Const);
        }
        Reg::new(tag).map(Operand::Reg).ok_or(DecodeError::BadRegister {
            address: self.address,
            index: tag,
        })
    }

    fn cond(&mut self) -> Result<Cond, DecodeError> {
        let code = self.u8()?;
        Cond::from_u8(code).ok_or(DecodeError::BadCondition {
            address: self.address,
            code,
        })
    }

    fn memop(&mut self, allow_u64: bool) -> Result<MemOp, DecodeError> {
        let raw = self.u32()?;
        let bad = DecodeError::BadMemOp {
            address: self.address,
            raw,
        };
        let op = MemOp::decode(raw).ok_or_else(|| bad.clone())?;
        if op.size == MemSize::U64 && !allow_u64 {
            return Err(bad);
        }
        Ok(op)
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.pos != self.bytes.len() {
            return Err(DecodeError::SizeMismatch {
                address: self.address,
                declared: self.declared,
                needed: HEADER_LEN + self.pos as u32,
            });
        }
        Ok(())
    }
}

fn binary(op: BinOp, r: &mut Operands<'_>) -> Result<IrInst, DecodeError> {
    Ok(IrInst::Binary {
        op,
        dst: r.reg()?,
        a: r.ri()?,
        b: r.ri()?,
    })
}

fn unary(op: UnOp, r: &mut Operands<'_>) -> Result<IrInst, DecodeError> {
    Ok(IrInst::Unary {
        op,
        dst: r.reg()?,
        src: r.ri()?,
    })
}

fn host_load(kind: HostLoad, r: &mut Operands<'_>) -> Result<IrInst, DecodeError> {
    Ok(IrInst::Ld {
        kind,
        dst: r.reg()?,
        base: r.ri()?,
        offset: r.i32()?,
    })
}

fn host_store(size: MemSize, r: &mut Operands<'_>) -> Result<IrInst, DecodeError> {
    Ok(IrInst::St {
        size,
        src: r.ri()?,
        base: r.ri()?,
        offset: r.i32()?,
    })
}

fn pair(op: PairOp, r: &mut Operands<'_>) -> Result<IrInst, DecodeError> {
    Ok(IrInst::Pair {
        op,
        lo: r.reg()?,
        hi: r.reg()?,
        al: r.ri()?,
        ah: r.ri()?,
        bl: r.ri()?,
        bh: r.ri()?,
    })
}

fn decode_operands(opcode: u8, r: &mut Operands<'_>) -> Result<IrInst, DecodeError> {
    let inst = match opcode {
        MOV => IrInst::Mov {
            dst: r.reg()?,
            src: r.ri()?,
        },
        MOVI => IrInst::Movi {
            dst: r.reg()?,
            imm: r.u32()?,
        },
        SETCOND => IrInst::Setcond {
            dst: r.reg()?,
            a: r.ri()?,
            b: r.ri()?,
            cond: r.cond()?,
        },
        SETCOND2 => IrInst::Setcond2 {
            dst: r.reg()?,
            al: r.ri()?,
            ah: r.ri()?,
            bl: r.ri()?,
            bh: r.ri()?,
            cond: r.cond()?,
        },
        LD8U => host_load(HostLoad::U8, r)?,
        LD8S => host_load(HostLoad::S8, r)?,
        LD16U => host_load(HostLoad::U16, r)?,
        LD16S => host_load(HostLoad::S16, r)?,
        LD32 => host_load(HostLoad::U32, r)?,
        ST8 => host_store(MemSize::U8, r)?,
        ST16 => host_store(MemSize::U16, r)?,
        ST32 => host_store(MemSize::U32, r)?,
        ADD => binary(BinOp::Add, r)?,
        SUB => binary(BinOp::Sub, r)?,
        MUL => binary(BinOp::Mul, r)?,
        AND => binary(BinOp::And, r)?,
        OR => binary(BinOp::Or, r)?,
        XOR => binary(BinOp::Xor, r)?,
        SHL => binary(BinOp::Shl, r)?,
        SHR => binary(BinOp::Shr, r)?,
        SAR => binary(BinOp::Sar, r)?,
        ROTL => binary(BinOp::Rotl, r)?,
        ROTR => binary(BinOp::Rotr, r)?,
        DIV => binary(BinOp::Div, r)?,
        DIVU => binary(BinOp::Divu, r)?,
        REM => binary(BinOp::Rem, r)?,
        REMU => binary(BinOp::Remu, r)?,
        NOT => unary(UnOp::Not, r)?,
        NEG => unary(UnOp::Neg, r)?,
        EXT8S => unary(UnOp::Ext8s, r)?,
        EXT16S => unary(UnOp::Ext16s, r)?,
        EXT8U => unary(UnOp::Ext8u, r)?,
        EXT16U => unary(UnOp::Ext16u, r)?,
        ADD2 => pair(PairOp::Add, r)?,
        SUB2 => pair(PairOp::Sub, r)?,
        MULU2 => IrInst::Mulu2 {
            lo: r.reg()?,
            hi: r.reg()?,
            a: r.ri()?,
            b: r.ri()?,
        },
        BR => IrInst::Br { target: r.u32()? },
        BRCOND => IrInst::Brcond {
            a: r.ri()?,
            b: r.ri()?,
            cond: r.cond()?,
            target: r.u32()?,
        },
        BRCOND2 => IrInst::Brcond2 {
            al: r.ri()?,
            ah: r.ri()?,
            bl: r.ri()?,
            bh: r.ri()?,
            cond: r.cond()?,
            target: r.u32()?,
        },
        GOTO_TB => IrInst::GotoTb { offset: r.i32()? },
        EXIT_TB => IrInst::ExitTb { code: r.u32()? },
        CALL => IrInst::Call { func: r.ri()? },
        GUEST_LD => IrInst::GuestLd {
            dst: r.reg()?,
            addr: r.ri()?,
            op: r.memop(false)?,
        },
        GUEST_LD64 => IrInst::GuestLd64 {
            lo: r.reg()?,
            hi: r.reg()?,
            addr: r.ri()?,
            op: r.memop(true)?,
        },
        GUEST_ST => IrInst::GuestSt {
            src: r.ri()?,
            addr: r.ri()?,
            op: r.memop(false)?,
        },
        GUEST_ST64 => IrInst::GuestSt64 {
            lo: r.ri()?,
            hi: r.ri()?,
            addr: r.ri()?,
            op: r.memop(true)?,
        },
        MB => IrInst::Mb,
        _ => {
            return Err(DecodeError::UnknownOpcode {
                address: r.address,
                opcode,
            })
        }
    };
    Ok(inst)
}
