//! Reference interpreter for the IR.
//!
//! This is the ground truth the compiled tier must agree with, and the default interpreter of
//! [`crate::ExecDriver`].

use tbjit_types::regs::{CALL_ARG_REGS, CALL_RET_HI, CALL_RET_LO};
use tbjit_types::{Address, MemSize};
use thiserror::Error;

use crate::ir::{decode_at, BinOp, DecodeError, IrInst, Operand, PairOp, UnOp};
use crate::machine::{HelperFault, Machine, MemFault};

/// Why a block stopped abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExceptionKind {
    #[error(transparent)]
    Memory(#[from] MemFault),
    #[error(transparent)]
    Helper(#[from] HelperFault),
    #[error("integer division by zero")]
    DivideByZero,
    #[error(transparent)]
    InvalidInstruction(#[from] DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("guest exception at {address:#x}: {kind}")]
pub struct GuestException {
    /// Instruction address for interpreted code, block entry for compiled code.
    pub address: Address,
    pub kind: ExceptionKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecResult {
    /// `exit_tb` reached.
    Exit(u32),
    /// Control moved to another block entry (or the step budget ran out) at this address.
    Chain(Address),
    Exception(GuestException),
}

pub trait Interpreter<M> {
    fn interpret(&mut self, machine: &mut M, address: Address) -> ExecResult;
}

#[derive(Debug, Clone)]
pub struct RefInterpreter {
    step_budget: u32,
}

impl RefInterpreter {
    pub fn new(step_budget: u32) -> Self {
        assert!(step_budget > 0, "interpreter step budget must be non-zero");
        Self { step_budget }
    }
}

impl Default for RefInterpreter {
    fn default() -> Self {
        Self::new(crate::JitConfig::default().interpreter_step_budget)
    }
}

enum Flow {
    Next,
    Jump(Address),
    Chain(Address),
    Exit(u32),
}

impl<M: Machine> Interpreter<M> for RefInterpreter {
    fn interpret(&mut self, machine: &mut M, address: Address) -> ExecResult {
        let mut pc = address;
        for _ in 0..self.step_budget {
            let decoded = match decode_at(&*machine, pc) {
                Ok(d) => d,
                Err(e) => return exception(pc, e.into()),
            };
            match step(machine, &decoded.inst, pc, decoded.next_address()) {
                Ok(Flow::Next) => pc = decoded.next_address(),
                Ok(Flow::Jump(target)) => pc = target,
                Ok(Flow::Chain(target)) => return ExecResult::Chain(target),
                Ok(Flow::Exit(code)) => return ExecResult::Exit(code),
                Err(kind) => return exception(pc, kind),
            }
        }
        ExecResult::Chain(pc)
    }
}

fn exception(address: Address, kind: ExceptionKind) -> ExecResult {
    ExecResult::Exception(GuestException { address, kind })
}

fn read<M: Machine>(m: &M, op: Operand) -> u32 {
    match op {
        Operand::Reg(r) => m.reg(r),
        Operand::Const(v) => v,
    }
}

fn pair<M: Machine>(m: &M, lo: Operand, hi: Operand) -> u64 {
    u64::from(read(m, lo)) | (u64::from(read(m, hi)) << 32)
}

fn step<M: Machine>(
    m: &mut M,
    inst: &IrInst,
    pc: Address,
    next: Address,
) -> Result<Flow, ExceptionKind> {
    match *inst {
        IrInst::Mov { dst, src } => {
            let v = read(m, src);
            m.set_reg(dst, v);
        }
        IrInst::Movi { dst, imm } => m.set_reg(dst, imm),
        IrInst::Setcond { dst, cond, a, b } => {
            let v = cond.eval32(read(m, a), read(m, b));
            m.set_reg(dst, v as u32);
        }
        IrInst::Setcond2 {
            dst,
            cond,
            al,
            ah,
            bl,
            bh,
        } => {
            let v = cond.eval64(pair(m, al, ah), pair(m, bl, bh));
            m.set_reg(dst, v as u32);
        }
        IrInst::Ld {
            kind,
            dst,
            base,
            offset,
        } => {
            let addr = read(m, base).wrapping_add(offset as u32);
            let raw = m.host_load(addr, kind.size())?;
            let v = match (kind.size(), kind.is_signed()) {
                (MemSize::U8, true) => raw as u8 as i8 as i32 as u32,
                (MemSize::U16, true) => raw as u16 as i16 as i32 as u32,
                _ => raw,
            };
            m.set_reg(dst, v);
        }
        IrInst::St {
            size,
            src,
            base,
            offset,
        } => {
            let addr = read(m, base).wrapping_add(offset as u32);
            let v = read(m, src);
            m.host_store(addr, size, v)?;
        }
        IrInst::Binary { op, dst, a, b } => {
            let v = binary(op, read(m, a), read(m, b))?;
            m.set_reg(dst, v);
        }
        IrInst::Unary { op, dst, src } => {
            let v = read(m, src);
            let v = match op {
                UnOp::Not => !v,
                UnOp::Neg => v.wrapping_neg(),
                UnOp::Ext8s => v as u8 as i8 as i32 as u32,
                UnOp::Ext16s => v as u16 as i16 as i32 as u32,
                UnOp::Ext8u => v & 0xff,
                UnOp::Ext16u => v & 0xffff,
            };
            m.set_reg(dst, v);
        }
        IrInst::Pair {
            op,
            lo,
            hi,
            al,
            ah,
            bl,
            bh,
        } => {
            let (a, b) = (pair(m, al, ah), pair(m, bl, bh));
            let v = match op {
                PairOp::Add => a.wrapping_add(b),
                PairOp::Sub => a.wrapping_sub(b),
            };
            m.set_reg(lo, v as u32);
            m.set_reg(hi, (v >> 32) as u32);
        }
        IrInst::Mulu2 { lo, hi, a, b } => {
            let v = u64::from(read(m, a)) * u64::from(read(m, b));
            m.set_reg(lo, v as u32);
            m.set_reg(hi, (v >> 32) as u32);
        }
        IrInst::Br { target } => return Ok(Flow::Jump(target)),
        IrInst::Brcond { cond, a, b, target } => {
            if cond.eval32(read(m, a), read(m, b)) {
                return Ok(Flow::Jump(target));
            }
        }
        IrInst::Brcond2 {
            cond,
            al,
            ah,
            bl,
            bh,
            target,
        } => {
            if cond.eval64(pair(m, al, ah), pair(m, bl, bh)) {
                return Ok(Flow::Jump(target));
            }
        }
        IrInst::GotoTb { offset } => return Ok(Flow::Chain(next.wrapping_add(offset as u32))),
        IrInst::ExitTb { code } => return Ok(Flow::Exit(code)),
        IrInst::Call { func } => {
            let func = read(m, func);
            let args = CALL_ARG_REGS.map(|r| m.reg(r));
            let v = m.call_helper(func, args)?;
            m.set_reg(CALL_RET_LO, v as u32);
            m.set_reg(CALL_RET_HI, (v >> 32) as u32);
        }
        IrInst::GuestLd { dst, addr, op } => {
            let raw = m.guest_load(read(m, addr), op, pc)?;
            m.set_reg(dst, op.extend(raw) as u32);
        }
        IrInst::GuestLd64 { lo, hi, addr, op } => {
            let v = op.extend(m.guest_load(read(m, addr), op, pc)?);
            m.set_reg(lo, v as u32);
            m.set_reg(hi, (v >> 32) as u32);
        }
        IrInst::GuestSt { src, addr, op } => {
            let (v, a) = (read(m, src), read(m, addr));
            m.guest_store(a, op, u64::from(v), pc)?;
        }
        IrInst::GuestSt64 { lo, hi, addr, op } => {
            let (v, a) = (pair(m, lo, hi), read(m, addr));
            m.guest_store(a, op, v, pc)?;
        }
        IrInst::Mb => {}
    }
    Ok(Flow::Next)
}

fn binary(op: BinOp, a: u32, b: u32) -> Result<u32, ExceptionKind> {
    let (sa, sb) = (a as i32, b as i32);
    let v = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a << (b & 31),
        BinOp::Shr => a >> (b & 31),
        BinOp::Sar => (sa >> (b & 31)) as u32,
        BinOp::Rotl => a.rotate_left(b & 31),
        BinOp::Rotr => a.rotate_right(b & 31),
        BinOp::Div | BinOp::Divu | BinOp::Rem | BinOp::Remu if b == 0 => {
            return Err(ExceptionKind::DivideByZero)
        }
        BinOp::Div => sa.wrapping_div(sb) as u32,
        BinOp::Divu => a / b,
        BinOp::Rem => sa.wrapping_rem(sb) as u32,
        BinOp::Remu => a % b,
    };
    Ok(v)
}
