//! IR assembler.
//!
//! Producers (and tests) build instruction streams with this instead of hand-packing bytes.
//! Forward branches go through [`Label`]s that are patched in [`IrAssembler::finish`].

use tbjit_types::{Address, Cond, MemOp, MemSize, Reg};

use super::{BinOp, HostLoad, IrInst, Operand, PairOp, UnOp, CONST_TAG, HEADER_LEN};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Clone, Copy, Debug)]
enum FixupKind {
    /// Absolute `u32` address.
    Absolute,
    /// `i32` relative to the end of the instruction.
    Relative { next_address: Address },
}

#[derive(Clone, Copy, Debug)]
struct Fixup {
    at: usize,
    label: Label,
    kind: FixupKind,
}

pub struct IrAssembler {
    base: Address,
    bytes: Vec<u8>,
    labels: Vec<Option<Address>>,
    fixups: Vec<Fixup>,
}

impl IrAssembler {
    pub fn new(base: Address) -> Self {
        Self {
            base,
            bytes: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    /// Address the next emitted instruction will occupy.
    pub fn here(&self) -> Address {
        self.base + self.bytes.len() as u32
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        let here = self.here();
        let slot = &mut self.labels[label.0];
        assert!(slot.is_none(), "label {label:?} bound twice");
        *slot = Some(here);
    }

    /// Encode `inst` and return its address.
    pub fn emit(&mut self, inst: IrInst) -> Address {
        let address = self.here();
        encode(&inst, &mut self.bytes);
        address
    }

    /// Resolve labels and return the encoded stream.
    pub fn finish(mut self) -> Vec<u8> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = self.labels[fixup.label.0]
                .unwrap_or_else(|| panic!("label {:?} used but never bound", fixup.label));
            let value = match fixup.kind {
                FixupKind::Absolute => target,
                FixupKind::Relative { next_address } => target.wrapping_sub(next_address),
            };
            self.bytes[fixup.at..fixup.at + 4].copy_from_slice(&value.to_le_bytes());
        }
        self.bytes
    }

    fn emit_with_fixup(&mut self, inst: IrInst, label: Label, relative: bool) -> Address {
        let address = self.emit(inst);
        // Every label-carrying instruction ends with its 4-byte target.
        let at = self.bytes.len() - 4;
        let kind = if relative {
            FixupKind::Relative {
                next_address: self.here(),
            }
        } else {
            FixupKind::Absolute
        };
        self.fixups.push(Fixup { at, label, kind });
        address
    }

    pub fn movi(&mut self, dst: Reg, imm: u32) -> Address {
        self.emit(IrInst::Movi { dst, imm })
    }

    pub fn mov(&mut self, dst: Reg, src: impl Into<Operand>) -> Address {
        self.emit(IrInst::Mov {
            dst,
            src: src.into(),
        })
    }

    pub fn binary(
        &mut self,
        op: BinOp,
        dst: Reg,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
    ) -> Address {
        self.emit(IrInst::Binary {
            op,
            dst,
            a: a.into(),
            b: b.into(),
        })
    }

    pub fn unary(&mut self, op: UnOp, dst: Reg, src: impl Into<Operand>) -> Address {
        self.emit(IrInst::Unary {
            op,
            dst,
            src: src.into(),
        })
    }

    pub fn setcond(
        &mut self,
        cond: Cond,
        dst: Reg,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
    ) -> Address {
        self.emit(IrInst::Setcond {
            dst,
            cond,
            a: a.into(),
            b: b.into(),
        })
    }

    pub fn ld(&mut self, kind: HostLoad, dst: Reg, base: impl Into<Operand>, offset: i32) -> Address {
        self.emit(IrInst::Ld {
            kind,
            dst,
            base: base.into(),
            offset,
        })
    }

    pub fn st(
        &mut self,
        size: MemSize,
        src: impl Into<Operand>,
        base: impl Into<Operand>,
        offset: i32,
    ) -> Address {
        self.emit(IrInst::St {
            size,
            src: src.into(),
            base: base.into(),
            offset,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn pair(
        &mut self,
        op: PairOp,
        lo: Reg,
        hi: Reg,
        al: impl Into<Operand>,
        ah: impl Into<Operand>,
        bl: impl Into<Operand>,
        bh: impl Into<Operand>,
    ) -> Address {
        self.emit(IrInst::Pair {
            op,
            lo,
            hi,
            al: al.into(),
            ah: ah.into(),
            bl: bl.into(),
            bh: bh.into(),
        })
    }

    pub fn mulu2(
        &mut self,
        lo: Reg,
        hi: Reg,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
    ) -> Address {
        self.emit(IrInst::Mulu2 {
            lo,
            hi,
            a: a.into(),
            b: b.into(),
        })
    }

    pub fn br(&mut self, label: Label) -> Address {
        self.emit_with_fixup(IrInst::Br { target: 0 }, label, false)
    }

    /// Branch to an absolute address that may lie outside this stream.
    pub fn br_addr(&mut self, target: Address) -> Address {
        self.emit(IrInst::Br { target })
    }

    pub fn brcond(
        &mut self,
        cond: Cond,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
        label: Label,
    ) -> Address {
        let inst = IrInst::Brcond {
            cond,
            a: a.into(),
            b: b.into(),
            target: 0,
        };
        self.emit_with_fixup(inst, label, false)
    }

    pub fn brcond_addr(
        &mut self,
        cond: Cond,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
        target: Address,
    ) -> Address {
        self.emit(IrInst::Brcond {
            cond,
            a: a.into(),
            b: b.into(),
            target,
        })
    }

    pub fn goto_tb(&mut self, label: Label) -> Address {
        self.emit_with_fixup(IrInst::GotoTb { offset: 0 }, label, true)
    }

    pub fn goto_tb_offset(&mut self, offset: i32) -> Address {
        self.emit(IrInst::GotoTb { offset })
    }

    pub fn exit_tb(&mut self, code: u32) -> Address {
        self.emit(IrInst::ExitTb { code })
    }

    pub fn call(&mut self, func: impl Into<Operand>) -> Address {
        self.emit(IrInst::Call { func: func.into() })
    }

    pub fn guest_ld(&mut self, dst: Reg, addr: impl Into<Operand>, op: MemOp) -> Address {
        self.emit(IrInst::GuestLd {
            dst,
            addr: addr.into(),
            op,
        })
    }

    pub fn guest_st(&mut self, src: impl Into<Operand>, addr: impl Into<Operand>, op: MemOp) -> Address {
        self.emit(IrInst::GuestSt {
            src: src.into(),
            addr: addr.into(),
            op,
        })
    }

    pub fn guest_ld64(&mut self, lo: Reg, hi: Reg, addr: impl Into<Operand>, op: MemOp) -> Address {
        self.emit(IrInst::GuestLd64 {
            lo,
            hi,
            addr: addr.into(),
            op,
        })
    }

    pub fn guest_st64(
        &mut self,
        lo: impl Into<Operand>,
        hi: impl Into<Operand>,
        addr: impl Into<Operand>,
        op: MemOp,
    ) -> Address {
        self.emit(IrInst::GuestSt64 {
            lo: lo.into(),
            hi: hi.into(),
            addr: addr.into(),
            op,
        })
    }
}

/// Append the encoding of `inst` to `out`.
pub fn encode(inst: &IrInst, out: &mut Vec<u8>) {
    let start = out.len();
    out.push(inst.opcode());
    out.push(0);

    let reg = |out: &mut Vec<u8>, r: Reg| out.push(r.as_u8());
    let ri = |out: &mut Vec<u8>, op: Operand| match op {
        Operand::Reg(r) => out.push(r.as_u8()),
        Operand::Const(v) => {
            out.push(CONST_TAG);
            out.extend_from_slice(&v.to_le_bytes());
        }
    };
    let u32le = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());
    let memop = |out: &mut Vec<u8>, op: MemOp| out.extend_from_slice(&op.encode().to_le_bytes());

    match *inst {
        IrInst::Mov { dst, src } => {
            reg(out, dst);
            ri(out, src);
        }
        IrInst::Movi { dst, imm } => {
            reg(out, dst);
            u32le(out, imm);
        }
        IrInst::Setcond { dst, cond, a, b } => {
            reg(out, dst);
            ri(out, a);
            ri(out, b);
            out.push(cond.as_u8());
        }
        IrInst::Setcond2 {
            dst,
            cond,
            al,
            ah,
            bl,
            bh,
        } => {
            reg(out, dst);
            for op in [al, ah, bl, bh] {
                ri(out, op);
            }
            out.push(cond.as_u8());
        }
        IrInst::Ld {
            dst, base, offset, ..
        } => {
            reg(out, dst);
            ri(out, base);
            u32le(out, offset as u32);
        }
        IrInst::St {
            size,
            src,
            base,
            offset,
        } => {
            assert!(size != MemSize::U64, "context stores are at most 32 bits");
            ri(out, src);
            ri(out, base);
            u32le(out, offset as u32);
        }
        IrInst::Binary { dst, a, b, .. } => {
            reg(out, dst);
            ri(out, a);
            ri(out, b);
        }
        IrInst::Unary { dst, src, .. } => {
            reg(out, dst);
            ri(out, src);
        }
        IrInst::Pair {
            lo,
            hi,
            al,
            ah,
            bl,
            bh,
            ..
        } => {
            reg(out, lo);
            reg(out, hi);
            for op in [al, ah, bl, bh] {
                ri(out, op);
            }
        }
        IrInst::Mulu2 { lo, hi, a, b } => {
            reg(out, lo);
            reg(out, hi);
            ri(out, a);
            ri(out, b);
        }
        IrInst::Br { target } => u32le(out, target),
        IrInst::Brcond { cond, a, b, target } => {
            ri(out, a);
            ri(out, b);
            out.push(cond.as_u8());
            u32le(out, target);
        }
        IrInst::Brcond2 {
            cond,
            al,
            ah,
            bl,
            bh,
            target,
        } => {
            for op in [al, ah, bl, bh] {
                ri(out, op);
            }
            out.push(cond.as_u8());
            u32le(out, target);
        }
        IrInst::GotoTb { offset } => u32le(out, offset as u32),
        IrInst::ExitTb { code } => u32le(out, code),
        IrInst::Call { func } => ri(out, func),
        IrInst::GuestLd { dst, addr, op } => {
            assert!(op.size != MemSize::U64, "64-bit loads need a register pair");
            reg(out, dst);
            ri(out, addr);
            memop(out, op);
        }
        IrInst::GuestLd64 { lo, hi, addr, op } => {
            reg(out, lo);
            reg(out, hi);
            ri(out, addr);
            memop(out, op);
        }
        IrInst::GuestSt { src, addr, op } => {
            assert!(op.size != MemSize::U64, "64-bit stores need a register pair");
            ri(out, src);
            ri(out, addr);
            memop(out, op);
        }
        IrInst::GuestSt64 { lo, hi, addr, op } => {
            ri(out, lo);
            ri(out, hi);
            ri(out, addr);
            memop(out, op);
        }
        IrInst::Mb => {}
    }

    let size = out.len() - start;
    assert!(size <= u8::MAX as usize && size >= HEADER_LEN as usize);
    out[start + 1] = size as u8;
}
