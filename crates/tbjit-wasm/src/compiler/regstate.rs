//! Loaded/dirty register tracking across the basic blocks of one translation block.
//!
//! A register is *loaded* when its wasm local holds the current value and *dirty* when that value
//! has not yet been written back to the shared bank. `loaded` is a must-property (intersection at
//! joins), `dirty` a may-property (union at joins, restricted to what is loaded).

use std::fmt;

use tbjit_core::ir::{IrInst, Operand};
use tbjit_types::regs::{CALL_ARG_REGS, CALL_RET_HI, CALL_RET_LO, REG_CALL_STACK, REG_ENV};
use tbjit_types::{Reg, NUM_REGS};

use super::cfg::{BasicBlock, Cfg, Exit};

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub(crate) struct RegSet(u16);

impl RegSet {
    pub(crate) const EMPTY: RegSet = RegSet(0);
    pub(crate) const ALL: RegSet = RegSet(((1u32 << NUM_REGS) - 1) as u16);

    pub(crate) fn of(regs: impl IntoIterator<Item = Reg>) -> Self {
        regs.into_iter().fold(Self::EMPTY, |set, r| set.with(r))
    }

    #[must_use]
    pub(crate) fn with(self, reg: Reg) -> Self {
        RegSet(self.0 | reg.bit())
    }

    pub(crate) fn contains(self, reg: Reg) -> bool {
        self.0 & reg.bit() != 0
    }

    #[must_use]
    pub(crate) fn union(self, other: Self) -> Self {
        RegSet(self.0 | other.0)
    }

    #[must_use]
    pub(crate) fn intersect(self, other: Self) -> Self {
        RegSet(self.0 & other.0)
    }

    #[must_use]
    pub(crate) fn minus(self, other: Self) -> Self {
        RegSet(self.0 & !other.0)
    }

    /// Members in ascending register order.
    pub(crate) fn iter(self) -> impl Iterator<Item = Reg> {
        Reg::all().filter(move |r| self.contains(*r))
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RegState {
    pub(crate) loaded: RegSet,
    pub(crate) dirty: RegSet,
}

impl RegState {
    /// State on entry to the compiled function: `env` and `sp` arrive as parameters.
    pub(crate) fn prologue() -> Self {
        let ctx = RegSet::of([REG_ENV, REG_CALL_STACK]);
        Self {
            loaded: ctx,
            dirty: ctx,
        }
    }

    pub(crate) fn apply(&mut self, effect: &Effect) {
        self.loaded = self.loaded.union(effect.reads);
        if effect.calls_out {
            self.dirty = RegSet::EMPTY;
        }
        self.loaded = self.loaded.union(effect.writes);
        self.dirty = self.dirty.union(effect.writes);
    }
}

/// Register footprint of one instruction, in emission order: reads, then the optional bridge
/// call (which flushes every dirty register), then writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Effect {
    pub(crate) reads: RegSet,
    pub(crate) writes: RegSet,
    pub(crate) calls_out: bool,
}

fn regs_of(ops: &[Operand]) -> RegSet {
    ops.iter().fold(RegSet::EMPTY, |set, op| match *op {
        Operand::Reg(r) => set.with(r),
        Operand::Const(_) => set,
    })
}

pub(crate) fn effect(inst: &IrInst) -> Effect {
    let pure = |reads: &[Operand], writes: &[Reg]| Effect {
        reads: regs_of(reads),
        writes: RegSet::of(writes.iter().copied()),
        calls_out: false,
    };
    let bridged = |reads: &[Operand], writes: &[Reg]| Effect {
        calls_out: true,
        ..pure(reads, writes)
    };
    match *inst {
        IrInst::Mov { dst, src } => pure(&[src], &[dst]),
        IrInst::Movi { dst, .. } => pure(&[], &[dst]),
        IrInst::Setcond { dst, a, b, .. } => pure(&[a, b], &[dst]),
        IrInst::Setcond2 {
            dst, al, ah, bl, bh, ..
        } => pure(&[al, ah, bl, bh], &[dst]),
        IrInst::Ld { dst, base, .. } => pure(&[base], &[dst]),
        IrInst::St { src, base, .. } => pure(&[src, base], &[]),
        IrInst::Binary { dst, a, b, .. } => pure(&[a, b], &[dst]),
        IrInst::Unary { dst, src, .. } => pure(&[src], &[dst]),
        IrInst::Pair {
            lo,
            hi,
            al,
            ah,
            bl,
            bh,
            ..
        } => bridged(&[al, ah, bl, bh], &[lo, hi]),
        IrInst::Mulu2 { lo, hi, a, b } => bridged(&[a, b], &[lo, hi]),
        IrInst::Call { func } => {
            let mut e = bridged(&[func], &[CALL_RET_LO, CALL_RET_HI]);
            e.reads = e.reads.union(RegSet::of(CALL_ARG_REGS));
            e
        }
        IrInst::GuestLd { dst, addr, .. } => bridged(&[addr], &[dst]),
        IrInst::GuestLd64 { lo, hi, addr, .. } => bridged(&[addr], &[lo, hi]),
        IrInst::GuestSt { src, addr, .. } => bridged(&[src, addr], &[]),
        IrInst::GuestSt64 { lo, hi, addr, .. } => bridged(&[lo, hi, addr], &[]),
        IrInst::Brcond { a, b, .. } => pure(&[a, b], &[]),
        IrInst::Brcond2 { al, ah, bl, bh, .. } => pure(&[al, ah, bl, bh], &[]),
        IrInst::Br { .. } | IrInst::GotoTb { .. } | IrInst::ExitTb { .. } | IrInst::Mb => {
            Effect::default()
        }
    }
}

/// Registers the block's exit reads before leaving.
pub(crate) fn exit_reads(exit: &Exit) -> RegSet {
    match exit {
        Exit::Branch { test, .. } => regs_of(&test.operands()),
        _ => RegSet::EMPTY,
    }
}

/// State at the end of `block` given the state at its start, before any edge flush.
pub(crate) fn transfer(block: &BasicBlock, entry: RegState) -> RegState {
    let mut state = entry;
    for d in &block.insts {
        state.apply(&effect(&d.inst));
    }
    state.loaded = state.loaded.union(exit_reads(&block.exit));
    state
}

#[derive(Debug)]
pub(crate) struct Dataflow {
    pub(crate) entry: Vec<RegState>,
    pub(crate) exit: Vec<RegState>,
}

impl Dataflow {
    /// Registers written back on the edge `from -> to`.
    pub(crate) fn edge_flush(&self, from: usize, to: usize) -> RegSet {
        self.exit[from].dirty.minus(self.entry[to].loaded)
    }
}

pub(crate) fn analyze(cfg: &Cfg) -> Dataflow {
    let reachable = cfg.reachable();
    // Edges out of dead blocks never run, so they take no part in any meet.
    let preds: Vec<Vec<usize>> = cfg
        .predecessors()
        .into_iter()
        .map(|ps| ps.into_iter().filter(|&p| reachable[p]).collect())
        .collect();
    let n = cfg.len();

    let mut entry: Vec<RegState> = (0..n)
        .map(|id| {
            if reachable[id] {
                RegState {
                    loaded: RegSet::ALL,
                    dirty: RegSet::EMPTY,
                }
            } else {
                RegState::default()
            }
        })
        .collect();
    let mut exit: Vec<RegState> = (0..n).map(|id| transfer(&cfg.blocks[id], entry[id])).collect();

    loop {
        let mut changed = false;
        for id in 0..n {
            if !reachable[id] {
                continue;
            }
            let mut incoming: Vec<RegState> = preds[id].iter().map(|&p| exit[p]).collect();
            if id == Cfg::ENTRY {
                incoming.push(RegState::prologue());
            }
            let loaded = incoming
                .iter()
                .fold(RegSet::ALL, |acc, s| acc.intersect(s.loaded));
            let dirty = incoming
                .iter()
                .fold(RegSet::EMPTY, |acc, s| acc.union(s.dirty))
                .intersect(loaded);
            let state = RegState { loaded, dirty };
            if state != entry[id] {
                entry[id] = state;
                exit[id] = transfer(&cfg.blocks[id], state);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    Dataflow { entry, exit }
}
